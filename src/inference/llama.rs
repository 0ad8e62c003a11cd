//! llama.cpp backend
//!
//! [`NativeEngine`] over `llama-cpp-2`. Models, contexts and batches live in
//! handle tables keyed by ids that are never reused. Sampling is greedy.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};
use std::num::NonZeroU32;
use std::path::Path;
use std::time::Instant;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::{LlamaBackend, NumaStrategy};
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use crate::inference::bench::{format_report, BenchModel, BenchParams};
use crate::inference::generation::GenerationCursor;
use crate::inference::gguf::probe_gguf;
use crate::inference::logger::LogLevel;
use crate::inference::native::{LogCallback, NativeEngine, NativeError, RawHandle};
use crate::storage::settings::EngineSettings;

/// Context and offload parameters for the llama.cpp backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LlamaSettings {
    pub context_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
}

impl From<&EngineSettings> for LlamaSettings {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            context_size: settings.context_size,
            threads: settings.threads,
            gpu_layers: settings.gpu_layers,
        }
    }
}

struct ModelEntry {
    model: Box<LlamaModel>,
    name: String,
}

struct ContextEntry {
    model: RawHandle,
    ctx: LlamaContext<'static>,
    sampler: LlamaSampler,
    /// Bytes of a token sequence that do not yet form valid UTF-8
    pending: Vec<u8>,
}

/// `NativeEngine` backed by llama.cpp.
pub struct LlamaCppEngine {
    settings: LlamaSettings,
    // Contexts borrow their model, so they are declared (and dropped) first.
    contexts: HashMap<RawHandle, ContextEntry>,
    batches: HashMap<RawHandle, LlamaBatch<'static>>,
    models: HashMap<RawHandle, ModelEntry>,
    backend: Option<LlamaBackend>,
    /// Keeps the callback alive while llama.cpp holds a pointer to it
    logger: Option<Box<LogCallback>>,
    next_handle: RawHandle,
}

impl LlamaCppEngine {
    pub fn new(settings: LlamaSettings) -> Self {
        Self {
            settings,
            contexts: HashMap::new(),
            batches: HashMap::new(),
            models: HashMap::new(),
            backend: None,
            logger: None,
            next_handle: 1,
        }
    }

    fn allocate_handle(&mut self) -> RawHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn context_params(&self) -> LlamaContextParams {
        let params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.settings.context_size))
            .with_n_batch(self.settings.context_size);
        if self.settings.threads > 0 {
            let threads = self.settings.threads as i32;
            params.with_n_threads(threads).with_n_threads_batch(threads)
        } else {
            params
        }
    }
}

fn unknown(kind: &str, handle: RawHandle) -> NativeError {
    NativeError::new(format!("unknown {kind} handle {handle}"))
}

impl NativeEngine for LlamaCppEngine {
    fn init_backend(&mut self, use_numa: bool) -> Result<(), NativeError> {
        if self.backend.is_some() {
            return Ok(());
        }
        let backend = if use_numa {
            LlamaBackend::init_numa(NumaStrategy::DISTRIBUTE)
        } else {
            LlamaBackend::init()
        }
        .map_err(|e| NativeError::new(format!("failed to initialize llama backend: {e}")))?;

        self.backend = Some(backend);
        tracing::info!("LlamaBackend initialized in worker thread");
        Ok(())
    }

    fn system_info(&self) -> String {
        // SAFETY: llama.cpp returns a pointer to a static, NUL-terminated buffer.
        let info = unsafe { CStr::from_ptr(llama_cpp_sys_2::llama_print_system_info()) };
        info.to_string_lossy().trim().to_string()
    }

    fn load_model(&mut self, path: &Path) -> RawHandle {
        let Some(backend) = self.backend.as_ref() else {
            tracing::error!("load_model called before backend init");
            return 0;
        };

        if let Err(e) = probe_gguf(path) {
            tracing::error!("Rejected {}: {e}", path.display());
            return 0;
        }

        let params = LlamaModelParams::default().with_n_gpu_layers(self.settings.gpu_layers);
        let model = match LlamaModel::load_from_file(backend, path, &params) {
            Ok(model) => model,
            Err(e) => {
                tracing::error!("Failed to load model {}: {e}", path.display());
                return 0;
            }
        };

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());
        let handle = self.allocate_handle();
        self.models.insert(
            handle,
            ModelEntry {
                model: Box::new(model),
                name,
            },
        );
        handle
    }

    fn new_context(&mut self, model: RawHandle) -> RawHandle {
        let params = self.context_params();
        let (Some(backend), Some(entry)) = (self.backend.as_ref(), self.models.get(&model)) else {
            tracing::error!("new_context: {}", unknown("model", model));
            return 0;
        };

        // SAFETY: the model is boxed, so its address is stable, and it stays in
        // `self.models` until `free_model`, which drops every context created
        // from it first.
        let model_ref: &'static LlamaModel = unsafe { &*(entry.model.as_ref() as *const LlamaModel) };
        let ctx = match model_ref.new_context(backend, params) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::error!("Failed to create context: {e}");
                return 0;
            }
        };

        let handle = self.allocate_handle();
        self.contexts.insert(
            handle,
            ContextEntry {
                model,
                ctx,
                sampler: LlamaSampler::greedy(),
                pending: Vec::new(),
            },
        );
        handle
    }

    fn new_batch(&mut self, max_tokens: u32, embedding_dim: u32, max_sequences: u32) -> RawHandle {
        if max_tokens == 0 || max_sequences == 0 {
            tracing::error!("Refusing batch of {max_tokens} tokens x {max_sequences} sequences");
            return 0;
        }
        if embedding_dim != 0 {
            tracing::warn!("Embedding batches are not supported; creating a token batch");
        }
        let batch = LlamaBatch::new(max_tokens as usize, max_sequences as i32);
        let handle = self.allocate_handle();
        self.batches.insert(handle, batch);
        handle
    }

    fn free_context(&mut self, context: RawHandle) {
        if self.contexts.remove(&context).is_none() {
            tracing::warn!("free_context: {}", unknown("context", context));
        }
    }

    fn free_model(&mut self, model: RawHandle) {
        let before = self.contexts.len();
        self.contexts.retain(|_, entry| entry.model != model);
        if self.contexts.len() != before {
            tracing::warn!("Dropped {} live contexts of model {model}", before - self.contexts.len());
        }
        if self.models.remove(&model).is_none() {
            tracing::warn!("free_model: {}", unknown("model", model));
        }
    }

    fn free_batch(&mut self, batch: RawHandle) {
        if self.batches.remove(&batch).is_none() {
            tracing::warn!("free_batch: {}", unknown("batch", batch));
        }
    }

    fn prepare_generation(
        &mut self,
        context: RawHandle,
        batch: RawHandle,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<u32, NativeError> {
        let entry = self.contexts.get_mut(&context).ok_or_else(|| unknown("context", context))?;
        let model = self.models.get(&entry.model).ok_or_else(|| unknown("model", entry.model))?;
        let batch = self.batches.get_mut(&batch).ok_or_else(|| unknown("batch", batch))?;

        let tokens = model
            .model
            .str_to_token(prompt, AddBos::Always)
            .map_err(|e| NativeError::new(format!("failed to tokenize: {e}")))?;

        let n_ctx = entry.ctx.n_ctx();
        if max_tokens > n_ctx || tokens.len() > n_ctx as usize {
            return Err(NativeError::new(format!(
                "prompt of {} tokens with limit {max_tokens} does not fit a context of {n_ctx}",
                tokens.len()
            )));
        }
        tracing::debug!("Tokenized prompt into {} tokens", tokens.len());

        batch.clear();
        let last = tokens.len().saturating_sub(1);
        for (i, token) in tokens.iter().enumerate() {
            batch
                .add(*token, i as i32, &[0], i == last)
                .map_err(|e| NativeError::new(format!("failed to add token to batch: {e}")))?;
        }
        entry
            .ctx
            .decode(batch)
            .map_err(|e| NativeError::new(format!("failed to decode prompt: {e}")))?;

        entry.sampler = LlamaSampler::greedy();
        entry.pending.clear();
        Ok(tokens.len() as u32)
    }

    fn produce_next_chunk(
        &mut self,
        context: RawHandle,
        batch: RawHandle,
        max_tokens: u32,
        cursor: &mut GenerationCursor,
    ) -> Result<String, NativeError> {
        let entry = self.contexts.get_mut(&context).ok_or_else(|| unknown("context", context))?;
        let model = self.models.get(&entry.model).ok_or_else(|| unknown("model", entry.model))?;
        let batch = self.batches.get_mut(&batch).ok_or_else(|| unknown("batch", batch))?;

        // Tokens whose bytes end mid-character produce no text; keep decoding
        // until a whole character is available.
        loop {
            let token = entry.sampler.sample(&entry.ctx, batch.n_tokens() - 1);
            entry.sampler.accept(token);

            if model.model.is_eog_token(token) || cursor.position() >= max_tokens {
                entry.pending.clear();
                return Ok(String::new());
            }

            let bytes = model
                .model
                .token_to_bytes(token, Special::Tokenize)
                .map_err(|e| NativeError::new(format!("failed to convert token to bytes: {e}")))?;
            entry.pending.extend_from_slice(&bytes);

            batch.clear();
            batch
                .add(token, cursor.position() as i32, &[0], true)
                .map_err(|e| NativeError::new(format!("failed to add token to batch: {e}")))?;
            entry
                .ctx
                .decode(batch)
                .map_err(|e| NativeError::new(format!("failed to decode: {e}")))?;
            cursor.advance();

            if let Some(text) = take_utf8(&mut entry.pending) {
                return Ok(text);
            }
            if cursor.position() >= max_tokens {
                return Ok(String::new());
            }
        }
    }

    fn clear_kv_cache(&mut self, context: RawHandle) {
        match self.contexts.get_mut(&context) {
            Some(entry) => {
                entry.ctx.clear_kv_cache();
                entry.pending.clear();
            }
            None => tracing::warn!("clear_kv_cache: {}", unknown("context", context)),
        }
    }

    fn benchmark(
        &mut self,
        context: RawHandle,
        model: RawHandle,
        batch: RawHandle,
        params: &BenchParams,
    ) -> Result<String, NativeError> {
        if let Some(problem) = params.check() {
            return Err(NativeError::new(problem));
        }
        let entry = self.contexts.get_mut(&context).ok_or_else(|| unknown("context", context))?;
        let model_entry = self.models.get(&model).ok_or_else(|| unknown("model", model))?;
        let batch = self.batches.get_mut(&batch).ok_or_else(|| unknown("batch", batch))?;

        let decode = |ctx: &mut LlamaContext<'static>, batch: &mut LlamaBatch<'static>| {
            ctx.decode(batch)
                .map_err(|e| NativeError::new(format!("benchmark decode failed: {e}")))
        };
        let add = |batch: &mut LlamaBatch<'static>, pos: u32, seq: i32, logits: bool| {
            batch
                .add(LlamaToken::new(0), pos as i32, &[seq], logits)
                .map_err(|e| NativeError::new(format!("benchmark batch too small: {e}")))
        };

        let mut pp_rates = Vec::with_capacity(params.repetitions as usize);
        let mut tg_rates = Vec::with_capacity(params.repetitions as usize);

        for rep in 0..params.repetitions {
            entry.ctx.clear_kv_cache();
            batch.clear();
            for i in 0..params.prompt_tokens {
                add(batch, i, 0, i + 1 == params.prompt_tokens)?;
            }
            let start = Instant::now();
            decode(&mut entry.ctx, batch)?;
            let pp_secs = start.elapsed().as_secs_f64().max(f64::EPSILON);

            entry.ctx.clear_kv_cache();
            let start = Instant::now();
            for i in 0..params.gen_tokens {
                batch.clear();
                for seq in 0..params.parallel as i32 {
                    add(batch, i, seq, true)?;
                }
                decode(&mut entry.ctx, batch)?;
            }
            let tg_secs = start.elapsed().as_secs_f64().max(f64::EPSILON);
            entry.ctx.clear_kv_cache();

            let pp_rate = f64::from(params.prompt_tokens) / pp_secs;
            let tg_rate = f64::from(params.gen_tokens * params.parallel) / tg_secs;
            tracing::debug!("Bench repetition {rep}: pp {pp_rate:.2} t/s, tg {tg_rate:.2} t/s");
            pp_rates.push(pp_rate);
            tg_rates.push(tg_rate);
        }

        let backend = if self.settings.gpu_layers > 0 { "GPU" } else { "CPU" };
        let description = BenchModel {
            name: model_entry.name.clone(),
            size_bytes: model_entry.model.size() as u64,
            param_count: model_entry.model.n_params() as u64,
            backend: backend.to_string(),
        };
        Ok(format_report(&description, params, &pp_rates, &tg_rates))
    }

    fn install_logger(&mut self, callback: LogCallback) {
        let boxed = Box::new(callback);
        let user_data = boxed.as_ref() as *const LogCallback as *mut c_void;
        // SAFETY: `user_data` points into `self.logger`, which outlives the
        // registration: it is only replaced after a new one is installed and
        // cleared after `remove_logger` unregisters it.
        unsafe { llama_cpp_sys_2::llama_log_set(Some(forward_log), user_data) };
        self.logger = Some(boxed);
    }

    fn remove_logger(&mut self) {
        // SAFETY: a null callback restores llama.cpp's default stderr sink.
        unsafe { llama_cpp_sys_2::llama_log_set(None, std::ptr::null_mut()) };
        self.logger = None;
    }
}

impl Drop for LlamaCppEngine {
    fn drop(&mut self) {
        if self.logger.is_some() {
            self.remove_logger();
        }
        self.contexts.clear();
        self.batches.clear();
        self.models.clear();
        self.backend.take();
    }
}

unsafe extern "C" fn forward_log(
    level: llama_cpp_sys_2::ggml_log_level,
    text: *const c_char,
    user_data: *mut c_void,
) {
    if text.is_null() || user_data.is_null() {
        return;
    }
    let callback = &*(user_data as *const LogCallback);
    let message = CStr::from_ptr(text).to_string_lossy();
    callback(map_level(level), &*message);
}

fn map_level(level: llama_cpp_sys_2::ggml_log_level) -> LogLevel {
    match level {
        llama_cpp_sys_2::GGML_LOG_LEVEL_ERROR => LogLevel::Error,
        llama_cpp_sys_2::GGML_LOG_LEVEL_WARN => LogLevel::Warn,
        llama_cpp_sys_2::GGML_LOG_LEVEL_INFO => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

/// Takes the longest complete UTF-8 prefix out of `buf`.
///
/// Bytes that can never become valid are replaced rather than held forever.
fn take_utf8(buf: &mut Vec<u8>) -> Option<String> {
    let text = match std::str::from_utf8(buf) {
        Ok(s) => {
            let text = s.to_string();
            buf.clear();
            text
        }
        Err(e) if e.valid_up_to() > 0 => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&buf[..valid]).into_owned();
            buf.drain(..valid);
            text
        }
        Err(e) if e.error_len().is_some() => {
            let text = String::from_utf8_lossy(buf).into_owned();
            buf.clear();
            text
        }
        Err(_) => return None,
    };
    (!text.is_empty()).then_some(text)
}
