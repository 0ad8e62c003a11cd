//! Inference engine implementation
//!
//! Owns the native engine and the session state, and runs every operation
//! against them on one dedicated worker thread.
//!
//! # Architecture
//!
//! Native inference libraries bind thread-local state to the thread that
//! initializes them, and their handles are not safe to use concurrently. The
//! native engine is therefore constructed on a dedicated worker thread and
//! never leaves it. Callers submit jobs over a FIFO channel and await the
//! reply on a oneshot channel, so no caller thread blocks while waiting.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tokio::sync::{mpsc as token_channel, oneshot};

use crate::inference::bench::BenchParams;
use crate::inference::generation::{self, DEFAULT_MAX_TOKENS};
use crate::inference::logger::{Logger, LoggerBridge};
use crate::inference::native::{NativeEngine, NativeError};
use crate::inference::session::{BatchShape, HandleSet, Resource, SessionState};
use crate::inference::streaming::{StreamToken, TokenStream};
use crate::storage::settings::EngineSettings;

/// Errors that can occur during engine operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Failed to acquire {0} handle")]
    AcquisitionFailure(Resource),

    #[error("Engine startup failed: {0}")]
    StartupFailed(String),

    #[error("Native engine error: {0}")]
    Native(String),

    #[error("Worker job panicked: {0}")]
    WorkerPanic(String),

    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),
}

impl From<NativeError> for EngineError {
    fn from(e: NativeError) -> Self {
        EngineError::Native(e.0)
    }
}

/// Worker-side options fixed at engine construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Enable NUMA-aware backend initialization
    pub use_numa: bool,
    /// Upper bound on the generation cursor
    pub max_tokens: u32,
    /// Shape of the batch created on load
    pub batch: BatchShape,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            use_numa: false,
            max_tokens: DEFAULT_MAX_TOKENS,
            batch: BatchShape::default(),
        }
    }
}

impl From<&EngineSettings> for EngineOptions {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            use_numa: settings.use_numa,
            max_tokens: settings.max_tokens,
            batch: BatchShape {
                max_tokens: settings.batch_tokens,
                embedding_dim: settings.embedding_dim,
                max_sequences: settings.max_sequences,
            },
        }
    }
}

type NativeFactory = Box<dyn FnOnce() -> Result<Box<dyn NativeEngine>, NativeError> + Send>;

/// A unit of work. Receives the worker, or the startup error if the worker
/// never came up.
pub(crate) type Job = Box<dyn FnOnce(Result<&mut Worker, EngineError>) + Send>;

/// Commands sent to the worker thread
enum WorkerCommand {
    Run(Job),
    Shutdown,
}

enum WorkerSlot {
    Pending {
        factory: NativeFactory,
        options: EngineOptions,
    },
    Running {
        command_tx: Sender<WorkerCommand>,
        handle: JoinHandle<()>,
    },
    Failed(EngineError),
    Stopped,
}

impl WorkerSlot {
    /// Returns the command channel, spawning the worker on first use.
    fn sender(&mut self) -> Result<&Sender<WorkerCommand>, EngineError> {
        if matches!(self, WorkerSlot::Pending { .. }) {
            if let WorkerSlot::Pending { factory, options } =
                std::mem::replace(self, WorkerSlot::Stopped)
            {
                *self = match spawn_worker(factory, options) {
                    Ok(running) => running,
                    Err(e) => WorkerSlot::Failed(e),
                };
            }
        }

        match self {
            WorkerSlot::Running { command_tx, .. } => Ok(command_tx),
            WorkerSlot::Failed(e) => Err(e.clone()),
            _ => Err(EngineError::WorkerUnavailable(
                "engine has been shut down".to_string(),
            )),
        }
    }
}

/// Lifecycle manager for one native inference engine.
///
/// The worker thread starts lazily on the first operation. Dropping the
/// engine unloads any loaded model, stops the worker and joins it.
pub struct InferenceEngine {
    worker: Mutex<WorkerSlot>,
    options: EngineOptions,
}

impl InferenceEngine {
    /// Creates an engine whose native backend is built by `factory` on the
    /// worker thread.
    pub fn new<N, F>(factory: F, options: EngineOptions) -> Self
    where
        N: NativeEngine + 'static,
        F: FnOnce() -> Result<N, NativeError> + Send + 'static,
    {
        let factory: NativeFactory =
            Box::new(move || factory().map(|native| Box::new(native) as Box<dyn NativeEngine>));
        Self {
            worker: Mutex::new(WorkerSlot::Pending { factory, options }),
            options,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Loads the model at `path` and creates its context and batch.
    pub async fn load<P: AsRef<Path>>(&self, path: P) -> Result<(), EngineError> {
        let path = path.as_ref().to_path_buf();
        self.submit(move |worker| worker.load(&path)).await
    }

    /// Releases the loaded model, if any.
    pub async fn unload(&self) -> Result<(), EngineError> {
        self.submit(|worker| {
            worker.unload();
            Ok(())
        })
        .await
    }

    /// Returns true if a model is currently loaded
    pub async fn is_loaded(&self) -> Result<bool, EngineError> {
        self.submit(|worker| Ok(worker.session.is_loaded())).await
    }

    /// Streams the completion of `prompt`.
    ///
    /// Nothing is submitted until the stream is first polled. Dropping the
    /// stream cancels the generation; the worker still clears the KV cache
    /// before it runs the next job.
    pub fn generate(&self, prompt: impl Into<String>) -> TokenStream<'_> {
        let prompt = prompt.into();
        let max_tokens = self.options.max_tokens;
        let (token_tx, token_rx) = token_channel::channel(1);

        let job: Job = Box::new(move |worker: Result<&mut Worker, EngineError>| {
            if token_tx.is_closed() {
                tracing::debug!("Generation dropped before it started");
                return;
            }
            let result = worker.and_then(|w| guarded(|| w.generate(&prompt, max_tokens, &token_tx)));
            let last = match result {
                Ok(()) => StreamToken::Done,
                Err(e) => StreamToken::Error(e),
            };
            let _ = token_tx.blocking_send(last);
        });

        TokenStream::new(self, job, token_rx)
    }

    /// Runs the native benchmark against the loaded model.
    pub async fn bench(&self, params: BenchParams) -> Result<String, EngineError> {
        self.submit(move |worker| worker.bench(&params)).await
    }

    /// Routes native log output to `logger`, replacing any previous logger.
    pub async fn set_logger<L: Logger + 'static>(&self, logger: L) -> Result<(), EngineError> {
        let logger: Arc<dyn Logger> = Arc::new(logger);
        self.submit(move |worker| {
            worker.set_logger(logger);
            Ok(())
        })
        .await
    }

    /// Detaches the logger bridge; the native engine falls back to its default sink.
    pub async fn remove_logger(&self) -> Result<(), EngineError> {
        self.submit(|worker| {
            worker.remove_logger();
            Ok(())
        })
        .await
    }

    /// Runs `work` on the worker and waits for its result.
    pub(crate) async fn submit<T, F>(&self, work: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Worker) -> Result<T, EngineError> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.dispatch(Box::new(move |worker: Result<&mut Worker, EngineError>| {
            let result = worker.and_then(|w| guarded(|| work(w)));
            let _ = reply_tx.send(result);
        }))?;

        reply_rx.await.map_err(|_| {
            EngineError::WorkerUnavailable("worker exited before replying".to_string())
        })?
    }

    /// Queues `job` behind everything already submitted.
    pub(crate) fn dispatch(&self, job: Job) -> Result<(), EngineError> {
        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        slot.sender()?
            .send(WorkerCommand::Run(job))
            .map_err(|_| EngineError::WorkerUnavailable("worker thread has exited".to_string()))
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        let slot = std::mem::replace(
            self.worker.get_mut().unwrap_or_else(PoisonError::into_inner),
            WorkerSlot::Stopped,
        );
        if let WorkerSlot::Running { command_tx, handle } = slot {
            let _ = command_tx.send(WorkerCommand::Shutdown);
            let _ = handle.join();
        }
    }
}

/// State owned by the worker thread.
pub(crate) struct Worker {
    native: Box<dyn NativeEngine>,
    session: SessionState,
    bridge: LoggerBridge,
    options: EngineOptions,
}

impl Worker {
    /// Backend init, default log redirection and one system-info line.
    fn start(factory: NativeFactory, options: EngineOptions) -> Result<Self, EngineError> {
        let mut native = factory().map_err(|e| EngineError::StartupFailed(e.0))?;
        native
            .init_backend(options.use_numa)
            .map_err(|e| EngineError::StartupFailed(e.0))?;

        let bridge = LoggerBridge::new();
        native.install_logger(bridge.callback());
        let system_info = native.system_info();
        tracing::info!("System info: {system_info}");

        Ok(Self {
            native,
            session: SessionState::Idle,
            bridge,
            options,
        })
    }

    fn load(&mut self, path: &Path) -> Result<(), EngineError> {
        let handles = self
            .session
            .load(self.native.as_mut(), path, self.options.batch)?;
        tracing::info!(
            "Loaded {} (model {}, context {}, batch {})",
            path.display(),
            handles.model,
            handles.context,
            handles.batch
        );
        Ok(())
    }

    fn unload(&mut self) -> Option<HandleSet> {
        let released = self.session.unload(self.native.as_mut());
        if released.is_some() {
            tracing::info!("Model unloaded");
        }
        released
    }

    fn generate(
        &mut self,
        prompt: &str,
        max_tokens: u32,
        token_tx: &token_channel::Sender<StreamToken>,
    ) -> Result<(), EngineError> {
        let handles = self.session.require_loaded("generate")?;
        let summary = generation::run_generation(
            self.native.as_mut(),
            &handles,
            prompt,
            max_tokens,
            |chunk| token_tx.blocking_send(StreamToken::Token(chunk)).is_ok(),
        )?;
        tracing::debug!(
            "Generation finished: {:?} after {} chunks at position {}",
            summary.reason,
            summary.chunks,
            summary.cursor.position()
        );
        Ok(())
    }

    fn bench(&mut self, params: &BenchParams) -> Result<String, EngineError> {
        let handles = self.session.require_loaded("bench")?;
        let report = self.native.benchmark(
            handles.context.get(),
            handles.model.get(),
            handles.batch.get(),
            params,
        )?;
        Ok(report)
    }

    fn set_logger(&mut self, logger: Arc<dyn Logger>) {
        self.bridge.replace(logger);
        self.native.install_logger(self.bridge.callback());
    }

    fn remove_logger(&mut self) {
        self.native.remove_logger();
        self.bridge.reset();
    }

    fn shutdown(&mut self) {
        self.unload();
        self.native.remove_logger();
    }
}

fn spawn_worker(factory: NativeFactory, options: EngineOptions) -> Result<WorkerSlot, EngineError> {
    let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
    let handle = thread::Builder::new()
        .name("llamalink-worker".to_string())
        .spawn(move || worker_thread_main(factory, options, command_rx))
        .map_err(|e| EngineError::StartupFailed(format!("failed to spawn worker: {e}")))?;

    tracing::info!("Inference worker thread started");
    Ok(WorkerSlot::Running { command_tx, handle })
}

/// Worker thread main loop
///
/// Starts the native engine, then runs jobs in arrival order until shutdown.
/// If startup failed, every job is answered with the startup error.
fn worker_thread_main(factory: NativeFactory, options: EngineOptions, command_rx: Receiver<WorkerCommand>) {
    let mut worker = panic::catch_unwind(AssertUnwindSafe(|| Worker::start(factory, options)))
        .unwrap_or_else(|payload| Err(EngineError::StartupFailed(panic_message(payload.as_ref()))));

    if let Err(e) = &worker {
        tracing::error!("Inference worker failed to start: {e}");
    }

    while let Ok(command) = command_rx.recv() {
        match command {
            WorkerCommand::Run(job) => match worker.as_mut() {
                Ok(w) => job(Ok(w)),
                Err(e) => job(Err(e.clone())),
            },
            WorkerCommand::Shutdown => {
                tracing::info!("Worker thread shutting down");
                break;
            }
        }
    }

    if let Ok(w) = worker.as_mut() {
        w.shutdown();
    }
}

/// Runs `work`, converting a panic into [`EngineError::WorkerPanic`].
fn guarded<T>(work: impl FnOnce() -> Result<T, EngineError>) -> Result<T, EngineError> {
    match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            tracing::warn!("Worker job failed: {e}");
            Err(e)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!("Worker job panicked: {message}");
            Err(EngineError::WorkerPanic(message))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::logger::LogLevel;
    use crate::inference::native::testing::{Call, Journal, Script, StubEngine};
    use futures::{StreamExt, TryStreamExt};
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn engine_with(script: Script, options: EngineOptions) -> (InferenceEngine, Arc<Journal>) {
        let journal = Arc::new(Journal::default());
        let shared = journal.clone();
        let engine = InferenceEngine::new(move || Ok(StubEngine::new(script, shared)), options);
        (engine, journal)
    }

    fn engine(script: Script) -> (InferenceEngine, Arc<Journal>) {
        engine_with(script, EngineOptions::default())
    }

    fn endless() -> Script {
        Script {
            chunks: Vec::new(),
            repeat: Some("x".to_string()),
            ..Script::default()
        }
    }

    #[tokio::test]
    async fn test_end_to_end_load_generate_unload() {
        let (engine, journal) = engine(Script::default());

        engine.load("model.bin").await.unwrap();
        assert!(engine.is_loaded().await.unwrap());
        assert!(journal
            .calls()
            .contains(&Call::LoadModel(PathBuf::from("model.bin"))));

        let chunks: Vec<String> = engine.generate("hi").try_collect().await.unwrap();
        assert_eq!(chunks, vec!["He", "llo"]);
        assert_eq!(journal.count(|c| matches!(c, Call::NextChunk(_))), 3);
        assert_eq!(journal.count(|c| *c == Call::ClearKv(2)), 1);

        engine.unload().await.unwrap();
        assert!(!engine.is_loaded().await.unwrap());
        let frees: Vec<Call> = journal
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::FreeContext(_) | Call::FreeModel(_) | Call::FreeBatch(_)))
            .collect();
        assert_eq!(
            frees,
            vec![Call::FreeContext(2), Call::FreeModel(1), Call::FreeBatch(3)]
        );
    }

    #[tokio::test]
    async fn test_worker_starts_lazily() {
        let (engine, journal) = engine(Script::default());
        let stream = engine.generate("unused");
        drop(stream);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(journal.calls().is_empty());

        engine.unload().await.unwrap();
        assert_eq!(
            journal.calls(),
            vec![Call::InitBackend(false), Call::InstallLogger, Call::SystemInfo]
        );
    }

    #[tokio::test]
    async fn test_model_acquisition_failure() {
        let (engine, journal) = engine(Script {
            handles: [0, 2, 3],
            ..Script::default()
        });

        let err = engine.load("missing.bin").await.unwrap_err();
        assert_eq!(err, EngineError::AcquisitionFailure(Resource::Model));
        assert!(!engine.is_loaded().await.unwrap());
        assert_eq!(
            journal.count(|c| matches!(c, Call::NewContext(_) | Call::NewBatch(..))),
            0
        );
    }

    #[tokio::test]
    async fn test_double_load_keeps_first_session() {
        let (engine, journal) = engine(Script::default());

        engine.load("a.bin").await.unwrap();
        let err = engine.load("b.bin").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
        assert_eq!(journal.count(|c| matches!(c, Call::LoadModel(_))), 1);

        assert!(engine.is_loaded().await.unwrap());
        let text = engine.generate("hi").collect_text().await.unwrap();
        assert_eq!(text, "Hello");
    }

    #[tokio::test]
    async fn test_unload_is_idempotent() {
        let (engine, journal) = engine(Script::default());
        engine.unload().await.unwrap();
        engine.unload().await.unwrap();
        assert!(!engine.is_loaded().await.unwrap());
        assert_eq!(
            journal.count(|c| matches!(c, Call::FreeContext(_) | Call::FreeModel(_) | Call::FreeBatch(_))),
            0
        );
    }

    #[tokio::test]
    async fn test_generate_and_bench_require_loaded_model() {
        let (engine, journal) = engine(Script::default());

        let mut stream = engine.generate("hi");
        assert!(matches!(
            stream.next().await,
            Some(Err(EngineError::InvalidState(_)))
        ));
        assert!(stream.next().await.is_none());

        let err = engine.bench(BenchParams::new(8, 4, 1)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
        assert_eq!(
            journal.count(|c| matches!(c, Call::Prepare(_) | Call::Benchmark(_))),
            0
        );

        engine.load("m").await.unwrap();
        engine.unload().await.unwrap();
        assert!(engine.bench(BenchParams::new(8, 4, 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_bench_report() {
        let (engine, journal) = engine(Script::default());
        engine.load("m").await.unwrap();

        let report = engine.bench(BenchParams::new(512, 128, 1)).await.unwrap();
        assert_eq!(report, "pp 512 tg 128 pl 1 x1");
        assert!(journal
            .calls()
            .contains(&Call::Benchmark(BenchParams::new(512, 128, 1))));
    }

    #[tokio::test]
    async fn test_generation_bounded_by_max_tokens() {
        let options = EngineOptions {
            max_tokens: 6,
            ..EngineOptions::default()
        };
        let (engine, journal) = engine_with(endless(), options);
        engine.load("m").await.unwrap();

        let chunks: Vec<String> = engine.generate("go").try_collect().await.unwrap();
        assert_eq!(chunks.len(), 6);
        assert_eq!(journal.count(|c| matches!(c, Call::ClearKv(_))), 1);
    }

    #[tokio::test]
    async fn test_cancelled_stream_clears_cache_before_next_job() {
        let (engine, journal) = engine(endless());
        engine.load("m").await.unwrap();

        let mut stream = engine.generate("go");
        assert_eq!(stream.next().await, Some(Ok("x".to_string())));
        assert_eq!(stream.next().await, Some(Ok("x".to_string())));
        drop(stream);

        assert!(engine.is_loaded().await.unwrap());
        assert_eq!(journal.count(|c| matches!(c, Call::ClearKv(_))), 1);
        assert!(journal.count(|c| matches!(c, Call::NextChunk(_))) < 64);

        let text = engine.generate("again").collect_text().await.unwrap();
        assert_eq!(text.len(), 64);
        assert_eq!(journal.count(|c| matches!(c, Call::ClearKv(_))), 2);
    }

    #[tokio::test]
    async fn test_startup_failure_is_sticky() {
        let (engine, journal) = engine(Script {
            fail_init: true,
            ..Script::default()
        });

        let err = engine.load("m").await.unwrap_err();
        assert!(matches!(err, EngineError::StartupFailed(_)));
        let err = engine.unload().await.unwrap_err();
        assert!(matches!(err, EngineError::StartupFailed(_)));

        let mut stream = engine.generate("hi");
        assert!(matches!(
            stream.next().await,
            Some(Err(EngineError::StartupFailed(_)))
        ));
        assert_eq!(journal.calls(), vec![Call::InitBackend(false)]);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let (engine, _journal) = engine(Script {
            panic_on_bench: true,
            ..Script::default()
        });
        engine.load("m").await.unwrap();

        let err = engine.bench(BenchParams::new(8, 4, 1)).await.unwrap_err();
        assert_eq!(err, EngineError::WorkerPanic("benchmark exploded".to_string()));

        assert!(engine.is_loaded().await.unwrap());
        assert_eq!(engine.generate("hi").collect_text().await.unwrap(), "Hello");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_never_overlap() {
        let (engine, journal) = engine(Script {
            bench_delay: Duration::from_millis(5),
            ..Script::default()
        });
        let engine = Arc::new(engine);
        engine.load("m").await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..8u32 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    engine.bench(BenchParams::new(i + 1, 1, 1)).await.map(|_| ())
                } else {
                    engine.generate("hi").collect_text().await.map(|_| ())
                }
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(journal.count(|c| matches!(c, Call::Benchmark(_))), 4);
        assert_eq!(journal.overlaps(), 0);
    }

    #[tokio::test]
    async fn test_submission_order_is_preserved() {
        let (engine, journal) = engine(Script::default());
        engine.load("m").await.unwrap();
        engine.unload().await.unwrap();
        engine.load("n").await.unwrap();

        let loads: Vec<Call> = journal
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::LoadModel(_) | Call::FreeModel(_)))
            .collect();
        assert_eq!(
            loads,
            vec![
                Call::LoadModel(PathBuf::from("m")),
                Call::FreeModel(1),
                Call::LoadModel(PathBuf::from("n")),
            ]
        );
    }

    #[tokio::test]
    async fn test_set_logger_replaces_previous() {
        let (engine, journal) = engine(Script::default());
        engine.load("m").await.unwrap();

        let first = Arc::new(StdMutex::new(Vec::new()));
        let sink = first.clone();
        engine
            .set_logger(move |level: LogLevel, message: &str| {
                sink.lock().unwrap().push((level, message.to_string()));
            })
            .await
            .unwrap();
        engine.generate("one").collect_text().await.unwrap();

        let second = Arc::new(StdMutex::new(Vec::new()));
        let sink = second.clone();
        engine
            .set_logger(move |level: LogLevel, message: &str| {
                sink.lock().unwrap().push((level, message.to_string()));
            })
            .await
            .unwrap();
        engine.generate("two").collect_text().await.unwrap();

        assert_eq!(
            *first.lock().unwrap(),
            vec![(LogLevel::Info, "prepare: one".to_string())]
        );
        assert_eq!(
            *second.lock().unwrap(),
            vec![(LogLevel::Info, "prepare: two".to_string())]
        );

        engine.remove_logger().await.unwrap();
        engine.generate("three").collect_text().await.unwrap();
        assert_eq!(second.lock().unwrap().len(), 1);
        assert_eq!(journal.count(|c| *c == Call::RemoveLogger), 1);
    }

    #[tokio::test]
    async fn test_drop_unloads_session() {
        let (engine, journal) = engine(Script::default());
        engine.load("m").await.unwrap();
        drop(engine);

        assert_eq!(journal.count(|c| matches!(c, Call::FreeModel(_))), 1);
        assert_eq!(journal.calls().last(), Some(&Call::RemoveLogger));
    }

    #[tokio::test]
    async fn test_native_error_ends_stream_and_clears_cache() {
        let (engine, journal) = engine(Script {
            fail_chunk_at: Some(1),
            ..Script::default()
        });
        engine.load("m").await.unwrap();

        let mut stream = engine.generate("hi");
        assert_eq!(stream.next().await, Some(Ok("He".to_string())));
        assert_eq!(
            stream.next().await,
            Some(Err(EngineError::Native("decode failed".to_string())))
        );
        assert!(stream.next().await.is_none());
        drop(stream);
        assert_eq!(journal.count(|c| matches!(c, Call::ClearKv(_))), 1);

        // The failure is scripted for the second chunk of every generation.
        let mut stream = engine.generate("again");
        assert_eq!(stream.next().await, Some(Ok("He".to_string())));
        drop(stream);
        assert!(engine.is_loaded().await.unwrap());
        assert_eq!(journal.count(|c| matches!(c, Call::ClearKv(_))), 2);
    }

    #[tokio::test]
    async fn test_panic_mid_stream_reports_and_recovers() {
        let (engine, journal) = engine(Script {
            panic_chunk_at: Some(1),
            ..Script::default()
        });
        engine.load("m").await.unwrap();

        let mut stream = engine.generate("hi");
        assert_eq!(stream.next().await, Some(Ok("He".to_string())));
        assert_eq!(
            stream.next().await,
            Some(Err(EngineError::WorkerPanic("chunk exploded".to_string())))
        );
        assert!(stream.next().await.is_none());
        drop(stream);
        assert_eq!(journal.count(|c| matches!(c, Call::ClearKv(_))), 1);

        assert!(engine.is_loaded().await.unwrap());
        let mut stream = engine.generate("again");
        assert_eq!(stream.next().await, Some(Ok("He".to_string())));
        drop(stream);
        assert!(engine.is_loaded().await.unwrap());
        assert_eq!(journal.count(|c| matches!(c, Call::ClearKv(_))), 2);
    }

    #[tokio::test]
    async fn test_stream_dropped_while_queued_skips_generation() {
        let (engine, journal) = engine(Script {
            bench_delay: Duration::from_millis(100),
            ..Script::default()
        });
        engine.load("m").await.unwrap();

        let mut bench = Box::pin(engine.bench(BenchParams::new(8, 4, 1)));
        assert!(futures::poll!(bench.as_mut()).is_pending());

        let mut stream = engine.generate("late");
        assert!(futures::poll!(stream.next()).is_pending());
        drop(stream);

        bench.await.unwrap();
        assert!(engine.is_loaded().await.unwrap());
        assert_eq!(journal.count(|c| matches!(c, Call::Prepare(_))), 0);
        assert_eq!(journal.count(|c| matches!(c, Call::ClearKv(_))), 0);
    }

    #[tokio::test]
    async fn test_startup_reports_system_info_without_subscriber() {
        let (engine, journal) = engine(Script::default());
        assert!(!engine.is_loaded().await.unwrap());
        assert_eq!(journal.count(|c| *c == Call::SystemInfo), 1);
    }
}
