//! Native engine boundary
//!
//! Everything the worker needs from the underlying inference library,
//! expressed as handle-based calls. An implementation is constructed on the
//! worker thread and never leaves it, so it does not have to be `Send`.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::inference::bench::BenchParams;
use crate::inference::generation::GenerationCursor;
use crate::inference::logger::LogLevel;

/// Opaque native resource identifier. Zero means the resource was not created.
pub type RawHandle = u64;

/// Callback the native engine invokes for every log line.
pub type LogCallback = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Failure reported by a fallible native call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct NativeError(pub String);

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Handle-based interface to a stateful inference library.
///
/// Creation calls return `0` on failure. Release calls are made at most once
/// per successfully created handle.
pub trait NativeEngine {
    /// One-time global backend initialization.
    fn init_backend(&mut self, use_numa: bool) -> Result<(), NativeError>;

    /// One-line description of the compute capabilities in use.
    fn system_info(&self) -> String;

    fn load_model(&mut self, path: &Path) -> RawHandle;

    fn new_context(&mut self, model: RawHandle) -> RawHandle;

    fn new_batch(&mut self, max_tokens: u32, embedding_dim: u32, max_sequences: u32) -> RawHandle;

    fn free_context(&mut self, context: RawHandle);

    fn free_model(&mut self, model: RawHandle);

    fn free_batch(&mut self, batch: RawHandle);

    /// Tokenizes `prompt` and primes the context; returns the initial cursor position.
    fn prepare_generation(
        &mut self,
        context: RawHandle,
        batch: RawHandle,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<u32, NativeError>;

    /// Decodes at least one token, advancing `cursor`. An empty string means
    /// the engine has nothing more to say.
    fn produce_next_chunk(
        &mut self,
        context: RawHandle,
        batch: RawHandle,
        max_tokens: u32,
        cursor: &mut GenerationCursor,
    ) -> Result<String, NativeError>;

    fn clear_kv_cache(&mut self, context: RawHandle);

    /// Runs a throughput benchmark and returns the formatted report.
    fn benchmark(
        &mut self,
        context: RawHandle,
        model: RawHandle,
        batch: RawHandle,
        params: &BenchParams,
    ) -> Result<String, NativeError>;

    /// Routes native log output to `callback`, replacing any previous one.
    fn install_logger(&mut self, callback: LogCallback);

    /// Restores the native default log sink.
    fn remove_logger(&mut self);
}
