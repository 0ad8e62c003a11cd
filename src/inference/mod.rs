//! Native inference orchestration
//!
//! A single worker thread owns the native engine and the session state; this
//! module exposes the async load/generate/bench/unload surface over it.

pub mod bench;
pub mod engine;
pub mod generation;
pub mod gguf;
#[cfg(feature = "llama")]
pub mod llama;
pub mod logger;
pub mod native;
pub mod session;
pub mod streaming;

// Re-export main types for convenience
pub use bench::BenchParams;
pub use engine::{EngineError, EngineOptions, InferenceEngine};
pub use generation::{GenerationCursor, DEFAULT_MAX_TOKENS};
pub use gguf::{probe_gguf, GgufHeader, ModelError, GGUF_MAGIC};
#[cfg(feature = "llama")]
pub use llama::{LlamaCppEngine, LlamaSettings};
pub use logger::{LogLevel, Logger, TracingLogger};
pub use native::{LogCallback, NativeEngine, NativeError, RawHandle};
pub use session::{BatchShape, HandleSet, Resource, SessionState};
pub use streaming::{StreamToken, TokenStream};
