//! Logger bridge
//!
//! Routes diagnostic lines emitted by the native engine to a caller-supplied
//! sink. The bridge owns a single logger slot; installing a logger swaps the
//! slot contents, so the native callback always sees one whole logger.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::inference::native::LogCallback;

/// Severity of a native log line, ordered by increasing verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        };
        f.write_str(name)
    }
}

/// A sink for native log lines.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

impl<F> Logger for F
where
    F: Fn(LogLevel, &str) + Send + Sync,
{
    fn log(&self, level: LogLevel, message: &str) {
        self(level, message)
    }
}

/// Default sink: forwards native lines into `tracing` under the `llama` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        let message = message.trim_end();
        if message.is_empty() {
            return;
        }
        match level {
            LogLevel::Error => tracing::error!(target: "llama", "{message}"),
            LogLevel::Warn => tracing::warn!(target: "llama", "{message}"),
            LogLevel::Info => tracing::info!(target: "llama", "{message}"),
            LogLevel::Debug => tracing::debug!(target: "llama", "{message}"),
        }
    }
}

/// Single-slot holder for the active logger.
#[derive(Clone)]
pub struct LoggerBridge {
    slot: Arc<RwLock<Arc<dyn Logger>>>,
}

impl LoggerBridge {
    /// Creates a bridge whose slot holds the [`TracingLogger`].
    pub fn new() -> Self {
        Self {
            slot: Arc::new(RwLock::new(Arc::new(TracingLogger))),
        }
    }

    /// Replaces the active logger, returning the previous one.
    pub fn replace(&self, logger: Arc<dyn Logger>) -> Arc<dyn Logger> {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, logger)
    }

    /// Puts the default tracing sink back into the slot.
    pub fn reset(&self) {
        self.replace(Arc::new(TracingLogger));
    }

    /// Returns the logger currently in the slot.
    pub fn current(&self) -> Arc<dyn Logger> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Builds the callback handed to the native engine.
    ///
    /// The callback reads the slot on every line, so later calls to
    /// [`replace`](Self::replace) take effect without reinstalling it.
    pub fn callback(&self) -> LogCallback {
        let bridge = self.clone();
        Arc::new(move |level: LogLevel, message: &str| bridge.current().log(level, message))
    }
}

impl Default for LoggerBridge {
    fn default() -> Self {
        Self::new()
    }
}
