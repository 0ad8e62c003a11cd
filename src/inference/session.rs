//! Session state
//!
//! The Idle/Loaded state machine over the three native handles of one
//! loaded model. Handles are only reachable through [`SessionState::Loaded`].

use std::fmt;
use std::num::NonZeroU64;
use std::path::Path;

use crate::inference::engine::EngineError;
use crate::inference::native::{NativeEngine, RawHandle};

/// The native resources acquired by a successful load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleSet {
    pub model: NonZeroU64,
    pub context: NonZeroU64,
    pub batch: NonZeroU64,
}

/// Which native resource a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Model,
    Context,
    Batch,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::Model => "model",
            Resource::Context => "context",
            Resource::Batch => "batch",
        };
        f.write_str(name)
    }
}

/// Sizing of the batch created alongside the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchShape {
    /// Maximum tokens the batch can hold
    pub max_tokens: u32,
    /// Embedding width (0 = token batch)
    pub embedding_dim: u32,
    /// Maximum sequences per token
    pub max_sequences: u32,
}

impl Default for BatchShape {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            embedding_dim: 0,
            max_sequences: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Loaded(HandleSet),
}

impl SessionState {
    pub fn is_loaded(&self) -> bool {
        matches!(self, SessionState::Loaded(_))
    }

    pub fn handles(&self) -> Option<&HandleSet> {
        match self {
            SessionState::Loaded(handles) => Some(handles),
            SessionState::Idle => None,
        }
    }

    /// Returns the current handles, or `InvalidState` naming `operation`.
    pub fn require_loaded(&self, operation: &str) -> Result<HandleSet, EngineError> {
        self.handles().copied().ok_or_else(|| {
            EngineError::InvalidState(format!("cannot {operation}: no model loaded"))
        })
    }

    /// Acquires model, context and batch in that order.
    ///
    /// If a later acquisition fails, the handles already created are released
    /// in reverse order and the state stays `Idle`.
    pub fn load(
        &mut self,
        native: &mut dyn NativeEngine,
        path: &Path,
        shape: BatchShape,
    ) -> Result<HandleSet, EngineError> {
        if self.is_loaded() {
            return Err(EngineError::InvalidState(
                "cannot load: a model is already loaded".to_string(),
            ));
        }

        let model = acquire(Resource::Model, native.load_model(path))?;

        let context = match acquire(Resource::Context, native.new_context(model.get())) {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!("Rolling back model {} after context failure", model);
                native.free_model(model.get());
                return Err(e);
            }
        };

        let batch = native.new_batch(shape.max_tokens, shape.embedding_dim, shape.max_sequences);
        let batch = match acquire(Resource::Batch, batch) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(
                    "Rolling back context {} and model {} after batch failure",
                    context,
                    model
                );
                native.free_context(context.get());
                native.free_model(model.get());
                return Err(e);
            }
        };

        let handles = HandleSet {
            model,
            context,
            batch,
        };
        *self = SessionState::Loaded(handles);
        Ok(handles)
    }

    /// Releases context, model and batch in that order. No-op when idle.
    pub fn unload(&mut self, native: &mut dyn NativeEngine) -> Option<HandleSet> {
        let SessionState::Loaded(handles) = std::mem::take(self) else {
            return None;
        };
        native.free_context(handles.context.get());
        native.free_model(handles.model.get());
        native.free_batch(handles.batch.get());
        Some(handles)
    }
}

fn acquire(resource: Resource, raw: RawHandle) -> Result<NonZeroU64, EngineError> {
    NonZeroU64::new(raw).ok_or(EngineError::AcquisitionFailure(resource))
}
