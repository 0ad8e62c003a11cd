//! Generation pipeline
//!
//! Drives the native chunk loop for one prompt. The loop is bounded by the
//! maximum token count, stops on the first empty chunk, and clears the KV
//! cache exactly once however it exits.

use crate::inference::engine::EngineError;
use crate::inference::native::{NativeEngine, RawHandle};
use crate::inference::session::HandleSet;

/// Default upper bound on the cursor for one generation.
pub const DEFAULT_MAX_TOKENS: u32 = 64;

/// Token position of an in-flight generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct GenerationCursor(u32);

impl GenerationCursor {
    pub fn new(position: u32) -> Self {
        Self(position)
    }

    pub fn position(&self) -> u32 {
        self.0
    }

    pub fn advance(&mut self) {
        self.0 = self.0.saturating_add(1);
    }
}

/// Why a generation loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The engine returned an empty chunk
    EndOfText,
    /// The cursor reached the maximum token count
    TokenLimit,
    /// The consumer went away
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationSummary {
    pub reason: StopReason,
    pub chunks: u32,
    pub cursor: GenerationCursor,
}

/// Clears the context's KV cache when dropped.
struct KvCacheGuard<'a> {
    native: &'a mut dyn NativeEngine,
    context: RawHandle,
}

impl Drop for KvCacheGuard<'_> {
    fn drop(&mut self) {
        self.native.clear_kv_cache(self.context);
        tracing::debug!("KV cache cleared for context {}", self.context);
    }
}

/// Runs one generation, handing each chunk to `emit`.
///
/// `emit` returns `false` when the consumer is gone; the loop then stops as
/// if the bound had been reached.
pub fn run_generation(
    native: &mut dyn NativeEngine,
    handles: &HandleSet,
    prompt: &str,
    max_tokens: u32,
    emit: impl FnMut(String) -> bool,
) -> Result<GenerationSummary, EngineError> {
    let guard = KvCacheGuard {
        native,
        context: handles.context.get(),
    };
    drive(&mut *guard.native, handles, prompt, max_tokens, emit)
}

fn drive(
    native: &mut dyn NativeEngine,
    handles: &HandleSet,
    prompt: &str,
    max_tokens: u32,
    mut emit: impl FnMut(String) -> bool,
) -> Result<GenerationSummary, EngineError> {
    let context = handles.context.get();
    let batch = handles.batch.get();

    let start = native.prepare_generation(context, batch, prompt, max_tokens)?;
    let mut cursor = GenerationCursor::new(start);
    let mut chunks = 0;
    tracing::debug!("Generation primed at position {start}, limit {max_tokens}");

    let summary = |reason, chunks, cursor| GenerationSummary {
        reason,
        chunks,
        cursor,
    };

    while cursor.position() < max_tokens {
        let before = cursor;
        let chunk = native.produce_next_chunk(context, batch, max_tokens, &mut cursor)?;
        if cursor <= before {
            tracing::warn!("Native step did not advance the cursor past {}", before.position());
            cursor = before;
            cursor.advance();
        }

        if chunk.is_empty() {
            return Ok(summary(StopReason::EndOfText, chunks, cursor));
        }
        chunks += 1;
        if !emit(chunk) {
            return Ok(summary(StopReason::Cancelled, chunks, cursor));
        }
    }

    Ok(summary(StopReason::TokenLimit, chunks, cursor))
}
