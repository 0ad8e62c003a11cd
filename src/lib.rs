//! llamalink
//!
//! Lifecycle and concurrency manager for a stateful native inference engine.

pub mod inference;
pub mod storage;
