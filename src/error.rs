//! Error taxonomy.
//!
//! Only failures that abort worker startup or that a caller must react to
//! live here. Per-packet decode rejects, try-lock misses, and soft parse
//! fallbacks are not errors — they're expected outcomes modeled as plain
//! enums ([`crate::decoder::DropReason`], etc.) so the hot path never pays
//! for `Result` plumbing it doesn't need.

use thiserror::Error;

/// Worker-level errors.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Flow array or pool allocation failed at startup. Construction fatal:
    /// the worker must never enter its loop.
    #[error("failed to allocate flow storage: {0}")]
    AllocationFailed(String),

    /// The flow pool has no free slots for a new flow (spec.md §3 invariant
    /// 6 / §4.B "on pool exhaustion, log fatal and return none").
    #[error("flow pool exhausted for ip{ip_version} table (capacity {capacity})")]
    PoolExhausted { ip_version: u8, capacity: usize },
}

pub type Result<T> = std::result::Result<T, WorkerError>;
