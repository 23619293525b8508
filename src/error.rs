//! Typed errors at the seams between subsystems.
//!
//! Background tasks (the scheduler tick, the runner loop, the inventory
//! loader pass, the rollover recalculator) return `anyhow::Result` at their
//! outermost level, matching the teacher's split between `anyhow` at the
//! task boundary and typed errors one layer down.

use thiserror::Error;

/// Errors from the metadata store (spec.md §6: "a transactional interface").
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("row not found: {0}")]
    NotFound(String),

    #[error("transaction aborted: {0}")]
    TransactionAborted(String),
}

/// Errors from the platform adapter (spec.md §4.2: "the client does not
/// classify [errors] — the Runner's policy does" — so the adapter only
/// reports whether a failure is transient or permanent, nothing more).
#[derive(Debug, Error, Clone)]
pub enum AdapterError {
    #[error("transient adapter error: {0}")]
    Transient(String),

    #[error("permanent adapter error: {0}")]
    Permanent(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }
}

/// Errors from the time-series gateway (spec.md §4.1).
#[derive(Debug, Error, Clone, Copy)]
pub enum TimeSeriesError {
    #[error("time-series store unavailable")]
    Unavailable,

    #[error("unsupported timeframe")]
    BadTimeframe,
}

/// Errors surfaced by the Download Job Runner (spec.md §4.5, §7).
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    TimeSeries(#[from] TimeSeriesError),
}

/// Errors surfaced by the scheduler's matching pass (spec.md §4.3).
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("executor failed to persist dispatch transition: {0}")]
    ExecutorFailed(String),
}
