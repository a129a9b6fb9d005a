//! Reconciliation loop primitives.
//!
//! This library provides helpers for reconciliation loops that drive a
//! job's observed state toward its target state. Key concepts:
//!
//! - **Content digest**: a workload is identified by the SHA-256 of its
//!   canonical JSON form, so identical inputs always map to the same job.
//! - **Backoff**: the delay schedule applied between restart attempts.
//! - **Gates**: per-job admission controls that suppress reconciliation
//!   until a time threshold passes (cron schedule or retry backoff).
//!
//! # Invariants
//!
//! - Digests are deterministic and independent of map key order
//! - Gates never move their next-eligible time backwards on their own
//! - All time-dependent operations take `now` explicitly

mod backoff;
mod digest;
mod gate;

pub use backoff::BackoffPolicy;
pub use digest::{canonical_json, content_digest, content_digest_hex};
pub use gate::{normalize_cron, CronGate, RetryGate};

use thiserror::Error;

/// Gate construction errors.
#[derive(Debug, Error)]
pub enum GateError {
    /// The cron expression could not be parsed.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },
}

/// Default number of restart attempts before a job is left alone.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
