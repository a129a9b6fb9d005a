//! Per-job reconciliation.
//!
//! One sync call observes a job's workload through the executor, decides the
//! next action toward the job's target state and performs it. The step is
//! wrapped by middlewares:
//!
//! ```text
//! sync = log(cron(retry(base)))
//! ```
//!
//! - `base`: observe, compare with the target, run or stop
//! - `retry`: spaces out restarts by backoff and enforces the attempt budget
//! - `cron`: only lets the job through at cron-scheduled times
//! - `log`: records state transitions and failures
//!
//! Resource slices are reconciled separately by [`ResourceSync`], after the
//! pipeline, and never fail the sync.

mod base;
mod cron;
mod log;
mod resource;
mod retry;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::executor::{Executor, ExecutorError};
use crate::job::Job;

pub use base::BaseSync;
pub use cron::CronMiddleware;
pub use log::LogMiddleware;
pub use resource::ResourceSync;
pub use retry::RetryMiddleware;

/// Errors surfaced by a sync step.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// The job used every restart attempt and is left alone.
    #[error("job {job} exhausted its {attempts} restart attempts")]
    RetryBudgetExhausted { job: String, attempts: u32 },
}

/// What a sync step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Observed state already matches the target.
    InSync,
    /// Observed state recorded, no action taken.
    Observed,
    /// The workload was (re)started.
    Started,
    /// The workload was stopped and removed.
    Stopped,
    /// The workload's leftover artifacts were removed.
    Purged,
    /// A newly observed crash; the restart waits for the retry gate.
    Deferred,
    /// A gate suppressed this tick.
    Skipped,
}

/// One reconciliation step for a job.
#[async_trait]
pub trait JobSync: Send + Sync {
    async fn sync(&self, job: &mut Job, now: DateTime<Utc>) -> Result<SyncOutcome, SyncError>;
}

/// The standard pipeline type.
pub type Pipeline = LogMiddleware<CronMiddleware<RetryMiddleware<BaseSync>>>;

/// Build `log(cron(retry(base)))` over an executor.
pub fn pipeline(executor: Arc<dyn Executor>) -> Pipeline {
    LogMiddleware::new(CronMiddleware::new(RetryMiddleware::new(BaseSync::new(
        executor,
    ))))
}
