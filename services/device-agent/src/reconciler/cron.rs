//! Cron middleware.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{JobSync, SyncError, SyncOutcome};
use crate::job::{Job, JobState};

/// Holds a cron-gated job back until its next scheduled time.
///
/// Jobs heading for `Unknown` or `Exited` are never held back, so removal is
/// not delayed by a schedule.
pub struct CronMiddleware<S> {
    inner: S,
}

impl<S> CronMiddleware<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: JobSync> JobSync for CronMiddleware<S> {
    async fn sync(&self, job: &mut Job, now: DateTime<Utc>) -> Result<SyncOutcome, SyncError> {
        let bypass = matches!(job.target_state(), JobState::Unknown | JobState::Exited);
        let job_id = job.id().clone();

        if !bypass {
            if let Some(gate) = job.cron_gate_mut() {
                if !gate.can_reconcile(now) {
                    return Ok(SyncOutcome::Skipped);
                }
                let next = gate.compute_next(now);
                debug!(job_id = %job_id.short(), next = ?next, "Cron window open");
            }
        }

        self.inner.sync(job, now).await
    }
}
