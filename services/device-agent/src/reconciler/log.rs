//! Logging middleware.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{JobSync, SyncError, SyncOutcome};
use crate::job::Job;

/// Records state transitions and failures of the wrapped step.
pub struct LogMiddleware<S> {
    inner: S,
}

impl<S> LogMiddleware<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: JobSync> JobSync for LogMiddleware<S> {
    async fn sync(&self, job: &mut Job, now: DateTime<Utc>) -> Result<SyncOutcome, SyncError> {
        let old_state = job.current_state();
        let result = self.inner.sync(job, now).await;
        let new_state = job.current_state();

        if old_state != new_state {
            info!(
                job_id = %job.id().short(),
                workload = %job.name(),
                old_state = %old_state,
                new_state = %new_state,
                target_state = %job.target_state(),
                "Job state changed"
            );
        }

        match &result {
            Ok(SyncOutcome::Skipped) => {}
            Ok(outcome) => debug!(job_id = %job.id().short(), outcome = ?outcome, "Job synced"),
            Err(e) => warn!(
                job_id = %job.id().short(),
                workload = %job.name(),
                state = %new_state,
                error = %e,
                "Job sync failed"
            ),
        }

        result
    }
}
