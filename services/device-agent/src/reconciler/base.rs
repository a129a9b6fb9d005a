//! The base sync step: observe, decide, act.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{JobSync, SyncError, SyncOutcome};
use crate::executor::Executor;
use crate::job::{Job, JobState};

/// Drives a job toward its target state through the executor.
pub struct BaseSync {
    executor: Arc<dyn Executor>,
}

impl BaseSync {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// Remove leftovers if present, start, record the resulting state.
    async fn run_action(&self, job: &mut Job, now: DateTime<Utc>) -> Result<SyncOutcome, SyncError> {
        let workload = Arc::clone(job.workload());
        if self.executor.exists(&workload).await? {
            debug!(job_id = %job.id().short(), "Removing previous instance before run");
            self.executor.remove(&workload).await?;
        }
        self.executor.run(&workload).await?;

        let state = self.executor.get_state(&workload).await?;
        job.set_current_state(state, now);
        Ok(SyncOutcome::Started)
    }

    /// Stop, remove, record the resulting state.
    async fn stop_action(&self, job: &mut Job, now: DateTime<Utc>) -> Result<SyncOutcome, SyncError> {
        let workload = Arc::clone(job.workload());
        self.executor.stop(&workload).await?;
        self.executor.remove(&workload).await?;

        let state = self.executor.get_state(&workload).await?;
        job.set_current_state(state, now);
        Ok(SyncOutcome::Stopped)
    }

    /// Remove an exited workload that is being deleted.
    async fn purge_action(&self, job: &mut Job, now: DateTime<Utc>) -> Result<SyncOutcome, SyncError> {
        let workload = Arc::clone(job.workload());
        self.executor.remove(&workload).await?;

        let state = self.executor.get_state(&workload).await?;
        job.set_current_state(state, now);
        Ok(SyncOutcome::Purged)
    }
}

#[async_trait]
impl JobSync for BaseSync {
    async fn sync(&self, job: &mut Job, now: DateTime<Utc>) -> Result<SyncOutcome, SyncError> {
        let observed = self.executor.get_state(job.workload()).await?;
        let target = job.target_state();

        // A deleted job must reach Unknown to be collected.
        if job.is_marked_for_deletion() && observed == JobState::Exited {
            job.set_current_state(observed, now);
            return self.purge_action(job, now).await;
        }

        if observed == target
            || (matches!(target, JobState::Ready | JobState::Exited | JobState::Inactive)
                && observed.is_terminal())
        {
            job.set_current_state(observed, now);
            return Ok(SyncOutcome::InSync);
        }

        let was_marked = job
            .retry_gate()
            .is_some_and(|gate| gate.marked_for_restart());
        job.set_current_state(observed, now);
        let armed = job
            .retry_gate()
            .is_some_and(|gate| gate.marked_for_restart() && !gate.can_reconcile(now));
        if !was_marked && armed {
            return Ok(SyncOutcome::Deferred);
        }

        match (target, observed) {
            (JobState::Running, JobState::Unknown | JobState::Exited | JobState::Degraded) => {
                self.run_action(job, now).await
            }
            (JobState::Exited | JobState::Inactive, _) => self.stop_action(job, now).await,
            _ => Ok(SyncOutcome::Observed),
        }
    }
}
