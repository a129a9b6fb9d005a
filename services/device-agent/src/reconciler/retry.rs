//! Retry middleware.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{JobSync, SyncError, SyncOutcome};
use crate::job::{Job, JobState};

/// Spaces restarts out by the job's retry gate.
///
/// While a job is out of sync, nothing happens before the gate's next time.
/// Every restart attempt counts against the gate's budget and consumes one
/// backoff sample. Once the budget is spent the job is reported once and then
/// left alone until its target changes.
pub struct RetryMiddleware<S> {
    inner: S,
}

impl<S> RetryMiddleware<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: JobSync> JobSync for RetryMiddleware<S> {
    async fn sync(&self, job: &mut Job, now: DateTime<Utc>) -> Result<SyncOutcome, SyncError> {
        let out_of_sync = job.current_state() != job.target_state();
        let wants_restart = job.should_restart();
        let targets_running = job.target_state() == JobState::Running;
        let job_name = job.name().to_string();
        let mut attempted = false;

        if out_of_sync {
            if let Some(gate) = job.retry_gate_mut() {
                if !gate.can_reconcile(now) {
                    return Ok(SyncOutcome::Skipped);
                }

                if targets_running && (gate.marked_for_restart() || wants_restart) {
                    if gate.is_exhausted() {
                        if gate.take_exhaustion_report() {
                            return Err(SyncError::RetryBudgetExhausted {
                                job: job_name,
                                attempts: gate.attempts(),
                            });
                        }
                        return Ok(SyncOutcome::Skipped);
                    }
                    gate.record_attempt();
                    attempted = true;
                }
            }
        }

        let result = self.inner.sync(job, now).await;

        if job.target_state() == JobState::Running {
            let still_down = attempted && job.should_restart();
            if still_down || result.is_err() {
                if let Some(gate) = job.retry_gate_mut() {
                    gate.arm(now);
                }
            }
        }

        result
    }
}
