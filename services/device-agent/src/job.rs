//! Job state model.
//!
//! A job is the scheduler's control record for one workload: the state last
//! observed from the executor, the state the scheduler wants, and the gates
//! that decide when reconciliation may act.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flotta_id::WorkloadId;
use flotta_reconcile::{CronGate, RetryGate};
use serde::{Deserialize, Serialize};

use crate::workload::Workload;

/// Observed or desired state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Initial state on creation.
    Ready,
    Running,
    Stopped,
    Degraded,
    Exited,
    Error,
    /// Not known to the runtime.
    Unknown,
    /// Intentionally parked by the operator.
    Inactive,
}

impl JobState {
    pub const ALL: [JobState; 8] = [
        JobState::Ready,
        JobState::Running,
        JobState::Stopped,
        JobState::Degraded,
        JobState::Exited,
        JobState::Error,
        JobState::Unknown,
        JobState::Inactive,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Ready => "Ready",
            JobState::Running => "Running",
            JobState::Stopped => "Stopped",
            JobState::Degraded => "Degraded",
            JobState::Exited => "Exited",
            JobState::Error => "Error",
            JobState::Unknown => "Unknown",
            JobState::Inactive => "Inactive",
        }
    }

    /// Map a runtime status string. Anything unrecognised, or no status at
    /// all, is `Unknown`.
    pub fn from_runtime_status(status: Option<&str>) -> Self {
        match status {
            Some("Running") => JobState::Running,
            Some("Degraded") => JobState::Degraded,
            Some("Stopped") => JobState::Stopped,
            Some("Error") => JobState::Error,
            Some("Exited") => JobState::Exited,
            _ => JobState::Unknown,
        }
    }

    /// Exited or unknown to the runtime.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Exited | JobState::Unknown)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown state name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job state '{0}'")]
pub struct ParseJobStateError(String);

impl FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseJobStateError(s.to_string()))
    }
}

/// The scheduler's record for one workload.
#[derive(Debug, Clone)]
pub struct Job {
    id: WorkloadId,
    workload: Arc<Workload>,
    current: JobState,
    target: JobState,
    marked_for_deletion: bool,
    cron: Option<CronGate>,
    retry: Option<RetryGate>,
}

impl Job {
    /// A fresh job in `Ready`, targeting `Ready`, with no gates.
    pub fn new(workload: Arc<Workload>) -> Self {
        Self {
            id: workload.id(),
            workload,
            current: JobState::Ready,
            target: JobState::Ready,
            marked_for_deletion: false,
            cron: None,
            retry: None,
        }
    }

    pub fn with_retry_gate(mut self, gate: RetryGate) -> Self {
        self.retry = Some(gate);
        self
    }

    pub fn with_cron_gate(mut self, gate: CronGate) -> Self {
        self.cron = Some(gate);
        self
    }

    pub fn id(&self) -> &WorkloadId {
        &self.id
    }

    pub fn workload(&self) -> &Arc<Workload> {
        &self.workload
    }

    pub fn name(&self) -> &str {
        self.workload.name()
    }

    pub fn current_state(&self) -> JobState {
        self.current
    }

    pub fn target_state(&self) -> JobState {
        self.target
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion
    }

    pub fn cron_gate(&self) -> Option<&CronGate> {
        self.cron.as_ref()
    }

    pub fn cron_gate_mut(&mut self) -> Option<&mut CronGate> {
        self.cron.as_mut()
    }

    pub fn retry_gate(&self) -> Option<&RetryGate> {
        self.retry.as_ref()
    }

    pub fn retry_gate_mut(&mut self) -> Option<&mut RetryGate> {
        self.retry.as_mut()
    }

    /// Change the desired state. A change resets retry progress.
    pub fn set_target_state(&mut self, state: JobState) {
        if state == self.target {
            return;
        }
        self.target = state;
        if let Some(gate) = self.retry.as_mut() {
            gate.reset();
        }
    }

    /// Record an observed state.
    ///
    /// - `Ready -> Unknown` is ignored unless the job is marked for deletion.
    /// - Moving into `Exited`/`Unknown` while targeting `Running` arms the
    ///   retry gate, unless a restart is already pending.
    /// - Entering `Running` clears the pending restart.
    pub fn set_current_state(&mut self, state: JobState, now: DateTime<Utc>) {
        if self.current == JobState::Ready
            && state == JobState::Unknown
            && !self.marked_for_deletion
        {
            return;
        }

        let previous = self.current;
        self.current = state;

        match state {
            JobState::Exited | JobState::Unknown
                if previous != state && self.target == JobState::Running =>
            {
                if let Some(gate) = self.retry.as_mut() {
                    if !gate.marked_for_restart() {
                        gate.arm(now);
                    }
                }
            }
            JobState::Running => {
                if let Some(gate) = self.retry.as_mut() {
                    gate.clear_restart();
                }
            }
            _ => {}
        }
    }

    /// True when the job has stopped but should be running.
    pub fn should_restart(&self) -> bool {
        self.current.is_terminal() && self.target == JobState::Running
    }

    pub fn mark_for_deletion(&mut self) {
        self.marked_for_deletion = true;
    }

    /// Undo `mark_for_deletion` for a workload that is desired again.
    pub fn restore(&mut self) {
        self.marked_for_deletion = false;
        self.set_target_state(JobState::Running);
    }

    /// Marked for deletion and gone from the runtime.
    pub fn is_collectable(&self) -> bool {
        self.marked_for_deletion && self.current == JobState::Unknown
    }
}
