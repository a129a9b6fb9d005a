//! Executor interface and in-memory implementation.
//!
//! The executor abstracts the container runtime:
//! - Running, stopping and removing workloads
//! - Reporting the observed state of a workload
//!
//! An in-memory implementation is provided for testing and development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flotta_id::WorkloadId;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::job::JobState;
use crate::workload::Workload;

/// Default bound for runtime calls.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Default bound for graceful stops.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Executor failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
    /// The workload could not be prepared (images, volumes, manifests).
    #[error("deploy failed for {workload}: {reason}")]
    Deploy { workload: String, reason: String },

    /// The workload was deployed but failed to start.
    #[error("run failed for {workload}: {reason}")]
    Run { workload: String, reason: String },

    #[error("stop failed for {workload}: {reason}")]
    Stop { workload: String, reason: String },

    #[error("remove failed for {workload}: {reason}")]
    Remove { workload: String, reason: String },

    /// State or existence query failed.
    #[error("query failed for {workload}: {reason}")]
    Query { workload: String, reason: String },

    #[error("{operation} for {workload} timed out after {timeout:?}")]
    Timeout {
        workload: String,
        operation: &'static str,
        timeout: Duration,
    },
}

/// Container runtime interface.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Bring the workload up.
    async fn run(&self, workload: &Workload) -> Result<(), ExecutorError>;

    /// Request a graceful stop.
    async fn stop(&self, workload: &Workload) -> Result<(), ExecutorError>;

    /// Delete the workload's runtime artifacts.
    async fn remove(&self, workload: &Workload) -> Result<(), ExecutorError>;

    async fn exists(&self, workload: &Workload) -> Result<bool, ExecutorError>;

    /// Observed state; `Unknown` when the runtime does not know the workload.
    async fn get_state(&self, workload: &Workload) -> Result<JobState, ExecutorError>;
}

// =============================================================================
// Timeouts
// =============================================================================

/// Bounds every call of an inner executor.
pub struct TimedExecutor {
    inner: Arc<dyn Executor>,
    call_timeout: Duration,
    stop_timeout: Duration,
}

impl TimedExecutor {
    pub fn new(inner: Arc<dyn Executor>, call_timeout: Duration, stop_timeout: Duration) -> Self {
        Self {
            inner,
            call_timeout,
            stop_timeout,
        }
    }

    async fn bounded<T>(
        &self,
        workload: &Workload,
        operation: &'static str,
        timeout: Duration,
        call: impl std::future::Future<Output = Result<T, ExecutorError>>,
    ) -> Result<T, ExecutorError> {
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| ExecutorError::Timeout {
                workload: workload.name().to_string(),
                operation,
                timeout,
            })?
    }
}

#[async_trait]
impl Executor for TimedExecutor {
    async fn run(&self, workload: &Workload) -> Result<(), ExecutorError> {
        self.bounded(workload, "run", self.call_timeout, self.inner.run(workload))
            .await
    }

    async fn stop(&self, workload: &Workload) -> Result<(), ExecutorError> {
        self.bounded(workload, "stop", self.stop_timeout, self.inner.stop(workload))
            .await
    }

    async fn remove(&self, workload: &Workload) -> Result<(), ExecutorError> {
        self.bounded(workload, "remove", self.call_timeout, self.inner.remove(workload))
            .await
    }

    async fn exists(&self, workload: &Workload) -> Result<bool, ExecutorError> {
        self.bounded(workload, "exists", self.call_timeout, self.inner.exists(workload))
            .await
    }

    async fn get_state(&self, workload: &Workload) -> Result<JobState, ExecutorError> {
        self.bounded(workload, "get_state", self.call_timeout, self.inner.get_state(workload))
            .await
    }
}

// =============================================================================
// In-memory executor
// =============================================================================

/// Per-workload call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub run: u32,
    pub stop: u32,
    pub remove: u32,
}

#[derive(Debug, Default)]
struct MockState {
    /// Workloads known to the runtime and their state.
    states: HashMap<WorkloadId, JobState>,
    calls: HashMap<WorkloadId, CallCounts>,
}

/// In-memory executor for testing and development.
///
/// A successful `run` puts the workload into [`MockExecutor::run_outcome`];
/// `stop` leaves it `Exited`; `remove` forgets it.
pub struct MockExecutor {
    state: Mutex<MockState>,
    run_outcome: Mutex<JobState>,
    /// Number of upcoming `run` calls that fail to deploy.
    failing_deploys: AtomicU32,
    /// Number of upcoming `run` calls that fail to start.
    failing_runs: AtomicU32,
    /// Simulated latency for every call.
    delay: Duration,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            run_outcome: Mutex::new(JobState::Running),
            failing_deploys: AtomicU32::new(0),
            failing_runs: AtomicU32::new(0),
            delay: Duration::ZERO,
        }
    }

    /// An executor whose calls take `delay` to complete.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    /// Set the state the runtime reports for a workload.
    pub async fn set_state(&self, id: &WorkloadId, state: JobState) {
        self.state.lock().await.states.insert(id.clone(), state);
    }

    /// Choose the state a successful `run` produces.
    pub async fn set_run_outcome(&self, state: JobState) {
        *self.run_outcome.lock().await = state;
    }

    pub async fn run_outcome(&self) -> JobState {
        *self.run_outcome.lock().await
    }

    /// Make the next `count` runs fail.
    pub fn fail_next_runs(&self, count: u32) {
        self.failing_runs.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` runs fail before the workload is deployed.
    pub fn fail_next_deploys(&self, count: u32) {
        self.failing_deploys.store(count, Ordering::SeqCst);
    }

    pub async fn calls(&self, id: &WorkloadId) -> CallCounts {
        self.state
            .lock()
            .await
            .calls
            .get(id)
            .copied()
            .unwrap_or_default()
    }

    /// Counters summed over all workloads.
    pub async fn total_calls(&self) -> CallCounts {
        self.state
            .lock()
            .await
            .calls
            .values()
            .fold(CallCounts::default(), |acc, c| CallCounts {
                run: acc.run + c.run,
                stop: acc.stop + c.stop,
                remove: acc.remove + c.remove,
            })
    }

    async fn simulate_latency(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn run(&self, workload: &Workload) -> Result<(), ExecutorError> {
        self.simulate_latency().await;
        let id = workload.id();
        let outcome = *self.run_outcome.lock().await;

        let mut state = self.state.lock().await;
        state.calls.entry(id.clone()).or_default().run += 1;

        if Self::take_failure(&self.failing_deploys) {
            return Err(ExecutorError::Deploy {
                workload: workload.name().to_string(),
                reason: "mock executor configured to fail".to_string(),
            });
        }
        if Self::take_failure(&self.failing_runs) {
            return Err(ExecutorError::Run {
                workload: workload.name().to_string(),
                reason: "mock executor configured to fail".to_string(),
            });
        }

        info!(workload = %workload.name(), id = %id.short(), "[MOCK] Running workload");
        state.states.insert(id, outcome);
        Ok(())
    }

    async fn stop(&self, workload: &Workload) -> Result<(), ExecutorError> {
        self.simulate_latency().await;
        let id = workload.id();

        let mut state = self.state.lock().await;
        state.calls.entry(id.clone()).or_default().stop += 1;

        info!(workload = %workload.name(), id = %id.short(), "[MOCK] Stopping workload");
        if let Some(s) = state.states.get_mut(&id) {
            *s = JobState::Exited;
        }
        Ok(())
    }

    async fn remove(&self, workload: &Workload) -> Result<(), ExecutorError> {
        self.simulate_latency().await;
        let id = workload.id();

        let mut state = self.state.lock().await;
        state.calls.entry(id.clone()).or_default().remove += 1;

        debug!(workload = %workload.name(), id = %id.short(), "[MOCK] Removing workload");
        state.states.remove(&id);
        Ok(())
    }

    async fn exists(&self, workload: &Workload) -> Result<bool, ExecutorError> {
        self.simulate_latency().await;
        Ok(self.state.lock().await.states.contains_key(&workload.id()))
    }

    async fn get_state(&self, workload: &Workload) -> Result<JobState, ExecutorError> {
        self.simulate_latency().await;
        Ok(self
            .state
            .lock()
            .await
            .states
            .get(&workload.id())
            .copied()
            .unwrap_or(JobState::Unknown))
    }
}
