//! Scheduler: owns the job store and drives reconciliation.
//!
//! The scheduler:
//! - Receives desired-set messages and diffs them against the job store
//! - Runs the reconciler pipeline over every job on each heartbeat tick
//! - Reconciles resource slices after the pipeline
//! - Garbage-collects jobs that were removed and are gone from the runtime
//! - Publishes a status snapshot after every tick

mod store;

pub use store::JobStore;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use flotta_id::WorkloadId;
use flotta_profile::ProfileEvent;
use flotta_reconcile::{BackoffPolicy, CronGate, RetryGate, DEFAULT_MAX_ATTEMPTS};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::executor::Executor;
use crate::job::{Job, JobState};
use crate::reconciler::{pipeline, JobSync, ResourceSync};
use crate::resources::ResourceManager;
use crate::workload::Workload;

/// Default heartbeat period.
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

/// The workloads the control plane wants on this device.
#[derive(Debug, Clone, Default)]
pub enum DesiredSet {
    /// No workloads at all.
    #[default]
    Empty,
    Workloads(HashMap<WorkloadId, Arc<Workload>>),
}

impl DesiredSet {
    /// Build a set keyed by workload ID. An empty input is `Empty`.
    pub fn from_workloads(workloads: impl IntoIterator<Item = Workload>) -> Self {
        let map: HashMap<_, _> = workloads
            .into_iter()
            .map(|w| (w.id(), Arc::new(w)))
            .collect();
        if map.is_empty() {
            Self::Empty
        } else {
            Self::Workloads(map)
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Workloads(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Message from the controller to the scheduler.
#[derive(Debug, Clone, Default)]
pub struct DesiredStateMessage {
    pub desired: DesiredSet,
    /// New heartbeat period, if the control plane set one.
    pub heartbeat_period: Option<Duration>,
}

/// Snapshot of one job, published after every tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub id: WorkloadId,
    pub name: String,
    pub current: JobState,
    pub target: JobState,
    pub marked_for_deletion: bool,
}

impl From<&Job> for JobStatus {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id().clone(),
            name: job.name().to_string(),
            current: job.current_state(),
            target: job.target_state(),
            marked_for_deletion: job.is_marked_for_deletion(),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub heartbeat_period: Duration,
    /// Prefix for resource slice names.
    pub root_slice: String,
    /// Backoff applied to restarts of new jobs.
    pub retry_policy: BackoffPolicy,
    pub max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            root_slice: "flotta".to_string(),
            retry_policy: BackoffPolicy::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub reconciled: usize,
    pub failed: usize,
    pub collected: usize,
    /// The tick stopped early because of shutdown.
    pub interrupted: bool,
}

/// Owns the job store and reconciles it on every heartbeat.
pub struct Scheduler {
    store: JobStore,
    sync: Box<dyn JobSync>,
    resources: ResourceSync,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    profile_states: BTreeMap<String, Option<String>>,
    status_tx: watch::Sender<Vec<JobStatus>>,
}

impl Scheduler {
    pub fn new(
        executor: Arc<dyn Executor>,
        resource_manager: Arc<dyn ResourceManager>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(Vec::new());
        Self {
            store: JobStore::new(),
            sync: Box::new(pipeline(executor)),
            resources: ResourceSync::new(resource_manager, config.root_slice.clone()),
            clock,
            config,
            profile_states: BTreeMap::new(),
            status_tx,
        }
    }

    /// Receiver for the status snapshot published after every tick.
    pub fn subscribe(&self) -> watch::Receiver<Vec<JobStatus>> {
        self.status_tx.subscribe()
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn heartbeat_period(&self) -> Duration {
        self.config.heartbeat_period
    }

    /// Latest state reported for a profile.
    pub fn profile_state(&self, profile: &str) -> Option<&str> {
        self.profile_states.get(profile)?.as_deref()
    }

    /// Diff a desired set against the store.
    ///
    /// New workloads become jobs targeting `Running`. Jobs missing from the
    /// set are marked for deletion and targeted at `Exited`. A job still
    /// pending deletion that shows up again is restored.
    pub fn apply_desired(&mut self, desired: DesiredSet) {
        let now = self.clock.now();

        let workloads = match desired {
            DesiredSet::Empty => HashMap::new(),
            DesiredSet::Workloads(map) => map,
        };

        for job in self.store.iter_mut() {
            if !workloads.contains_key(job.id()) && !job.is_marked_for_deletion() {
                info!(job_id = %job.id().short(), workload = %job.name(), "Workload removed from desired set");
                job.mark_for_deletion();
                job.set_target_state(JobState::Exited);
            }
        }

        for (id, workload) in workloads {
            if let Some(job) = self.store.get_mut(&id) {
                if job.is_marked_for_deletion() {
                    info!(job_id = %id.short(), workload = %job.name(), "Workload desired again");
                    job.restore();
                }
                continue;
            }
            let job = self.new_job(workload, now);
            info!(job_id = %id.short(), workload = %job.name(), kind = job.workload().kind(), "New workload");
            self.store.insert(job);
        }
    }

    fn new_job(&self, workload: Arc<Workload>, now: chrono::DateTime<chrono::Utc>) -> Job {
        let retry = RetryGate::bounded(self.config.retry_policy.clone(), self.config.max_attempts);
        let mut job = Job::new(Arc::clone(&workload)).with_retry_gate(retry);

        if let Some(expression) = workload.cron() {
            match CronGate::new(expression, now) {
                Ok(gate) => job = job.with_cron_gate(gate),
                Err(e) => warn!(
                    workload = %workload.name(),
                    error = %e,
                    "Ignoring invalid cron schedule"
                ),
            }
        }

        job.set_target_state(JobState::Running);
        job
    }

    /// Apply a controller message. Returns `true` if the heartbeat period
    /// changed.
    pub fn apply_message(&mut self, message: DesiredStateMessage) -> bool {
        self.apply_desired(message.desired);

        match message.heartbeat_period {
            Some(period) if !period.is_zero() && period != self.config.heartbeat_period => {
                info!(
                    old_period_ms = self.config.heartbeat_period.as_millis() as u64,
                    new_period_ms = period.as_millis() as u64,
                    "Heartbeat period changed"
                );
                self.config.heartbeat_period = period;
                true
            }
            _ => false,
        }
    }

    pub fn handle_profile_event(&mut self, event: ProfileEvent) {
        info!(
            profile = %event.profile,
            previous = event.previous.as_deref().unwrap_or("none"),
            current = event.current.as_deref().unwrap_or("none"),
            "Profile state changed"
        );
        self.profile_states.insert(event.profile, event.current);
    }

    /// Reconcile every job once, then collect garbage and publish status.
    pub async fn tick(&mut self) -> TickReport {
        self.tick_until(None).await
    }

    async fn tick_until(&mut self, shutdown: Option<&watch::Receiver<bool>>) -> TickReport {
        let mut report = TickReport::default();

        for id in self.store.ids() {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                report.interrupted = true;
                break;
            }

            let now = self.clock.now();
            let Some(job) = self.store.get_mut(&id) else {
                continue;
            };

            if self.sync.sync(job, now).await.is_err() {
                report.failed += 1;
            }
            self.resources.reconcile(job);
            report.reconciled += 1;
        }

        for job in self.store.collect_garbage() {
            info!(job_id = %job.id().short(), workload = %job.name(), "Job removed");
            report.collected += 1;
        }

        self.publish_status();
        report
    }

    /// Current status of every job, ordered by name then ID.
    pub fn statuses(&self) -> Vec<JobStatus> {
        let mut statuses: Vec<JobStatus> = self.store.iter().map(JobStatus::from).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        statuses
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.statuses());
    }

    /// Run the scheduler loop until shutdown.
    ///
    /// Desired-set messages arriving between ticks are coalesced: only the
    /// latest is applied, before the next tick's reconcile.
    pub async fn run(
        mut self,
        mut desired_rx: mpsc::Receiver<DesiredStateMessage>,
        mut profile_rx: mpsc::Receiver<ProfileEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            heartbeat_period_ms = self.config.heartbeat_period.as_millis() as u64,
            root_slice = %self.config.root_slice,
            "Starting scheduler"
        );

        let mut interval = heartbeat_interval(self.config.heartbeat_period);
        let mut pending: Option<DesiredStateMessage> = None;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Some(message) = pending.take() {
                        if self.apply_message(message) {
                            interval = heartbeat_interval(self.config.heartbeat_period);
                            interval.reset();
                        }
                    }

                    let report = self.tick_until(Some(&shutdown)).await;
                    debug!(
                        jobs = self.store.len(),
                        reconciled = report.reconciled,
                        failed = report.failed,
                        collected = report.collected,
                        "Scheduler tick"
                    );
                    if report.interrupted {
                        break;
                    }
                }
                Some(message) = desired_rx.recv() => {
                    debug!(workloads = message.desired.len(), "Desired set received");
                    pending = Some(message);
                }
                Some(event) = profile_rx.recv() => {
                    self.handle_profile_event(event);
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(jobs = self.store.len(), "Scheduler shutting down");
    }
}

fn heartbeat_interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::executor::MockExecutor;
    use crate::resources::MockResourceManager;
    use crate::workload::PodWorkload;
    use chrono::TimeZone;

    fn pod(name: &str, spec: &str) -> Workload {
        Workload::Pod(PodWorkload {
            name: name.into(),
            namespace: "default".into(),
            specification: spec.into(),
            ..Default::default()
        })
    }

    fn setup() -> (Arc<MockExecutor>, Arc<MockResourceManager>, Scheduler) {
        let executor = Arc::new(MockExecutor::new());
        let resources = Arc::new(MockResourceManager::new());
        let clock = Arc::new(ManualClock::new(
            chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let scheduler = Scheduler::new(
            executor.clone(),
            resources.clone(),
            clock,
            SchedulerConfig::default(),
        );
        (executor, resources, scheduler)
    }

    #[test]
    fn test_desired_set_from_empty_is_empty() {
        assert!(matches!(DesiredSet::from_workloads(Vec::new()), DesiredSet::Empty));
        let set = DesiredSet::from_workloads(vec![pod("a", "x"), pod("a", "x")]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_apply_desired_creates_running_jobs() {
        let (_, _, mut scheduler) = setup();
        scheduler.apply_desired(DesiredSet::from_workloads(vec![pod("a", "1"), pod("b", "2")]));

        assert_eq!(scheduler.store().len(), 2);
        for job in scheduler.store().iter() {
            assert_eq!(job.target_state(), JobState::Running);
            assert_eq!(job.current_state(), JobState::Ready);
            assert!(job.retry_gate().is_some());
            assert!(job.cron_gate().is_none());
        }
    }

    #[test]
    fn test_apply_same_desired_twice_is_noop() {
        let (_, _, mut scheduler) = setup();
        let desired = DesiredSet::from_workloads(vec![pod("a", "1")]);
        scheduler.apply_desired(desired.clone());
        let before = scheduler.statuses();
        scheduler.apply_desired(desired);
        assert_eq!(scheduler.statuses(), before);
    }

    #[test]
    fn test_empty_desired_marks_everything() {
        let (_, _, mut scheduler) = setup();
        scheduler.apply_desired(DesiredSet::from_workloads(vec![pod("a", "1"), pod("b", "2")]));
        scheduler.apply_desired(DesiredSet::Empty);

        for job in scheduler.store().iter() {
            assert!(job.is_marked_for_deletion());
            assert_eq!(job.target_state(), JobState::Exited);
        }
    }

    #[test]
    fn test_invalid_cron_creates_job_without_gate() {
        let (_, _, mut scheduler) = setup();
        let workload = Workload::Pod(PodWorkload {
            name: "batch".into(),
            cron: Some("not a schedule".into()),
            ..Default::default()
        });
        scheduler.apply_desired(DesiredSet::from_workloads(vec![workload]));

        let job = scheduler.store().iter().next().unwrap();
        assert!(job.cron_gate().is_none());
        assert_eq!(job.target_state(), JobState::Running);
    }

    #[tokio::test]
    async fn test_tick_runs_and_publishes_status() {
        let (executor, resources, mut scheduler) = setup();
        let status = scheduler.subscribe();
        scheduler.apply_desired(DesiredSet::from_workloads(vec![pod("a", "1")]));

        let report = scheduler.tick().await;

        assert_eq!(report.reconciled, 1);
        assert_eq!(report.failed, 0);
        let statuses = status.borrow().clone();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].current, JobState::Running);
        assert_eq!(executor.calls(&statuses[0].id).await.run, 1);
        assert_eq!(resources.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_unstarted_job_removed_is_collected() {
        let (executor, _, mut scheduler) = setup();
        scheduler.apply_desired(DesiredSet::from_workloads(vec![pod("a", "1")]));
        scheduler.apply_desired(DesiredSet::Empty);

        let report = scheduler.tick().await;

        assert_eq!(report.collected, 1);
        assert!(scheduler.store().is_empty());
        assert_eq!(executor.total_calls().await.run, 0);
    }

    #[tokio::test]
    async fn test_crashed_job_removed_is_collected() {
        let (executor, _, mut scheduler) = setup();
        scheduler.apply_desired(DesiredSet::from_workloads(vec![pod("a", "1")]));
        scheduler.tick().await;
        let id = scheduler.statuses()[0].id.clone();

        executor.set_state(&id, JobState::Exited).await;
        scheduler.tick().await;
        scheduler.apply_desired(DesiredSet::Empty);
        let report = scheduler.tick().await;

        assert_eq!(report.collected, 1);
        assert!(scheduler.store().is_empty());
        let calls = executor.calls(&id).await;
        assert_eq!((calls.run, calls.remove), (1, 1));
    }

    #[tokio::test]
    async fn test_job_desired_again_is_kept_running() {
        let (executor, _, mut scheduler) = setup();
        let desired = DesiredSet::from_workloads(vec![pod("a", "1")]);
        scheduler.apply_desired(desired.clone());
        scheduler.tick().await;

        scheduler.apply_desired(DesiredSet::Empty);
        scheduler.apply_desired(desired);
        let report = scheduler.tick().await;

        assert_eq!(report.collected, 0);
        let job = scheduler.store().iter().next().unwrap();
        assert!(!job.is_marked_for_deletion());
        assert_eq!(job.target_state(), JobState::Running);
        let calls = executor.total_calls().await;
        assert_eq!((calls.run, calls.stop), (1, 0));
    }

    #[test]
    fn test_heartbeat_period_update() {
        let (_, _, mut scheduler) = setup();
        let changed = scheduler.apply_message(DesiredStateMessage {
            desired: DesiredSet::Empty,
            heartbeat_period: Some(Duration::from_secs(10)),
        });
        assert!(changed);
        assert_eq!(scheduler.heartbeat_period(), Duration::from_secs(10));

        let unchanged = scheduler.apply_message(DesiredStateMessage {
            desired: DesiredSet::Empty,
            heartbeat_period: Some(Duration::from_secs(10)),
        });
        assert!(!unchanged);
    }

    #[test]
    fn test_profile_events_are_recorded() {
        let (_, _, mut scheduler) = setup();
        scheduler.handle_profile_event(ProfileEvent {
            profile: "power".into(),
            previous: None,
            current: Some("low".into()),
        });
        assert_eq!(scheduler.profile_state("power"), Some("low"));
        assert_eq!(scheduler.profile_state("other"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_applies_messages_and_stops() {
        let (executor, _, scheduler) = setup();
        let status = scheduler.subscribe();
        let (desired_tx, desired_rx) = mpsc::channel(4);
        let (_profile_tx, profile_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(scheduler.run(desired_rx, profile_rx, shutdown_rx));

        desired_tx
            .send(DesiredStateMessage {
                desired: DesiredSet::from_workloads(vec![pod("a", "1")]),
                heartbeat_period: None,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let statuses = status.borrow().clone();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].current, JobState::Running);
        assert_eq!(executor.total_calls().await.run, 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
