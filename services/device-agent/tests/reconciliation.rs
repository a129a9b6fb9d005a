//! Integration tests for the scheduler and reconciler.
//!
//! Each test drives a real `Scheduler` tick by tick against the in-memory
//! executor and resource manager, moving a manual clock between ticks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use flotta_device_agent::client::{DeviceProfile, ProfileCondition};
use flotta_device_agent::heartbeat::{DeviceStatus, Heartbeat};
use flotta_device_agent::metrics::{MetricsSampler, ProfileConfig, ProfileLoop};
use flotta_device_agent::resources::SliceCall;
use flotta_device_agent::scheduler::SchedulerConfig;
use flotta_device_agent::{
    Clock, DesiredSet, JobState, ManualClock, MockExecutor, MockResourceManager, PodWorkload, Scheduler,
    Workload,
};
use flotta_profile::{Value, Variables};
use tokio::sync::mpsc;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn pod(name: &str, spec: &str) -> Workload {
    Workload::Pod(PodWorkload {
        name: name.to_string(),
        namespace: "default".to_string(),
        specification: spec.to_string(),
        ..Default::default()
    })
}

struct Harness {
    executor: Arc<MockExecutor>,
    resources: Arc<MockResourceManager>,
    clock: Arc<ManualClock>,
    scheduler: Scheduler,
}

impl Harness {
    fn new(at: DateTime<Utc>) -> Self {
        let executor = Arc::new(MockExecutor::new());
        let resources = Arc::new(MockResourceManager::new());
        let clock = Arc::new(ManualClock::new(at));
        let scheduler = Scheduler::new(
            executor.clone(),
            resources.clone(),
            clock.clone(),
            SchedulerConfig::default(),
        );
        Self {
            executor,
            resources,
            clock,
            scheduler,
        }
    }

    /// Advance one second and tick, `seconds` times.
    async fn run_for(&mut self, seconds: u64) {
        for _ in 0..seconds {
            self.clock.advance(Duration::from_secs(1));
            self.scheduler.tick().await;
        }
    }
}

#[tokio::test]
async fn test_happy_deploy() {
    let mut h = Harness::new(start());
    h.scheduler.apply_desired(DesiredSet::from_workloads(vec![
        pod("w1", "containers: [nginx]"),
        pod("w2", "containers: [redis]"),
    ]));

    let report = h.scheduler.tick().await;
    assert_eq!(report.reconciled, 2);
    assert_eq!(report.failed, 0);

    let statuses = h.scheduler.statuses();
    assert_eq!(statuses.len(), 2);
    for status in &statuses {
        assert_eq!(status.current, JobState::Running);
        assert_eq!(status.target, JobState::Running);
        let calls = h.executor.calls(&status.id).await;
        assert_eq!((calls.run, calls.stop, calls.remove), (1, 0, 0));
    }

    let calls = h.resources.calls();
    assert_eq!(calls.iter().filter(|c| matches!(c, SliceCall::Create(_))).count(), 2);
    assert_eq!(calls.iter().filter(|c| matches!(c, SliceCall::Set(..))).count(), 2);

    // Further ticks leave running workloads alone.
    h.run_for(10).await;
    assert_eq!(h.executor.total_calls().await.run, 2);

    let heartbeat = Heartbeat::build(&h.scheduler.statuses(), "1", None, h.clock.now());
    assert_eq!(heartbeat.status, DeviceStatus::Up);
    assert_eq!(heartbeat.workloads.len(), 2);
}

#[tokio::test]
async fn test_graceful_removal() {
    let mut h = Harness::new(start());
    h.scheduler.apply_desired(DesiredSet::from_workloads(vec![
        pod("w1", "containers: [nginx]"),
        pod("w2", "containers: [redis]"),
    ]));
    h.scheduler.tick().await;
    let ids: Vec<_> = h.scheduler.statuses().into_iter().map(|s| s.id).collect();

    h.scheduler.apply_desired(DesiredSet::Empty);
    let report = h.scheduler.tick().await;

    assert_eq!(report.collected, 2);
    assert!(h.scheduler.store().is_empty());
    assert!(h.scheduler.statuses().is_empty());

    for id in &ids {
        let calls = h.executor.calls(id).await;
        assert_eq!((calls.run, calls.stop, calls.remove), (1, 1, 1));
    }
    let removed = h
        .resources
        .calls()
        .iter()
        .filter(|c| matches!(c, SliceCall::Remove(_)))
        .count();
    assert_eq!(removed, 2);
}

#[tokio::test]
async fn test_crash_restart_backs_off_and_gives_up() {
    let mut h = Harness::new(start());
    h.scheduler
        .apply_desired(DesiredSet::from_workloads(vec![pod("web", "containers: [nginx]")]));
    h.scheduler.tick().await;
    let id = h.scheduler.statuses()[0].id.clone();

    // The workload crashes and every restart exits again.
    h.executor.set_state(&id, JobState::Exited).await;
    h.executor.set_run_outcome(JobState::Exited).await;

    let mut run_times = Vec::new();
    let mut failures = 0;
    for second in 1..=1500 {
        h.clock.advance(Duration::from_secs(1));
        let before = h.executor.calls(&id).await.run;
        failures += h.scheduler.tick().await.failed;
        if h.executor.calls(&id).await.run > before {
            run_times.push(second);
        }
    }

    // Crash observed at 1s, restarts 30s, 90s and 270s apart.
    assert_eq!(run_times, vec![31, 121, 391]);
    assert_eq!(failures, 1);
    assert_eq!(h.scheduler.statuses()[0].current, JobState::Exited);
}

#[tokio::test]
async fn test_crash_restart_recovers() {
    let mut h = Harness::new(start());
    h.scheduler
        .apply_desired(DesiredSet::from_workloads(vec![pod("web", "containers: [nginx]")]));
    h.scheduler.tick().await;
    let id = h.scheduler.statuses()[0].id.clone();

    h.executor.set_state(&id, JobState::Exited).await;
    // Crash observed at 1s, restart due at 31s.
    h.run_for(30).await;
    assert_eq!(h.executor.calls(&id).await.run, 1);

    h.run_for(1).await;
    assert_eq!(h.executor.calls(&id).await.run, 2);
    assert_eq!(h.scheduler.statuses()[0].current, JobState::Running);

    h.run_for(600).await;
    assert_eq!(h.executor.calls(&id).await.run, 2);
}

#[tokio::test]
async fn test_modified_workload_is_replaced() {
    let mut h = Harness::new(start());
    h.scheduler
        .apply_desired(DesiredSet::from_workloads(vec![pod("web", "containers: [v1]")]));
    h.scheduler.tick().await;

    h.scheduler
        .apply_desired(DesiredSet::from_workloads(vec![pod("web", "containers: [v2]")]));
    let report = h.scheduler.tick().await;

    assert_eq!(report.collected, 1);
    let calls = h.executor.total_calls().await;
    assert_eq!(calls.run, 2);
    assert_eq!(calls.stop, 1);

    let statuses = h.scheduler.statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].id, pod("web", "containers: [v2]").id());
    assert_eq!(statuses[0].current, JobState::Running);
}

#[tokio::test]
async fn test_cron_workload_waits_for_schedule() {
    let mut h = Harness::new(start() + chrono::Duration::seconds(30));
    let workload = Workload::Pod(PodWorkload {
        name: "backup".to_string(),
        specification: "containers: [backup]".to_string(),
        cron: Some("*/5 * * * *".to_string()),
        ..Default::default()
    });
    h.scheduler
        .apply_desired(DesiredSet::from_workloads(vec![workload]));

    h.scheduler.tick().await;
    // 00:00:30 -> 00:04:59
    h.run_for(269).await;
    assert_eq!(h.executor.total_calls().await.run, 0);

    h.run_for(1).await;
    assert_eq!(h.executor.total_calls().await.run, 1);
    assert_eq!(h.scheduler.statuses()[0].current, JobState::Running);
}

#[tokio::test]
async fn test_removed_cron_workload_is_not_held_back() {
    let mut h = Harness::new(start() + chrono::Duration::seconds(30));
    let workload = Workload::Pod(PodWorkload {
        name: "backup".to_string(),
        cron: Some("*/5 * * * *".to_string()),
        ..Default::default()
    });
    h.scheduler
        .apply_desired(DesiredSet::from_workloads(vec![workload]));
    h.scheduler.tick().await;

    h.scheduler.apply_desired(DesiredSet::Empty);
    let report = h.scheduler.tick().await;
    assert_eq!(report.collected, 1);
}

struct FixedSampler(Variables);

impl MetricsSampler for FixedSampler {
    fn sample(&self) -> Variables {
        self.0.clone()
    }
}

#[tokio::test]
async fn test_profile_events_reach_scheduler() {
    let mut h = Harness::new(start());
    let (events_tx, mut events_rx) = mpsc::channel(8);

    let mut variables = Variables::new();
    variables.insert("cpu_cores".to_string(), Value::from(4i64));
    variables.insert("memory_used_percent".to_string(), Value::from(92.5));

    let mut profile_loop = ProfileLoop::new(Arc::new(FixedSampler(variables)), events_tx);
    let config = ProfileConfig::from_device_profiles(
        &[DeviceProfile {
            name: "memory".to_string(),
            conditions: vec![
                ProfileCondition {
                    name: "critical".to_string(),
                    expression: "memory_used_percent > 90% && cpu_cores >= 2".to_string(),
                },
                ProfileCondition {
                    name: "normal".to_string(),
                    expression: "memory_used_percent <= 90%".to_string(),
                },
            ],
        }],
        None,
    );
    profile_loop.set_profiles(config.profiles);

    assert_eq!(profile_loop.evaluate_once().await, 1);
    let event = events_rx.recv().await.unwrap();
    h.scheduler.handle_profile_event(event);

    assert_eq!(h.scheduler.profile_state("memory"), Some("critical"));
}
