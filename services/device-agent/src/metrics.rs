//! Metric sampling and profile evaluation.
//!
//! The profile loop samples host metrics at the monitoring interval,
//! evaluates every configured profile against them and sends a
//! [`ProfileEvent`] to the scheduler whenever a profile's state changes.

use std::sync::Arc;
use std::time::Duration;

use flotta_profile::{Profile, ProfileEvaluator, ProfileEvent, Variables};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::client::DeviceProfile;
use crate::hardware::SystemResources;

/// Default interval between metric samples.
pub const DEFAULT_MONITORING_INTERVAL: Duration = Duration::from_secs(15);

/// Profiles to evaluate and how often.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileConfig {
    pub profiles: Vec<Profile>,
    pub interval: Duration,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            profiles: Vec::new(),
            interval: DEFAULT_MONITORING_INTERVAL,
        }
    }
}

impl ProfileConfig {
    /// Parse profiles as received from the control plane. Conditions that do
    /// not parse are logged and left out.
    pub fn from_device_profiles(profiles: &[DeviceProfile], interval: Option<Duration>) -> Self {
        let profiles = profiles
            .iter()
            .map(|profile| {
                let (parsed, errors) = Profile::parse(
                    profile.name.clone(),
                    profile
                        .conditions
                        .iter()
                        .map(|c| (c.name.clone(), c.expression.as_str())),
                );
                for error in errors {
                    warn!(error = %error, "Skipping unparsable profile condition");
                }
                parsed
            })
            .collect();

        Self {
            profiles,
            interval: interval.unwrap_or(DEFAULT_MONITORING_INTERVAL),
        }
    }
}

/// Source of metric variables.
pub trait MetricsSampler: Send + Sync {
    fn sample(&self) -> Variables;
}

/// Samples CPU and memory of the host.
#[derive(Debug, Default)]
pub struct HostSampler;

impl MetricsSampler for HostSampler {
    fn sample(&self) -> Variables {
        SystemResources::measure().to_variables()
    }
}

/// Owns the profile evaluator and feeds it samples.
pub struct ProfileLoop {
    evaluator: ProfileEvaluator,
    sampler: Arc<dyn MetricsSampler>,
    events_tx: mpsc::Sender<ProfileEvent>,
}

impl ProfileLoop {
    pub fn new(sampler: Arc<dyn MetricsSampler>, events_tx: mpsc::Sender<ProfileEvent>) -> Self {
        Self {
            evaluator: ProfileEvaluator::new(),
            sampler,
            events_tx,
        }
    }

    pub fn evaluator(&self) -> &ProfileEvaluator {
        &self.evaluator
    }

    pub fn set_profiles(&mut self, profiles: Vec<Profile>) {
        info!(profile_count = profiles.len(), "Profiles updated");
        self.evaluator.set_profiles(profiles);
    }

    /// Sample once, evaluate, and forward state changes. Returns the number
    /// of events sent.
    pub async fn evaluate_once(&mut self) -> usize {
        if self.evaluator.profiles().is_empty() {
            return 0;
        }

        let variables = self.sampler.sample();
        let report = self.evaluator.evaluate(&variables);

        for error in &report.errors {
            warn!(
                profile = %error.profile,
                condition = %error.condition,
                error = %error.error,
                "Profile condition failed to evaluate"
            );
        }

        let mut sent = 0;
        for event in report.events {
            debug!(profile = %event.profile, current = ?event.current, "Profile event");
            if self.events_tx.send(event).await.is_err() {
                warn!("Scheduler is gone, dropping profile event");
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Run until shutdown, following configuration updates.
    pub async fn run(
        mut self,
        mut config_rx: watch::Receiver<ProfileConfig>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let initial = config_rx.borrow_and_update().clone();
        let mut period = initial.interval;
        self.set_profiles(initial.profiles);

        info!(interval_secs = period.as_secs(), "Starting profile loop");
        let mut interval = sample_interval(period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.evaluate_once().await;
                }
                result = config_rx.changed() => {
                    if result.is_err() {
                        break;
                    }
                    let config = config_rx.borrow_and_update().clone();
                    if config.interval != period {
                        period = config.interval;
                        interval = sample_interval(period);
                    }
                    if config.profiles != self.evaluator.profiles() {
                        self.set_profiles(config.profiles);
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Profile loop shutting down");
    }
}

fn sample_interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(100)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}
