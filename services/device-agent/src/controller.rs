//! Device lifecycle controller.
//!
//! The controller is a small state machine:
//!
//! ```text
//! Enrolling ──ok──▶ Registering ──ok──▶ Operating ──┐
//!                        ▲                          │ tick: heartbeat +
//!                        └──────── 401 ─────────────┘       configuration
//! ```
//!
//! Failures keep the current phase and back off before the next attempt.
//! In `Operating` the controller forwards the desired workload set to the
//! scheduler and the profile configuration to the profile loop.

use std::sync::Arc;
use std::time::Duration;

use flotta_id::DeviceId;
use flotta_reconcile::BackoffPolicy;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::certificate::{CertificateError, CertificateManager};
use crate::client::{ControlPlane, EnrolmentFeatures, EnrolmentInfo, TransportError};
use crate::clock::Clock;
use crate::hardware::HardwareInfo;
use crate::heartbeat::Heartbeat;
use crate::metrics::ProfileConfig;
use crate::scheduler::{DesiredStateMessage, JobStatus, DEFAULT_HEARTBEAT_PERIOD};

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Enrolling,
    Registering,
    Operating,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Enrolling => write!(f, "enrolling"),
            Phase::Registering => write!(f, "registering"),
            Phase::Operating => write!(f, "operating"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("certificate error: {0}")]
    Certificate(#[from] CertificateError),

    #[error("scheduler is no longer accepting desired state")]
    SchedulerGone,
}

impl ControllerError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ControllerError::Transport(e) if e.is_unauthorized())
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace requested at enrolment.
    pub namespace: String,
    /// Tick period while operating, until the control plane sets one.
    pub heartbeat_period: Duration,
    /// Delay between failed attempts.
    pub backoff: BackoffPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            backoff: BackoffPolicy::exponential(
                Duration::from_secs(1),
                Duration::from_secs(60),
                2.0,
            ),
        }
    }
}

/// Channels the controller feeds.
pub struct ControllerChannels {
    pub desired_tx: mpsc::Sender<DesiredStateMessage>,
    pub profiles_tx: watch::Sender<ProfileConfig>,
    pub status_rx: watch::Receiver<Vec<JobStatus>>,
}

pub struct Controller {
    device_id: DeviceId,
    control_plane: Arc<dyn ControlPlane>,
    certificates: Arc<CertificateManager>,
    channels: ControllerChannels,
    clock: Arc<dyn Clock>,
    config: ControllerConfig,

    phase: Phase,
    /// Last applied configuration version.
    version: String,
    include_hardware: bool,
    period: Duration,
    consecutive_failures: u32,
}

impl Controller {
    /// Starts in `Operating` when a client certificate is already present,
    /// otherwise in `Enrolling`.
    pub fn new(
        device_id: DeviceId,
        control_plane: Arc<dyn ControlPlane>,
        certificates: Arc<CertificateManager>,
        channels: ControllerChannels,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
    ) -> Self {
        let phase = if certificates.has_client_certificate() {
            Phase::Operating
        } else {
            Phase::Enrolling
        };

        Self {
            device_id,
            control_plane,
            certificates,
            channels,
            clock,
            period: config.heartbeat_period,
            config,
            phase,
            version: String::new(),
            include_hardware: false,
            consecutive_failures: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Run one attempt of the current phase.
    ///
    /// An unauthorized response while registering or operating rewinds to
    /// `Registering`; any other error leaves the phase unchanged.
    pub async fn step(&mut self) -> Result<Phase, ControllerError> {
        let result = match self.phase {
            Phase::Enrolling => self.enrol().await,
            Phase::Registering => self.register().await,
            Phase::Operating => self.operate().await,
        };

        match result {
            Ok(next) => {
                if next != self.phase {
                    info!(from = %self.phase, to = %next, "Controller phase changed");
                }
                self.phase = next;
                self.consecutive_failures = 0;
                Ok(next)
            }
            Err(e) => {
                self.consecutive_failures += 1;
                if e.is_unauthorized() && self.phase != Phase::Enrolling {
                    warn!(from = %self.phase, "Client certificate rejected, registering again");
                    self.phase = Phase::Registering;
                }
                Err(e)
            }
        }
    }

    /// How long to wait before the next step.
    pub fn next_delay(&self) -> Duration {
        if self.consecutive_failures > 0 {
            return self.config.backoff.delay(self.consecutive_failures - 1);
        }
        match self.phase {
            Phase::Operating => self.period,
            Phase::Enrolling | Phase::Registering => Duration::ZERO,
        }
    }

    async fn enrol(&mut self) -> Result<Phase, ControllerError> {
        let info = EnrolmentInfo {
            target_namespace: self.config.namespace.clone(),
            features: EnrolmentFeatures {
                hardware: HardwareInfo::collect(),
            },
        };
        self.control_plane.enrol(&self.device_id, &info).await?;
        info!(device_id = %self.device_id, namespace = %self.config.namespace, "Device enrolled");
        Ok(Phase::Registering)
    }

    async fn register(&mut self) -> Result<Phase, ControllerError> {
        let request = self.certificates.create_csr(&self.device_id)?;
        let certificate = self
            .control_plane
            .register(&self.device_id, &request.csr_pem)
            .await?;
        self.certificates.install_certificate(&request, &certificate)?;
        info!(device_id = %self.device_id, "Device registered");
        Ok(Phase::Operating)
    }

    async fn operate(&mut self) -> Result<Phase, ControllerError> {
        let statuses = self.channels.status_rx.borrow().clone();
        let hardware = self.include_hardware.then(HardwareInfo::collect);
        let heartbeat = Heartbeat::build(&statuses, self.version.clone(), hardware, self.clock.now());
        self.control_plane
            .heartbeat(&self.device_id, &heartbeat)
            .await?;
        debug!(status = ?heartbeat.status, workloads = heartbeat.workloads.len(), "Heartbeat sent");

        let message = self.control_plane.get_configuration(&self.device_id).await?;

        if message.version != self.version {
            info!(
                old_version = %self.version,
                new_version = %message.version,
                workloads = message.workloads.len(),
                "Configuration changed"
            );
            self.version = message.version.clone();
        }
        self.include_hardware = message.include_hardware();

        let heartbeat_period = message.heartbeat_period();
        if let Some(period) = heartbeat_period {
            self.period = period;
        }

        self.channels
            .desired_tx
            .send(DesiredStateMessage {
                desired: message.desired_set(),
                heartbeat_period,
            })
            .await
            .map_err(|_| ControllerError::SchedulerGone)?;

        let profiles = ProfileConfig::from_device_profiles(
            &message.configuration.profiles,
            message.monitoring_interval(),
        );
        self.channels.profiles_tx.send_if_modified(|current| {
            if *current == profiles {
                false
            } else {
                *current = profiles;
                true
            }
        });

        Ok(Phase::Operating)
    }

    /// Run until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(device_id = %self.device_id, phase = %self.phase, "Starting controller");

        loop {
            match self.step().await {
                Ok(_) => {}
                Err(ControllerError::SchedulerGone) => {
                    info!("Scheduler stopped, controller exiting");
                    break;
                }
                Err(e) => {
                    let consecutive_failures = self.consecutive_failures;
                    if consecutive_failures <= 3 {
                        warn!(
                            error = %e,
                            phase = %self.phase,
                            consecutive_failures,
                            "Controller step failed"
                        );
                    } else {
                        error!(
                            error = %e,
                            phase = %self.phase,
                            consecutive_failures,
                            "Controller step failed repeatedly"
                        );
                    }
                }
            }

            let delay = self.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Controller shutting down");
    }
}
