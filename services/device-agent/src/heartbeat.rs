//! Heartbeat payload.
//!
//! The heartbeat tells the control plane the device is alive, which
//! configuration version it runs and how each workload is doing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hardware::HardwareInfo;
use crate::job::JobState;
use crate::scheduler::JobStatus;

/// Overall device status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Up,
    /// At least one workload is in `Error` or `Degraded`.
    Degraded,
}

/// Per-workload entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkloadStatus {
    pub name: String,
    pub id: String,
    pub status: JobState,
}

#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub status: DeviceStatus,
    /// Last applied configuration version.
    pub version: String,
    pub time: DateTime<Utc>,
    pub workloads: Vec<WorkloadStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareInfo>,
}

impl Heartbeat {
    /// Build a heartbeat from the scheduler's status snapshot.
    ///
    /// Jobs already marked for deletion are not reported.
    pub fn build(
        statuses: &[JobStatus],
        version: impl Into<String>,
        hardware: Option<HardwareInfo>,
        time: DateTime<Utc>,
    ) -> Self {
        let workloads: Vec<WorkloadStatus> = statuses
            .iter()
            .filter(|s| !s.marked_for_deletion)
            .map(|s| WorkloadStatus {
                name: s.name.clone(),
                id: s.id.to_string(),
                status: s.current,
            })
            .collect();

        let degraded = workloads
            .iter()
            .any(|w| matches!(w.status, JobState::Error | JobState::Degraded));

        Self {
            status: if degraded {
                DeviceStatus::Degraded
            } else {
                DeviceStatus::Up
            },
            version: version.into(),
            time,
            workloads,
            hardware,
        }
    }
}
