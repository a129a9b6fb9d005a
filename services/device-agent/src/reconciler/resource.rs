//! Resource slice reconciliation.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::job::{Job, JobState};
use crate::resources::{slice_path, CpuResources, ResourceManager, SliceError};

/// Keeps each job's CPU slice in line with its target state.
///
/// Jobs targeting `Running` get a slice carrying the workload's CPU limit.
/// Every other target has its slice removed. Failures are logged only.
pub struct ResourceSync {
    manager: Arc<dyn ResourceManager>,
    root_slice: String,
}

impl ResourceSync {
    pub fn new(manager: Arc<dyn ResourceManager>, root_slice: impl Into<String>) -> Self {
        Self {
            manager,
            root_slice: root_slice.into(),
        }
    }

    pub fn slice_for(&self, job: &Job) -> String {
        slice_path(&self.root_slice, job.id())
    }

    pub fn reconcile(&self, job: &Job) {
        if let Err(e) = self.apply(job) {
            warn!(
                job_id = %job.id().short(),
                slice = %self.slice_for(job),
                error = %e,
                "Resource slice reconciliation failed"
            );
        }
    }

    fn apply(&self, job: &Job) -> Result<(), SliceError> {
        let path = self.slice_for(job);

        if job.target_state() == JobState::Running {
            if !self.manager.slice_exists(&path)? {
                self.manager.create_slice(&path)?;
                debug!(job_id = %job.id().short(), slice = %path, "Slice created");
            }
            let cpu = CpuResources::from_millicores(job.workload().cpu_limit());
            self.manager.set(&path, &cpu)
        } else {
            if self.manager.slice_exists(&path)? {
                self.manager.remove_slice(&path)?;
                debug!(job_id = %job.id().short(), slice = %path, "Slice removed");
            }
            Ok(())
        }
    }
}
