//! In-memory job store.
//!
//! Owned exclusively by the scheduler task. Keyed by workload ID, so the
//! store never holds two jobs for the same workload hash.

use std::collections::HashMap;

use flotta_id::WorkloadId;

use crate::job::Job;

/// Jobs keyed by workload ID.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: HashMap<WorkloadId, Job>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job. Returns `false` and leaves the store untouched if a job
    /// with the same ID is already present.
    pub fn insert(&mut self, job: Job) -> bool {
        if self.jobs.contains_key(job.id()) {
            return false;
        }
        self.jobs.insert(job.id().clone(), job);
        true
    }

    pub fn get(&self, id: &WorkloadId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &WorkloadId) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    pub fn remove(&mut self, id: &WorkloadId) -> Option<Job> {
        self.jobs.remove(id)
    }

    pub fn contains(&self, id: &WorkloadId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Snapshot of the current IDs.
    pub fn ids(&self) -> Vec<WorkloadId> {
        self.jobs.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.values_mut()
    }

    /// Drop every job that is marked for deletion and gone from the runtime.
    pub fn collect_garbage(&mut self) -> Vec<Job> {
        let ids: Vec<WorkloadId> = self
            .jobs
            .values()
            .filter(|job| job.is_collectable())
            .map(|job| job.id().clone())
            .collect();

        ids.iter().filter_map(|id| self.jobs.remove(id)).collect()
    }
}
