//! Resource slices for CPU control.
//!
//! Each running job gets a slice named `<root>-<job id>.slice`. The slice
//! carries a CPU quota derived from the workload's container limits.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use flotta_id::WorkloadId;
use thiserror::Error;
use tracing::{debug, warn};

/// Default CFS period.
pub const DEFAULT_CPU_PERIOD: Duration = Duration::from_millis(100);

/// Errors from slice operations.
#[derive(Debug, Error)]
pub enum SliceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("slice {0} still has processes")]
    Busy(PathBuf),

    #[error("slice {0} does not exist")]
    Missing(PathBuf),

    #[error("resource manager unavailable: {0}")]
    Unavailable(String),
}

/// CPU bandwidth for a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuResources {
    /// Quota in microseconds per period, `None` for unlimited.
    pub quota_us: Option<u64>,
    pub period_us: u64,
}

impl CpuResources {
    pub fn unlimited() -> Self {
        Self {
            quota_us: None,
            period_us: DEFAULT_CPU_PERIOD.as_micros() as u64,
        }
    }

    /// Quota for a limit in millicores over the default period.
    pub fn from_millicores(millicores: Option<u64>) -> Self {
        let period_us = DEFAULT_CPU_PERIOD.as_micros() as u64;
        Self {
            quota_us: millicores.map(|m| m.saturating_mul(period_us) / 1000),
            period_us,
        }
    }

    /// The `cpu.max` line: `"<quota|max> <period>"`.
    pub fn cpu_max(&self) -> String {
        match self.quota_us {
            Some(quota) => format!("{quota} {}", self.period_us),
            None => format!("max {}", self.period_us),
        }
    }
}

/// Slice path for a job.
pub fn slice_path(root_slice: &str, id: &WorkloadId) -> String {
    format!("{root_slice}-{id}.slice")
}

/// Resource slice management interface.
pub trait ResourceManager: Send + Sync {
    fn slice_exists(&self, path: &str) -> Result<bool, SliceError>;

    fn create_slice(&self, path: &str) -> Result<(), SliceError>;

    fn remove_slice(&self, path: &str) -> Result<(), SliceError>;

    /// Install a CPU quota on an existing slice.
    fn set(&self, path: &str, cpu: &CpuResources) -> Result<(), SliceError>;
}

// =============================================================================
// cgroup v2
// =============================================================================

/// Slices as directories in a cgroup v2 hierarchy.
pub struct CgroupFsManager {
    root: PathBuf,
}

impl CgroupFsManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> SliceError + '_ {
    move |source| SliceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl ResourceManager for CgroupFsManager {
    fn slice_exists(&self, path: &str) -> Result<bool, SliceError> {
        Ok(self.dir(path).is_dir())
    }

    fn create_slice(&self, path: &str) -> Result<(), SliceError> {
        let dir = self.dir(path);
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        debug!(slice = %dir.display(), "Created slice");
        Ok(())
    }

    fn remove_slice(&self, path: &str) -> Result<(), SliceError> {
        let dir = self.dir(path);
        if !dir.exists() {
            return Ok(());
        }

        let procs = dir.join("cgroup.procs");
        if procs.exists() {
            let content = fs::read_to_string(&procs).map_err(io_error(&procs))?;
            if !content.trim().is_empty() {
                warn!(slice = %dir.display(), "Slice still has processes, skipping removal");
                return Err(SliceError::Busy(dir));
            }
        }

        // cgroupfs permits rmdir with interface files present; plain
        // directories do not.
        match fs::remove_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => {
                fs::remove_dir_all(&dir).map_err(io_error(&dir))?;
            }
            Err(e) => return Err(io_error(&dir)(e)),
        }
        debug!(slice = %dir.display(), "Removed slice");
        Ok(())
    }

    fn set(&self, path: &str, cpu: &CpuResources) -> Result<(), SliceError> {
        let dir = self.dir(path);
        if !dir.is_dir() {
            return Err(SliceError::Missing(dir));
        }
        let cpu_max = dir.join("cpu.max");
        fs::write(&cpu_max, cpu.cpu_max()).map_err(io_error(&cpu_max))?;
        debug!(slice = %dir.display(), cpu_max = %cpu.cpu_max(), "Set cpu.max");
        Ok(())
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Recorded slice operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceCall {
    Create(String),
    Remove(String),
    Set(String, CpuResources),
}

/// In-memory resource manager that records every mutation.
#[derive(Debug, Default)]
pub struct MockResourceManager {
    slices: Mutex<HashMap<String, Option<CpuResources>>>,
    calls: Mutex<Vec<SliceCall>>,
    fail: bool,
}

impl MockResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager whose every operation fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<SliceCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// CPU resources installed on a slice, if it exists.
    pub fn slice(&self, path: &str) -> Option<Option<CpuResources>> {
        self.slices.lock().ok()?.get(path).copied()
    }

    fn check(&self) -> Result<(), SliceError> {
        if self.fail {
            return Err(SliceError::Unavailable("mock configured to fail".to_string()));
        }
        Ok(())
    }

    fn record(&self, call: SliceCall) -> Result<(), SliceError> {
        let mut calls = self
            .calls
            .lock()
            .map_err(|_| SliceError::Unavailable("poisoned".to_string()))?;
        calls.push(call);
        Ok(())
    }

    fn with_slices<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Option<CpuResources>>) -> T,
    ) -> Result<T, SliceError> {
        let mut slices = self
            .slices
            .lock()
            .map_err(|_| SliceError::Unavailable("poisoned".to_string()))?;
        Ok(f(&mut slices))
    }
}

impl ResourceManager for MockResourceManager {
    fn slice_exists(&self, path: &str) -> Result<bool, SliceError> {
        self.check()?;
        self.with_slices(|s| s.contains_key(path))
    }

    fn create_slice(&self, path: &str) -> Result<(), SliceError> {
        self.check()?;
        self.record(SliceCall::Create(path.to_string()))?;
        self.with_slices(|s| {
            s.entry(path.to_string()).or_insert(None);
        })
    }

    fn remove_slice(&self, path: &str) -> Result<(), SliceError> {
        self.check()?;
        self.record(SliceCall::Remove(path.to_string()))?;
        self.with_slices(|s| {
            s.remove(path);
        })
    }

    fn set(&self, path: &str, cpu: &CpuResources) -> Result<(), SliceError> {
        self.check()?;
        self.record(SliceCall::Set(path.to_string(), *cpu))?;
        self.with_slices(|s| match s.get_mut(path) {
            Some(slot) => {
                *slot = Some(*cpu);
                Ok(())
            }
            None => Err(SliceError::Missing(PathBuf::from(path))),
        })?
    }
}
