//! flotta Device Agent Library
//!
//! The device agent runs on each edge device and manages workload lifecycle.
//! It pulls the desired workload set from the control plane and converges the
//! device toward it through a pluggable executor.
//!
//! ## Architecture
//!
//! ```text
//! Controller (enrol -> register -> operate)
//! ├── heartbeat + configuration fetch  ──▶ Scheduler (job store, tick loop)
//! │                                          └── Reconciler pipeline per job
//! │                                              log(cron(retry(base))) + resource slices
//! └── profiles ──▶ profile loop (metrics sampler + evaluator) ──▶ Scheduler
//! ```
//!
//! ## Modules
//!
//! - `controller`: enrol/register/operate state machine
//! - `scheduler`: job store and the reconciliation tick loop
//! - `reconciler`: per-job sync step and its middlewares
//! - `executor`: runtime capability interface and the in-memory executor
//! - `resources`: CPU slice management (cgroup v2)
//! - `client`, `certificate`: control-plane transport and TLS material

pub mod certificate;
pub mod client;
pub mod clock;
pub mod config;
pub mod controller;
pub mod executor;
pub mod hardware;
pub mod heartbeat;
pub mod job;
pub mod metrics;
pub mod reconciler;
pub mod resources;
pub mod scheduler;
pub mod workload;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use executor::{Executor, ExecutorError, MockExecutor, TimedExecutor};
pub use job::{Job, JobState};
pub use resources::{CgroupFsManager, MockResourceManager, ResourceManager};
pub use scheduler::{DesiredSet, DesiredStateMessage, JobStatus, Scheduler};
pub use workload::{AnsibleWorkload, PodWorkload, Workload};
