//! Common orchestration primitives for the ELAN manager.
//!
//! - [`JobCoordinator`]: per-key serialized, retrying job execution over a
//!   bounded worker pool
//! - [`TaskStatus`] / [`JobError`]: result classification for job bodies
//!
//! # Example
//!
//! ```ignore
//! use elan_orch_common::{JobCoordinator, JobConfig, JobError};
//!
//! let jobs = JobCoordinator::new(JobConfig::default());
//! jobs.enqueue("elan:blue", "sync-remote-group", move || async move {
//!     commit().await.map_err(|e| JobError::need_retry(e.to_string()))
//! });
//! jobs.wait_idle().await;
//! ```

mod job;
mod task;

pub use job::{
    JobConfig, JobCoordinator, JobStats, JobStatsSnapshot, DEFAULT_MAX_RETRIES,
    DEFAULT_MAX_WORKERS,
};
pub use task::{JobError, JobResult, JobResultExt, TaskStatus};
