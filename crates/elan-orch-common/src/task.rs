//! Job processing status and error types.

use thiserror::Error;

/// Final status of a single job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Job completed successfully
    Success,
    /// Job failed transiently and should be resubmitted
    NeedRetry,
    /// Job failed and must not be retried
    Failed,
    /// Job decided there was nothing to do
    Ignore,
}

impl TaskStatus {
    /// Returns true if the job completed (including deliberate no-ops).
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Ignore)
    }

    /// Returns true if the job should be resubmitted.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskStatus::NeedRetry)
    }

    /// Returns true if the job failed permanently.
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskStatus::Failed)
    }
}

/// Error returned by a job body.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// Transient failure (store commit, switch programming); retried.
    #[error("Retry needed: {reason}")]
    NeedRetry { reason: String },

    /// Permanent failure; logged and abandoned.
    #[error("Job failed: {message}")]
    Failed { message: String },

    /// The job body panicked or was aborted by the runtime.
    #[error("Job aborted: {message}")]
    Aborted { message: String },
}

impl JobError {
    pub fn need_retry(reason: impl Into<String>) -> Self {
        JobError::NeedRetry {
            reason: reason.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        JobError::Failed {
            message: message.into(),
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        JobError::Aborted {
            message: message.into(),
        }
    }

    /// Converts this error to a TaskStatus.
    pub fn to_status(&self) -> TaskStatus {
        match self {
            JobError::NeedRetry { .. } => TaskStatus::NeedRetry,
            JobError::Failed { .. } | JobError::Aborted { .. } => TaskStatus::Failed,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.to_status().is_retryable()
    }
}

/// Result type for job bodies.
pub type JobResult<T> = Result<T, JobError>;

/// Extension trait for converting a JobResult to a TaskStatus.
pub trait JobResultExt {
    fn to_status(&self) -> TaskStatus;
}

impl<T> JobResultExt for JobResult<T> {
    fn to_status(&self) -> TaskStatus {
        match self {
            Ok(_) => TaskStatus::Success,
            Err(e) => e.to_status(),
        }
    }
}
