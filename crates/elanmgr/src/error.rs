//! Error types for the ELAN manager.

use elan_orch_common::JobError;
use thiserror::Error;

/// Failure reported by an [`ElanStore`](crate::interfaces::ElanStore).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Commit conflict: {0}")]
    Conflict(String),
}

/// Failure reported by a [`SwitchProgrammer`](crate::interfaces::SwitchProgrammer).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SwitchError {
    #[error("Switch {dpn} not connected")]
    NotConnected { dpn: String },
    #[error("Switch {dpn} rejected {object}: {reason}")]
    Rejected {
        dpn: String,
        object: String,
        reason: String,
    },
}

/// Failure reported by a [`TagAllocator`](crate::interfaces::TagAllocator).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("Id pool {0} exhausted")]
    Exhausted(String),
    #[error("Id pool {0} unavailable: {1}")]
    Unavailable(String, String),
}

#[derive(Debug, Error)]
pub enum ElanError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Switch programming error: {0}")]
    Switch(#[from] SwitchError),

    #[error("Tag allocation error: {0}")]
    TagAllocation(#[from] AllocError),

    #[error("Invalid domain configuration: {0}")]
    InvalidDomain(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Event parse error: {0}")]
    EventParse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ElanError {
    /// Returns true for transient infrastructure failures that the job
    /// layer should resubmit.
    pub fn is_retryable(&self) -> bool {
        match self {
            ElanError::Store(_) | ElanError::Switch(_) => true,
            ElanError::TagAllocation(AllocError::Unavailable(..)) => true,
            _ => false,
        }
    }
}

impl From<ElanError> for JobError {
    fn from(err: ElanError) -> Self {
        if err.is_retryable() {
            JobError::need_retry(err.to_string())
        } else {
            JobError::failed(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ElanError>;
