//! Configuration file support for elanmgrd
//!
//! Loads and validates the manager configuration from TOML files.
//! Default location: /etc/sonic/elanmgr.toml

use crate::error::{ElanError, Result};
use elan_orch_common::{JobConfig, DEFAULT_MAX_RETRIES, DEFAULT_MAX_WORKERS};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sonic/elanmgr.toml";

/// Job scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Maximum number of jobs executing concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Resubmissions of a failing job before it is abandoned
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Pause before a failed job is resubmitted, in milliseconds
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

/// Broadcast group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupsConfig {
    /// Pause between local group, remote group and fan-out programming
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
}

/// Packet learning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    /// Entries younger than this are never migrated by a packet-in
    #[serde(default = "default_anti_churn_window")]
    pub anti_churn_window_ms: u64,
}

/// Domain lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainsConfig {
    /// Id pool that domain tags are allocated from
    #[serde(default = "default_tag_pool_name")]
    pub tag_pool_name: String,

    /// Lowest tag handed out by the pool
    #[serde(default = "default_tag_pool_low")]
    pub tag_pool_low: u32,

    /// Highest tag handed out by the pool
    #[serde(default = "default_tag_pool_high")]
    pub tag_pool_high: u32,

    /// MAC aging timeout for domains that do not set one
    #[serde(default = "default_mac_timeout")]
    pub default_mac_timeout_secs: u64,

    /// Bound of the per-domain queue of interface events awaiting a tag
    #[serde(default = "default_max_pending_interfaces")]
    pub max_pending_interfaces: usize,
}

/// Membership configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Ports never counted for first/last member decisions
    #[serde(default)]
    pub placeholder_ports: Vec<String>,
}

/// Complete elanmgrd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElanConfig {
    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub groups: GroupsConfig,

    #[serde(default)]
    pub learning: LearningConfig,

    #[serde(default)]
    pub domains: DomainsConfig,

    #[serde(default)]
    pub membership: MembershipConfig,
}

// Default functions
fn default_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_backoff() -> u64 {
    50
}

fn default_settle_delay() -> u64 {
    300
}

fn default_anti_churn_window() -> u64 {
    1000
}

fn default_tag_pool_name() -> String {
    "elan.ids.pool".to_string()
}

fn default_tag_pool_low() -> u32 {
    5000
}

fn default_tag_pool_high() -> u32 {
    100_000
}

fn default_mac_timeout() -> u64 {
    300
}

fn default_max_pending_interfaces() -> usize {
    1024
}

// Default implementations
impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl Default for GroupsConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay(),
        }
    }
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            anti_churn_window_ms: default_anti_churn_window(),
        }
    }
}

impl Default for DomainsConfig {
    fn default() -> Self {
        Self {
            tag_pool_name: default_tag_pool_name(),
            tag_pool_low: default_tag_pool_low(),
            tag_pool_high: default_tag_pool_high(),
            default_mac_timeout_secs: default_mac_timeout(),
            max_pending_interfaces: default_max_pending_interfaces(),
        }
    }
}

impl ElanConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => {
                let config = toml::from_str(&content).map_err(|e| {
                    ElanError::Configuration(format!(
                        "Failed to parse config file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ElanError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            ElanError::Configuration(format!("Failed to serialize config: {}", e))
        })?;
        fs::write(path.as_ref(), content)?;
        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.groups.settle_delay_ms)
    }

    pub fn anti_churn_window(&self) -> Duration {
        Duration::from_millis(self.learning.anti_churn_window_ms)
    }

    /// Scheduler settings derived from the `[jobs]` section.
    pub fn job_config(&self) -> JobConfig {
        JobConfig {
            max_workers: self.jobs.workers,
            max_retries: self.jobs.max_retries,
            retry_backoff: Duration::from_millis(self.jobs.retry_backoff_ms),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.jobs.workers == 0 {
            return Err(ElanError::Configuration(
                "jobs.workers must be > 0".to_string(),
            ));
        }

        if self.domains.tag_pool_name.is_empty() {
            return Err(ElanError::Configuration(
                "domains.tag_pool_name must not be empty".to_string(),
            ));
        }

        if self.domains.tag_pool_low == 0 || self.domains.tag_pool_low > self.domains.tag_pool_high
        {
            return Err(ElanError::Configuration(format!(
                "invalid tag range {}..={}",
                self.domains.tag_pool_low, self.domains.tag_pool_high
            )));
        }

        if self.domains.max_pending_interfaces == 0 {
            return Err(ElanError::Configuration(
                "domains.max_pending_interfaces must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
