//! Fleet configuration
//!
//! Every option has a default; `validate` runs before any agent is created so
//! configuration mistakes fail fast instead of surfacing mid-launch.

use crate::profile::{PodAddressRange, ProfileError, ResourceProfile};
use crate::quantity::deserialize_bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Upper bound for every interval, timeout and delay option (30 days)
pub const MAX_INTERVAL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Fatal configuration errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("fleet_size must be at least 1")]
    EmptyFleet,

    #[error("{field} must be greater than zero")]
    ZeroInterval { field: &'static str },

    #[error("{field} must not exceed {max_seconds}s")]
    IntervalTooLong {
        field: &'static str,
        max_seconds: u64,
    },

    #[error("status_max_interval_seconds ({max}) must be >= status_min_interval_seconds ({min})")]
    StatusIntervals { min: u64, max: u64 },

    #[error("pressure_threshold must be in (0, 1], got {0}")]
    PressureThreshold(f64),

    #[error("failure_threshold must be at least 1")]
    FailureThreshold,

    #[error("name_prefix must not be empty")]
    EmptyNamePrefix,

    #[error("fleet of {fleet_size} does not fit in {base}: only {available} /{prefix_len} subnets")]
    AddressSpace {
        fleet_size: usize,
        base: String,
        prefix_len: u8,
        available: u64,
    },

    #[error(transparent)]
    Profile(#[from] ProfileError),
}

/// Fleet-wide options; every agent gets an identical resource profile
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub fleet_size: usize,
    pub name_prefix: String,

    pub cpu_millis_per_agent: u64,
    #[serde(deserialize_with = "deserialize_bytes")]
    pub memory_bytes_per_agent: u64,
    pub gpu_count_per_agent: u64,
    #[serde(deserialize_with = "deserialize_bytes")]
    pub ephemeral_storage_bytes_per_agent: u64,
    pub max_pods_per_agent: u64,

    pub lease_renew_interval_seconds: u64,
    pub status_min_interval_seconds: u64,
    pub status_max_interval_seconds: u64,

    pub pod_address_range_base: String,
    pub pod_address_prefix_length: u8,

    pub failure_threshold: u32,
    pub backoff_base_millis: u64,
    pub backoff_max_millis: u64,
    pub call_timeout_seconds: u64,
    pub pressure_threshold: f64,

    pub start_stagger_millis: u64,
    pub start_jitter_millis: u64,
    pub shutdown_timeout_seconds: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            fleet_size: 1,
            name_prefix: "hollow-node".to_string(),
            cpu_millis_per_agent: 4000,
            memory_bytes_per_agent: 16 << 30,
            gpu_count_per_agent: 0,
            ephemeral_storage_bytes_per_agent: 0,
            max_pods_per_agent: 110,
            lease_renew_interval_seconds: 10,
            status_min_interval_seconds: 10,
            status_max_interval_seconds: 300,
            pod_address_range_base: "10.64.0.0/10".to_string(),
            pod_address_prefix_length: 24,
            failure_threshold: 3,
            backoff_base_millis: 200,
            backoff_max_millis: 30_000,
            call_timeout_seconds: 10,
            pressure_threshold: 0.9,
            start_stagger_millis: 20,
            start_jitter_millis: 20,
            shutdown_timeout_seconds: 30,
        }
    }
}

/// Heartbeat loop settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    pub renew_interval: Duration,
}

/// Status sync loop settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusConfig {
    /// Tick period F
    pub min_interval: Duration,
    /// Staleness bound M
    pub max_interval: Duration,
    pub pressure_threshold: f64,
}

/// Failure handling shared by registration and both loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures on one loop before the agent is Degraded
    pub failure_threshold: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        FleetConfig::default().retry_policy()
    }
}

impl FleetConfig {
    /// Check every option and build one profile per agent so an unusable
    /// address range is caught up front.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fleet_size == 0 {
            return Err(ConfigError::EmptyFleet);
        }
        if self.name_prefix.trim().is_empty() {
            return Err(ConfigError::EmptyNamePrefix);
        }
        for (field, value) in [
            ("lease_renew_interval_seconds", self.lease_renew_interval_seconds),
            ("status_min_interval_seconds", self.status_min_interval_seconds),
            ("call_timeout_seconds", self.call_timeout_seconds),
            ("backoff_base_millis", self.backoff_base_millis),
            ("shutdown_timeout_seconds", self.shutdown_timeout_seconds),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroInterval { field });
            }
        }
        for (field, value) in [
            ("lease_renew_interval_seconds", secs(self.lease_renew_interval_seconds)),
            ("status_min_interval_seconds", secs(self.status_min_interval_seconds)),
            ("status_max_interval_seconds", secs(self.status_max_interval_seconds)),
            ("call_timeout_seconds", secs(self.call_timeout_seconds)),
            ("shutdown_timeout_seconds", secs(self.shutdown_timeout_seconds)),
            ("backoff_base_millis", millis(self.backoff_base_millis)),
            ("backoff_max_millis", millis(self.backoff_max_millis)),
            ("start_stagger_millis", millis(self.start_stagger_millis)),
            ("start_jitter_millis", millis(self.start_jitter_millis)),
        ] {
            if value > MAX_INTERVAL {
                return Err(ConfigError::IntervalTooLong {
                    field,
                    max_seconds: MAX_INTERVAL.as_secs(),
                });
            }
        }
        if self.status_max_interval_seconds < self.status_min_interval_seconds {
            return Err(ConfigError::StatusIntervals {
                min: self.status_min_interval_seconds,
                max: self.status_max_interval_seconds,
            });
        }
        if !(self.pressure_threshold > 0.0 && self.pressure_threshold <= 1.0) {
            return Err(ConfigError::PressureThreshold(self.pressure_threshold));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::FailureThreshold);
        }

        let base: PodAddressRange = self.pod_address_range_base.parse()?;
        let available = base.subnet_count(self.pod_address_prefix_length)?;
        if (self.fleet_size as u64) > available {
            return Err(ConfigError::AddressSpace {
                fleet_size: self.fleet_size,
                base: base.to_string(),
                prefix_len: self.pod_address_prefix_length,
                available,
            });
        }

        // Quantities are checked by the profile builder.
        self.profile_for(0)?;
        Ok(())
    }

    /// Stable agent name for fleet index `index`
    pub fn agent_name(&self, index: usize) -> String {
        format!("{}-{}", self.name_prefix, index)
    }

    /// Resource profile of the agent at `index`, with its own pod subnet
    pub fn profile_for(&self, index: usize) -> Result<ResourceProfile, ConfigError> {
        let base: PodAddressRange = self.pod_address_range_base.parse()?;
        let subnet = base.subnet(index as u64, self.pod_address_prefix_length)?;

        Ok(ResourceProfile::builder()
            .cpu_millis(self.cpu_millis_per_agent)
            .memory_bytes(self.memory_bytes_per_agent)
            .gpu_count(self.gpu_count_per_agent)
            .ephemeral_storage_bytes(self.ephemeral_storage_bytes_per_agent)
            .max_pods(self.max_pods_per_agent)
            .pod_address_range(subnet.to_string())
            .build()?)
    }

    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            renew_interval: Duration::from_secs(self.lease_renew_interval_seconds),
        }
    }

    pub fn status_config(&self) -> StatusConfig {
        StatusConfig {
            min_interval: Duration::from_secs(self.status_min_interval_seconds),
            max_interval: Duration::from_secs(self.status_max_interval_seconds),
            pressure_threshold: self.pressure_threshold,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            failure_threshold: self.failure_threshold,
            backoff_base: Duration::from_millis(self.backoff_base_millis),
            backoff_max: Duration::from_millis(self.backoff_max_millis),
            call_timeout: Duration::from_secs(self.call_timeout_seconds),
        }
    }

    pub fn start_stagger(&self) -> Duration {
        Duration::from_millis(self.start_stagger_millis)
    }

    pub fn start_jitter(&self) -> Duration {
        Duration::from_millis(self.start_jitter_millis)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

fn millis(value: u64) -> Duration {
    Duration::from_millis(value)
}
