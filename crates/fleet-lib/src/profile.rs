//! Fabricated resource profile of one simulated agent
//!
//! The profile is built once from configuration before any network call and
//! is read-only afterwards. Capacity and allocatable are reported identically.

use crate::models::NodeResources;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while building a resource profile
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileError {
    #[error("{0} must be greater than zero")]
    ZeroQuantity(&'static str),

    #[error("malformed pod address range '{value}': {reason}")]
    MalformedAddressRange { value: String, reason: String },

    #[error("prefix length /{requested} does not fit inside {base}")]
    InvalidPrefix { base: String, requested: u8 },

    #[error("subnet index {index} is outside {base} (only {available} /{prefix_len} subnets)")]
    SubnetOutOfRange {
        index: u64,
        base: String,
        prefix_len: u8,
        available: u64,
    },
}

/// IPv4 CIDR block assigned to an agent for its pods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodAddressRange {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl PodAddressRange {
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Number of `prefix_len` subnets that fit in this range
    pub fn subnet_count(&self, prefix_len: u8) -> Result<u64, ProfileError> {
        if prefix_len < self.prefix_len || prefix_len > 32 {
            return Err(ProfileError::InvalidPrefix {
                base: self.to_string(),
                requested: prefix_len,
            });
        }
        Ok(1u64 << (prefix_len - self.prefix_len))
    }

    /// The `index`-th subnet of length `prefix_len` inside this range
    pub fn subnet(&self, index: u64, prefix_len: u8) -> Result<PodAddressRange, ProfileError> {
        let available = self.subnet_count(prefix_len)?;
        if index >= available {
            return Err(ProfileError::SubnetOutOfRange {
                index,
                base: self.to_string(),
                prefix_len,
                available,
            });
        }

        let base = u64::from(u32::from(self.network));
        let offset = index << (32 - u32::from(prefix_len));
        // Fits in u32: index < available keeps the offset inside the base block.
        let network = Ipv4Addr::from((base + offset) as u32);

        Ok(PodAddressRange {
            network,
            prefix_len,
        })
    }
}

fn mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}

impl FromStr for PodAddressRange {
    type Err = ProfileError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| ProfileError::MalformedAddressRange {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let (addr, prefix) = value
            .trim()
            .split_once('/')
            .ok_or_else(|| malformed("expected <ipv4>/<prefix>"))?;
        let network: Ipv4Addr = addr
            .parse()
            .map_err(|_| malformed("invalid IPv4 address"))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| malformed("invalid prefix length"))?;
        if prefix_len > 32 {
            return Err(malformed("prefix length must be at most 32"));
        }
        if u32::from(network) & !mask(prefix_len) != 0 {
            return Err(malformed("host bits set beyond the prefix"));
        }

        Ok(Self {
            network,
            prefix_len,
        })
    }
}

impl fmt::Display for PodAddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// Immutable description of an agent's fabricated resources
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceProfile {
    cpu_millis: u64,
    memory_bytes: u64,
    gpu_count: u64,
    ephemeral_storage_bytes: u64,
    max_pods: u64,
    pod_address_range: PodAddressRange,
}

impl ResourceProfile {
    pub fn builder() -> ResourceProfileBuilder {
        ResourceProfileBuilder::new()
    }

    pub fn cpu_millis(&self) -> u64 {
        self.cpu_millis
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes
    }

    pub fn gpu_count(&self) -> u64 {
        self.gpu_count
    }

    pub fn ephemeral_storage_bytes(&self) -> u64 {
        self.ephemeral_storage_bytes
    }

    pub fn max_pods(&self) -> u64 {
        self.max_pods
    }

    pub fn pod_address_range(&self) -> PodAddressRange {
        self.pod_address_range
    }

    pub fn capacity(&self) -> NodeResources {
        NodeResources {
            cpu_millis: self.cpu_millis,
            memory_bytes: self.memory_bytes,
            gpu_count: self.gpu_count,
            ephemeral_storage_bytes: self.ephemeral_storage_bytes,
            pods: self.max_pods,
        }
    }

    pub fn allocatable(&self) -> NodeResources {
        self.capacity()
    }
}

/// Builder for [`ResourceProfile`]
#[derive(Debug, Clone)]
pub struct ResourceProfileBuilder {
    cpu_millis: u64,
    memory_bytes: u64,
    gpu_count: u64,
    ephemeral_storage_bytes: u64,
    max_pods: u64,
    pod_address_range: Option<String>,
}

impl ResourceProfileBuilder {
    pub fn new() -> Self {
        Self {
            cpu_millis: 0,
            memory_bytes: 0,
            gpu_count: 0,
            ephemeral_storage_bytes: 0,
            max_pods: 110,
            pod_address_range: None,
        }
    }

    pub fn cpu_millis(mut self, millis: u64) -> Self {
        self.cpu_millis = millis;
        self
    }

    pub fn memory_bytes(mut self, bytes: u64) -> Self {
        self.memory_bytes = bytes;
        self
    }

    pub fn gpu_count(mut self, count: u64) -> Self {
        self.gpu_count = count;
        self
    }

    pub fn ephemeral_storage_bytes(mut self, bytes: u64) -> Self {
        self.ephemeral_storage_bytes = bytes;
        self
    }

    pub fn max_pods(mut self, pods: u64) -> Self {
        self.max_pods = pods;
        self
    }

    pub fn pod_address_range(mut self, cidr: impl Into<String>) -> Self {
        self.pod_address_range = Some(cidr.into());
        self
    }

    pub fn build(self) -> Result<ResourceProfile, ProfileError> {
        if self.cpu_millis == 0 {
            return Err(ProfileError::ZeroQuantity("cpu"));
        }
        if self.memory_bytes == 0 {
            return Err(ProfileError::ZeroQuantity("memory"));
        }
        if self.max_pods == 0 {
            return Err(ProfileError::ZeroQuantity("pods"));
        }

        let cidr = self
            .pod_address_range
            .ok_or_else(|| ProfileError::MalformedAddressRange {
                value: String::new(),
                reason: "pod address range is required".to_string(),
            })?;

        Ok(ResourceProfile {
            cpu_millis: self.cpu_millis,
            memory_bytes: self.memory_bytes,
            gpu_count: self.gpu_count,
            ephemeral_storage_bytes: self.ephemeral_storage_bytes,
            max_pods: self.max_pods,
            pod_address_range: cidr.parse()?,
        })
    }
}

impl Default for ResourceProfileBuilder {
    fn default() -> Self {
        Self::new()
    }
}
