//! Control-plane contract consumed by the simulated agents
//!
//! Every agent holds an injected `Arc<dyn ControlPlane>`. Two implementations
//! are provided:
//! - [`GrpcControlPlane`]: tonic client sharing one channel across the fleet
//! - [`MemoryControlPlane`]: in-process control plane with fault injection

mod grpc;
mod memory;

pub use grpc::{ClientConfig, GrpcControlPlane};
pub use memory::{CallRecord, MemoryControlPlane, NodeView};

use crate::models::{AgentIdentity, StatusSnapshot};
use crate::profile::ResourceProfile;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub use async_trait::async_trait;

/// Errors returned by control-plane calls
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlPlaneError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("control plane unavailable: {0}")]
    Unavailable(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

impl ControlPlaneError {
    /// The control plane no longer recognizes the caller's identity
    pub fn is_identity_lost(&self) -> bool {
        matches!(
            self,
            ControlPlaneError::Conflict(_) | ControlPlaneError::NotFound(_)
        )
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            ControlPlaneError::Conflict(_) => "conflict",
            ControlPlaneError::NotFound(_) => "not_found",
            ControlPlaneError::Invalid(_) => "invalid",
            ControlPlaneError::Unavailable(_) => "unavailable",
            ControlPlaneError::Throttled(_) => "throttled",
            ControlPlaneError::Timeout(_) => "timeout",
        }
    }
}

/// Control-plane operations, used as metric and fault-injection labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Register,
    RenewLease,
    PublishStatus,
    Deregister,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Register => "register",
            Operation::RenewLease => "renew_lease",
            Operation::PublishStatus => "publish_status",
            Operation::Deregister => "deregister",
        }
    }
}

/// Acknowledgement of a successful registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationAck {
    /// Initial lease version for the new identity
    pub lease_version: u64,
}

/// Trait for control-plane client implementations
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Register an agent identity with its fabricated resources
    async fn register_agent(
        &self,
        identity: &AgentIdentity,
        profile: &ResourceProfile,
    ) -> Result<RegistrationAck, ControlPlaneError>;

    /// Renew the liveness lease; returns the new lease version
    async fn renew_lease(
        &self,
        identity: &AgentIdentity,
        last_known_version: u64,
    ) -> Result<u64, ControlPlaneError>;

    /// Publish a full status snapshot
    async fn publish_status(
        &self,
        identity: &AgentIdentity,
        snapshot: &StatusSnapshot,
    ) -> Result<(), ControlPlaneError>;

    /// Best-effort removal of the agent
    async fn deregister(&self, identity: &AgentIdentity) -> Result<(), ControlPlaneError>;
}

/// Run a control-plane call under `timeout`; expiry maps to [`ControlPlaneError::Timeout`]
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, ControlPlaneError>
where
    F: Future<Output = Result<T, ControlPlaneError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ControlPlaneError::Timeout(timeout)),
    }
}
