//! In-process control plane
//!
//! Keeps registered agents in memory and enforces the same identity and
//! lease-version rules as a real control plane. Faults can be injected per
//! operation, which makes it the substitute used by tests and by dry runs.

use super::{async_trait, ControlPlane, ControlPlaneError, Operation, RegistrationAck};
use crate::models::{AgentIdentity, NodeResources, StatusSnapshot};
use crate::profile::ResourceProfile;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

/// Stored state of one registered agent
#[derive(Debug, Clone)]
pub struct NodeView {
    pub uid: String,
    pub generation: u64,
    pub lease_version: u64,
    pub last_renewal: Option<DateTime<Utc>>,
    pub last_status: Option<StatusSnapshot>,
    pub publish_count: u64,
    pub capacity: NodeResources,
    pub pod_cidr: String,
}

/// One call received by the control plane
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub operation: Operation,
    pub agent: String,
    pub uid: String,
    pub at: Instant,
    pub error: Option<ControlPlaneError>,
}

impl CallRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Calls kept by [`MemoryControlPlane::new`]; older calls are dropped first
pub const DEFAULT_CALL_LOG_CAPACITY: usize = 10_000;

/// In-memory [`ControlPlane`] implementation
#[derive(Debug)]
pub struct MemoryControlPlane {
    nodes: DashMap<String, NodeView>,
    faults: Mutex<HashMap<Operation, VecDeque<ControlPlaneError>>>,
    latency: RwLock<Duration>,
    calls: Mutex<VecDeque<CallRecord>>,
    call_log_capacity: usize,
}

impl Default for MemoryControlPlane {
    fn default() -> Self {
        Self::with_call_log_capacity(DEFAULT_CALL_LOG_CAPACITY)
    }
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` calls in the log. Zero disables the log.
    pub fn with_call_log_capacity(capacity: usize) -> Self {
        Self {
            nodes: DashMap::new(),
            faults: Mutex::new(HashMap::new()),
            latency: RwLock::new(Duration::ZERO),
            calls: Mutex::new(VecDeque::new()),
            call_log_capacity: capacity,
        }
    }

    /// Delay every call by `latency`
    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.write().await = latency;
    }

    /// Fail the next `count` calls of `operation` with `error`
    pub async fn fail_next(&self, operation: Operation, count: usize, error: ControlPlaneError) {
        let mut faults = self.faults.lock().await;
        let queue = faults.entry(operation).or_default();
        for _ in 0..count {
            queue.push_back(error.clone());
        }
    }

    /// Simulate another holder taking over the agent's lease.
    /// Returns false if the agent is not registered.
    pub fn supersede(&self, name: &str) -> bool {
        match self.nodes.get_mut(name) {
            Some(mut node) => {
                node.lease_version += 1;
                true
            }
            None => false,
        }
    }

    /// Drop an agent as if an operator deleted it
    pub fn remove_node(&self, name: &str) -> bool {
        self.nodes.remove(name).is_some()
    }

    pub fn node(&self, name: &str) -> Option<NodeView> {
        self.nodes.get(name).map(|node| node.clone())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub async fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().await.iter().cloned().collect()
    }

    /// Calls of one operation from one agent, in arrival order
    pub async fn calls_for(&self, operation: Operation, agent: &str) -> Vec<CallRecord> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.operation == operation && c.agent == agent)
            .cloned()
            .collect()
    }

    /// Arrival times of successful calls of one operation from one agent
    pub async fn successes(&self, operation: Operation, agent: &str) -> Vec<Instant> {
        self.calls_for(operation, agent)
            .await
            .into_iter()
            .filter(CallRecord::succeeded)
            .map(|c| c.at)
            .collect()
    }

    /// Apply configured latency, then pop an injected fault if any
    async fn begin(&self, operation: Operation) -> Option<ControlPlaneError> {
        let latency = *self.latency.read().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut faults = self.faults.lock().await;
        faults.get_mut(&operation).and_then(VecDeque::pop_front)
    }

    async fn record<T>(
        &self,
        operation: Operation,
        identity: &AgentIdentity,
        result: Result<T, ControlPlaneError>,
    ) -> Result<T, ControlPlaneError> {
        if let Err(e) = &result {
            debug!(
                agent = %identity.name,
                operation = operation.as_str(),
                error = %e,
                "Control plane call rejected"
            );
        }
        if self.call_log_capacity > 0 {
            let mut calls = self.calls.lock().await;
            if calls.len() >= self.call_log_capacity {
                calls.pop_front();
            }
            calls.push_back(CallRecord {
                operation,
                agent: identity.name.clone(),
                uid: identity.uid.clone(),
                at: Instant::now(),
                error: result.as_ref().err().cloned(),
            });
        }
        result
    }

    fn check_holder(&self, identity: &AgentIdentity) -> Result<(), ControlPlaneError> {
        let node = self
            .nodes
            .get(&identity.name)
            .ok_or_else(|| ControlPlaneError::NotFound(identity.name.clone()))?;
        if node.uid != identity.uid {
            return Err(ControlPlaneError::Conflict(format!(
                "{} is registered under another identity",
                identity.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn register_agent(
        &self,
        identity: &AgentIdentity,
        profile: &ResourceProfile,
    ) -> Result<RegistrationAck, ControlPlaneError> {
        let result = match self.begin(Operation::Register).await {
            Some(fault) => Err(fault),
            None => {
                let mut entry = self.nodes.entry(identity.name.clone()).or_insert_with(|| {
                    NodeView {
                        uid: identity.uid.clone(),
                        generation: identity.generation,
                        lease_version: 0,
                        last_renewal: None,
                        last_status: None,
                        publish_count: 0,
                        capacity: profile.capacity(),
                        pod_cidr: profile.pod_address_range().to_string(),
                    }
                });
                // A new identity takes the node over; the lease version keeps increasing.
                entry.uid = identity.uid.clone();
                entry.generation = identity.generation;
                entry.lease_version += 1;
                entry.last_renewal = Some(Utc::now());
                entry.capacity = profile.capacity();
                entry.pod_cidr = profile.pod_address_range().to_string();
                Ok(RegistrationAck {
                    lease_version: entry.lease_version,
                })
            }
        };
        self.record(Operation::Register, identity, result).await
    }

    async fn renew_lease(
        &self,
        identity: &AgentIdentity,
        last_known_version: u64,
    ) -> Result<u64, ControlPlaneError> {
        let result = match self.begin(Operation::RenewLease).await {
            Some(fault) => Err(fault),
            None => self.check_holder(identity).and_then(|_| {
                let mut node = self
                    .nodes
                    .get_mut(&identity.name)
                    .ok_or_else(|| ControlPlaneError::NotFound(identity.name.clone()))?;
                if node.lease_version != last_known_version {
                    return Err(ControlPlaneError::Conflict(format!(
                        "lease version {} does not match {}",
                        last_known_version, node.lease_version
                    )));
                }
                node.lease_version += 1;
                node.last_renewal = Some(Utc::now());
                Ok(node.lease_version)
            }),
        };
        self.record(Operation::RenewLease, identity, result).await
    }

    async fn publish_status(
        &self,
        identity: &AgentIdentity,
        snapshot: &StatusSnapshot,
    ) -> Result<(), ControlPlaneError> {
        let result = match self.begin(Operation::PublishStatus).await {
            Some(fault) => Err(fault),
            None => self.check_holder(identity).and_then(|_| {
                let mut node = self
                    .nodes
                    .get_mut(&identity.name)
                    .ok_or_else(|| ControlPlaneError::NotFound(identity.name.clone()))?;
                node.last_status = Some(snapshot.clone());
                node.publish_count += 1;
                Ok(())
            }),
        };
        self.record(Operation::PublishStatus, identity, result).await
    }

    async fn deregister(&self, identity: &AgentIdentity) -> Result<(), ControlPlaneError> {
        let result = match self.begin(Operation::Deregister).await {
            Some(fault) => Err(fault),
            None => self.check_holder(identity).map(|_| {
                self.nodes.remove(&identity.name);
            }),
        };
        self.record(Operation::Deregister, identity, result).await
    }
}
