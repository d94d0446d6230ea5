//! Core data models shared by the simulated agents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Resource dimensions tracked by admission, in check order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Cpu,
    Memory,
    Gpu,
    Pods,
}

impl Resource {
    pub const TRACKED: [Resource; 4] = [
        Resource::Cpu,
        Resource::Memory,
        Resource::Gpu,
        Resource::Pods,
    ];

    /// Conventional resource-list name
    pub fn name(&self) -> &'static str {
        match self {
            Resource::Cpu => "cpu",
            Resource::Memory => "memory",
            Resource::Gpu => "nvidia.com/gpu",
            Resource::Pods => "pods",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Capacity or allocatable quantities advertised by an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResources {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub gpu_count: u64,
    pub ephemeral_storage_bytes: u64,
    pub pods: u64,
}

impl NodeResources {
    /// Quantity for one of the admission-tracked dimensions
    pub fn get(&self, resource: Resource) -> u64 {
        match resource {
            Resource::Cpu => self.cpu_millis,
            Resource::Memory => self.memory_bytes,
            Resource::Gpu => self.gpu_count,
            Resource::Pods => self.pods,
        }
    }

    /// Resource list keyed by conventional names. The GPU entry is always present.
    pub fn to_resource_list(&self) -> BTreeMap<String, u64> {
        let mut list = BTreeMap::new();
        list.insert("cpu".to_string(), self.cpu_millis);
        list.insert("memory".to_string(), self.memory_bytes);
        list.insert("ephemeral-storage".to_string(), self.ephemeral_storage_bytes);
        list.insert(Resource::Gpu.name().to_string(), self.gpu_count);
        list.insert("pods".to_string(), self.pods);
        list
    }
}

/// Resources requested by one workload placement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(default)]
    pub cpu_millis: u64,
    #[serde(default)]
    pub memory_bytes: u64,
    #[serde(default)]
    pub gpu_count: u64,
}

impl ResourceRequest {
    pub fn new(cpu_millis: u64, memory_bytes: u64, gpu_count: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
            gpu_count,
        }
    }

    /// Amount consumed in a tracked dimension. Every workload takes one pod slot.
    pub fn get(&self, resource: Resource) -> u64 {
        match resource {
            Resource::Cpu => self.cpu_millis,
            Resource::Memory => self.memory_bytes,
            Resource::Gpu => self.gpu_count,
            Resource::Pods => 1,
        }
    }
}

/// Identity under which an agent is registered with the control plane.
///
/// The name is stable for the agent's lifetime; uid and generation change
/// whenever the agent re-registers after its identity was superseded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub name: String,
    pub uid: String,
    pub generation: u64,
}

impl AgentIdentity {
    pub fn fresh(name: impl Into<String>, generation: u64) -> Self {
        Self {
            name: name.into(),
            uid: uuid::Uuid::new_v4().to_string(),
            generation,
        }
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.generation)
    }
}

/// Local view of the agent's liveness lease
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub holder_id: String,
    pub renew_interval: Duration,
    pub last_renewal_time: Option<DateTime<Utc>>,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    Ready,
    MemoryPressure,
    DiskPressure,
    PIDPressure,
    NetworkUnavailable,
}

impl ConditionType {
    pub const ALL: [ConditionType; 5] = [
        ConditionType::Ready,
        ConditionType::MemoryPressure,
        ConditionType::DiskPressure,
        ConditionType::PIDPressure,
        ConditionType::NetworkUnavailable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Ready => "Ready",
            ConditionType::MemoryPressure => "MemoryPressure",
            ConditionType::DiskPressure => "DiskPressure",
            ConditionType::PIDPressure => "PIDPressure",
            ConditionType::NetworkUnavailable => "NetworkUnavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCondition {
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Full reported state of an agent, rebuilt wholesale on every status tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub conditions: Vec<NodeCondition>,
    pub capacity: NodeResources,
    pub allocatable: NodeResources,
    pub observed_generation: u64,
    pub pod_cidr: String,
    pub generated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn condition(&self, condition_type: ConditionType) -> Option<&NodeCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// True if any condition status differs from `previous`
    pub fn conditions_differ(&self, previous: &[NodeCondition]) -> bool {
        if self.conditions.len() != previous.len() {
            return true;
        }
        self.conditions.iter().any(|current| {
            previous
                .iter()
                .find(|p| p.condition_type == current.condition_type)
                .map_or(true, |p| p.status != current.status)
        })
    }
}

/// One accepted workload placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRecord {
    pub workload_id: String,
    pub requested: ResourceRequest,
    pub admitted_at: DateTime<Utc>,
}

/// Agent lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Unregistered,
    Registering,
    Active,
    Degraded,
    Terminating,
    Stopped,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Unregistered => "unregistered",
            AgentState::Registering => "registering",
            AgentState::Active => "active",
            AgentState::Degraded => "degraded",
            AgentState::Terminating => "terminating",
            AgentState::Stopped => "stopped",
        }
    }

    /// Whether the agent is registered and running its loops
    pub fn is_running(&self) -> bool {
        matches!(self, AgentState::Active | AgentState::Degraded)
    }

    pub fn can_transition_to(&self, next: AgentState) -> bool {
        use AgentState::*;
        match (self, next) {
            (Stopped, _) => false,
            (Terminating, Stopped) => true,
            (Terminating, _) => false,
            (_, Terminating) => true,
            (Unregistered, Registering) => true,
            (Registering, Active) | (Registering, Degraded) => true,
            (Active, Degraded) | (Degraded, Active) => true,
            (Active, Registering) | (Degraded, Registering) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
