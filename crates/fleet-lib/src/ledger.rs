//! Admission ledger
//!
//! Tracks workload placements accepted onto one simulated agent against its
//! fabricated allocatable resources. Each agent owns its own ledger; admits,
//! releases and snapshot reads are serialized by a per-ledger lock.

use crate::models::{AdmissionRecord, NodeResources, Resource, ResourceRequest};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

/// Resources consumed by live admission records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub gpu_count: u64,
    pub pods: u64,
}

impl ResourceUsage {
    pub fn get(&self, resource: Resource) -> u64 {
        match resource {
            Resource::Cpu => self.cpu_millis,
            Resource::Memory => self.memory_bytes,
            Resource::Gpu => self.gpu_count,
            Resource::Pods => self.pods,
        }
    }

    fn add(&mut self, request: &ResourceRequest) {
        self.cpu_millis += request.cpu_millis;
        self.memory_bytes += request.memory_bytes;
        self.gpu_count += request.gpu_count;
        self.pods += 1;
    }

    fn subtract(&mut self, request: &ResourceRequest) {
        self.cpu_millis = self.cpu_millis.saturating_sub(request.cpu_millis);
        self.memory_bytes = self.memory_bytes.saturating_sub(request.memory_bytes);
        self.gpu_count = self.gpu_count.saturating_sub(request.gpu_count);
        self.pods = self.pods.saturating_sub(1);
    }
}

/// Why a placement was not admitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    /// The first tracked dimension without enough headroom
    Insufficient {
        resource: Resource,
        requested: u64,
        used: u64,
        allocatable: u64,
    },
    /// The agent is not registered or is shutting down
    AgentUnavailable { state: String },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::Insufficient {
                resource,
                requested,
                used,
                allocatable,
            } => write!(
                f,
                "insufficient {}: requested {}, used {}, allocatable {}",
                resource, requested, used, allocatable
            ),
            RejectionReason::AgentUnavailable { state } => {
                write!(f, "agent is not accepting placements (state {})", state)
            }
        }
    }
}

/// Outcome of [`AdmissionLedger::try_admit`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdmissionDecision {
    Admitted { record: AdmissionRecord },
    Rejected { reason: RejectionReason },
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted { .. })
    }

    pub fn rejection(&self) -> Option<&RejectionReason> {
        match self {
            AdmissionDecision::Rejected { reason } => Some(reason),
            AdmissionDecision::Admitted { .. } => None,
        }
    }
}

/// Read-only view of ledger usage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub used: ResourceUsage,
    pub allocatable: NodeResources,
    pub live_records: usize,
    pub generation: u64,
}

impl LedgerSnapshot {
    /// used / allocatable for one dimension; 0 when nothing is allocatable
    pub fn utilization(&self, resource: Resource) -> f64 {
        let allocatable = self.allocatable.get(resource);
        if allocatable == 0 {
            return 0.0;
        }
        self.used.get(resource) as f64 / allocatable as f64
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    records: HashMap<String, AdmissionRecord>,
    used: ResourceUsage,
    generation: u64,
}

/// Per-agent admission bookkeeping
#[derive(Debug)]
pub struct AdmissionLedger {
    allocatable: NodeResources,
    state: RwLock<LedgerState>,
}

impl AdmissionLedger {
    pub fn new(allocatable: NodeResources) -> Self {
        Self {
            allocatable,
            state: RwLock::new(LedgerState::default()),
        }
    }

    pub fn allocatable(&self) -> NodeResources {
        self.allocatable
    }

    /// Admit `request` iff every tracked dimension has headroom.
    ///
    /// Re-submitting a workload that is already admitted returns the existing
    /// record without counting it twice.
    pub async fn try_admit(
        &self,
        workload_id: &str,
        request: ResourceRequest,
    ) -> AdmissionDecision {
        let mut state = self.state.write().await;

        if let Some(existing) = state.records.get(workload_id) {
            return AdmissionDecision::Admitted {
                record: existing.clone(),
            };
        }

        for resource in Resource::TRACKED {
            let requested = request.get(resource);
            let used = state.used.get(resource);
            let allocatable = self.allocatable.get(resource);
            let fits = used
                .checked_add(requested)
                .map_or(false, |total| total <= allocatable);
            if !fits {
                return AdmissionDecision::Rejected {
                    reason: RejectionReason::Insufficient {
                        resource,
                        requested,
                        used,
                        allocatable,
                    },
                };
            }
        }

        let record = AdmissionRecord {
            workload_id: workload_id.to_string(),
            requested: request,
            admitted_at: Utc::now(),
        };
        state.used.add(&request);
        state.generation += 1;
        state
            .records
            .insert(workload_id.to_string(), record.clone());

        AdmissionDecision::Admitted { record }
    }

    /// Remove a workload. Unknown IDs are ignored. Returns whether a record was removed.
    pub async fn release(&self, workload_id: &str) -> bool {
        let mut state = self.state.write().await;
        match state.records.remove(workload_id) {
            Some(record) => {
                state.used.subtract(&record.requested);
                state.generation += 1;
                true
            }
            None => false,
        }
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.read().await;
        LedgerSnapshot {
            used: state.used,
            allocatable: self.allocatable,
            live_records: state.records.len(),
            generation: state.generation,
        }
    }

    /// Live records, ordered by workload ID
    pub async fn records(&self) -> Vec<AdmissionRecord> {
        let state = self.state.read().await;
        let mut records: Vec<_> = state.records.values().cloned().collect();
        records.sort_by(|a, b| a.workload_id.cmp(&b.workload_id));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const GI: u64 = 1 << 30;

    fn allocatable(cpu_millis: u64, memory_bytes: u64, gpu_count: u64) -> NodeResources {
        NodeResources {
            cpu_millis,
            memory_bytes,
            gpu_count,
            ephemeral_storage_bytes: 0,
            pods: 110,
        }
    }

    #[tokio::test]
    async fn test_admit_then_reject_on_cpu() {
        let ledger = AdmissionLedger::new(allocatable(1000, 4 * GI, 0));

        let first = ledger
            .try_admit("w1", ResourceRequest::new(500, GI, 0))
            .await;
        assert!(first.is_admitted());

        let second = ledger
            .try_admit("w2", ResourceRequest::new(600, GI, 0))
            .await;
        assert_eq!(
            second.rejection(),
            Some(&RejectionReason::Insufficient {
                resource: Resource::Cpu,
                requested: 600,
                used: 500,
                allocatable: 1000,
            })
        );

        let snapshot = ledger.snapshot().await;
        assert_eq!(snapshot.used.cpu_millis, 500);
        assert_eq!(snapshot.used.memory_bytes, GI);
        assert_eq!(snapshot.live_records, 1);
    }

    #[tokio::test]
    async fn test_rejection_names_first_exhausted_dimension() {
        let ledger = AdmissionLedger::new(allocatable(1000, GI, 0));

        // Both memory and GPU are short; memory is checked first.
        let decision = ledger
            .try_admit("w1", ResourceRequest::new(100, 2 * GI, 1))
            .await;
        match decision.rejection() {
            Some(RejectionReason::Insufficient { resource, .. }) => {
                assert_eq!(*resource, Resource::Memory)
            }
            other => panic!("unexpected decision: {:?}", other),
        }

        let decision = ledger
            .try_admit("w2", ResourceRequest::new(100, GI / 2, 1))
            .await;
        match decision.rejection() {
            Some(RejectionReason::Insufficient { resource, .. }) => {
                assert_eq!(*resource, Resource::Gpu)
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejection_has_no_side_effect() {
        let ledger = AdmissionLedger::new(allocatable(1000, GI, 0));
        ledger
            .try_admit("w1", ResourceRequest::new(900, GI / 2, 0))
            .await;
        let before = ledger.snapshot().await;

        let decision = ledger
            .try_admit("w2", ResourceRequest::new(200, 1, 0))
            .await;
        assert!(!decision.is_admitted());
        assert_eq!(ledger.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_pod_slots_are_tracked() {
        let mut resources = allocatable(1000, GI, 0);
        resources.pods = 2;
        let ledger = AdmissionLedger::new(resources);

        assert!(ledger.try_admit("a", ResourceRequest::default()).await.is_admitted());
        assert!(ledger.try_admit("b", ResourceRequest::default()).await.is_admitted());
        let third = ledger.try_admit("c", ResourceRequest::default()).await;
        assert!(matches!(
            third.rejection(),
            Some(RejectionReason::Insufficient {
                resource: Resource::Pods,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let ledger = AdmissionLedger::new(allocatable(1000, GI, 0));
        ledger
            .try_admit("w1", ResourceRequest::new(300, GI / 4, 0))
            .await;
        ledger
            .try_admit("w2", ResourceRequest::new(300, GI / 4, 0))
            .await;

        assert!(ledger.release("w1").await);
        let once = ledger.snapshot().await;

        assert!(!ledger.release("w1").await);
        assert!(!ledger.release("never-admitted").await);
        let twice = ledger.snapshot().await;

        assert_eq!(once, twice);
        assert_eq!(twice.used.cpu_millis, 300);
        assert_eq!(twice.live_records, 1);
    }

    #[tokio::test]
    async fn test_duplicate_submit_is_not_double_counted() {
        let ledger = AdmissionLedger::new(allocatable(1000, GI, 0));
        let first = ledger
            .try_admit("w1", ResourceRequest::new(600, 0, 0))
            .await;
        let again = ledger
            .try_admit("w1", ResourceRequest::new(600, 0, 0))
            .await;

        assert_eq!(first, again);
        assert_eq!(ledger.snapshot().await.used.cpu_millis, 600);
    }

    #[tokio::test]
    async fn test_generation_tracks_effective_mutations() {
        let ledger = AdmissionLedger::new(allocatable(1000, GI, 0));
        assert_eq!(ledger.snapshot().await.generation, 0);

        ledger.try_admit("w1", ResourceRequest::new(1, 1, 0)).await;
        ledger.try_admit("w2", ResourceRequest::new(5000, 1, 0)).await;
        ledger.release("missing").await;
        assert_eq!(ledger.snapshot().await.generation, 1);

        ledger.release("w1").await;
        assert_eq!(ledger.snapshot().await.generation, 2);
    }

    #[tokio::test]
    async fn test_concurrent_admissions_never_exceed_allocatable() {
        let ledger = Arc::new(AdmissionLedger::new(allocatable(10_000, 64 * GI, 4)));
        let mut tasks = Vec::new();

        for i in 0..200u64 {
            let ledger = ledger.clone();
            tasks.push(tokio::spawn(async move {
                let request = ResourceRequest::new(100 + (i % 7) * 50, (i % 5 + 1) * GI / 2, i % 3);
                let id = format!("w{}", i);
                ledger.try_admit(&id, request).await;
                if i % 4 == 0 {
                    ledger.release(&id).await;
                }
                let snapshot = ledger.snapshot().await;
                for resource in Resource::TRACKED {
                    assert!(snapshot.used.get(resource) <= snapshot.allocatable.get(resource));
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        let snapshot = ledger.snapshot().await;
        let records = ledger.records().await;
        let cpu: u64 = records.iter().map(|r| r.requested.cpu_millis).sum();
        let gpu: u64 = records.iter().map(|r| r.requested.gpu_count).sum();
        assert_eq!(snapshot.used.cpu_millis, cpu);
        assert_eq!(snapshot.used.gpu_count, gpu);
        assert_eq!(snapshot.used.pods, records.len() as u64);
        assert!(cpu <= 10_000);
        assert!(gpu <= 4);
    }

    #[test]
    fn test_utilization_with_zero_allocatable() {
        let snapshot = LedgerSnapshot {
            used: ResourceUsage::default(),
            allocatable: allocatable(1000, GI, 0),
            live_records: 0,
            generation: 0,
        };
        assert_eq!(snapshot.utilization(Resource::Gpu), 0.0);
    }
}
