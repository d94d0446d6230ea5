//! Observability infrastructure for the fleet
//!
//! Provides:
//! - Prometheus metrics (agent states, lease renewals, status publishes,
//!   registrations, placements, control-plane latency)
//! - Structured JSON logging with tracing

use crate::control_plane::Operation;
use crate::ledger::AdmissionDecision;
use crate::models::{AgentIdentity, AgentState};
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge_vec, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for control-plane call latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<FleetMetricsInner> = OnceLock::new();

struct FleetMetricsInner {
    agents: IntGaugeVec,
    lease_renewals: IntCounterVec,
    status_publishes: IntCounterVec,
    registrations: IntCounterVec,
    reregistrations: IntCounter,
    placements: IntCounterVec,
    control_plane_latency_seconds: HistogramVec,
}

impl FleetMetricsInner {
    fn new() -> Self {
        Self {
            agents: register_int_gauge_vec!(
                "hollow_fleet_agents",
                "Number of simulated agents in each lifecycle state",
                &["state"]
            )
            .expect("Failed to register agents"),

            lease_renewals: register_int_counter_vec!(
                "hollow_fleet_lease_renewals_total",
                "Lease renewal attempts by result",
                &["result"]
            )
            .expect("Failed to register lease_renewals"),

            status_publishes: register_int_counter_vec!(
                "hollow_fleet_status_publishes_total",
                "Status sync ticks by outcome (published, skipped, failed)",
                &["outcome"]
            )
            .expect("Failed to register status_publishes"),

            registrations: register_int_counter_vec!(
                "hollow_fleet_registrations_total",
                "Registration attempts by result",
                &["result"]
            )
            .expect("Failed to register registrations"),

            reregistrations: register_int_counter!(
                "hollow_fleet_reregistrations_total",
                "Times an agent re-registered after its identity was superseded"
            )
            .expect("Failed to register reregistrations"),

            placements: register_int_counter_vec!(
                "hollow_fleet_placements_total",
                "Workload placement requests by decision",
                &["decision"]
            )
            .expect("Failed to register placements"),

            control_plane_latency_seconds: register_histogram_vec!(
                "hollow_fleet_control_plane_latency_seconds",
                "Latency of control-plane calls",
                &["operation"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register control_plane_latency_seconds"),
        }
    }
}

/// Fleet metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct FleetMetrics {
    _private: (),
}

impl Default for FleetMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FleetMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetMetrics").finish()
    }
}

impl FleetMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(FleetMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &FleetMetricsInner {
        GLOBAL_METRICS.get_or_init(FleetMetricsInner::new)
    }

    /// Move one agent between lifecycle-state gauges
    pub fn record_transition(&self, from: Option<AgentState>, to: AgentState) {
        if let Some(from) = from {
            self.inner().agents.with_label_values(&[from.as_str()]).dec();
        }
        self.inner().agents.with_label_values(&[to.as_str()]).inc();
    }

    pub fn inc_lease_renewal(&self, result: &str) {
        self.inner()
            .lease_renewals
            .with_label_values(&[result])
            .inc();
    }

    pub fn inc_status_publish(&self, outcome: &str) {
        self.inner()
            .status_publishes
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn inc_registration(&self, result: &str) {
        self.inner()
            .registrations
            .with_label_values(&[result])
            .inc();
    }

    pub fn inc_reregistrations(&self) {
        self.inner().reregistrations.inc();
    }

    pub fn inc_placement(&self, decision: &str) {
        self.inner().placements.with_label_values(&[decision]).inc();
    }

    pub fn observe_call_latency(&self, operation: Operation, duration_secs: f64) {
        self.inner()
            .control_plane_latency_seconds
            .with_label_values(&[operation.as_str()])
            .observe(duration_secs);
    }
}

/// Structured logger for fleet events
///
/// Provides consistent JSON-formatted logging for registrations,
/// lifecycle transitions, placements and shutdown.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    fleet: String,
}

impl StructuredLogger {
    pub fn new(fleet: impl Into<String>) -> Self {
        Self {
            fleet: fleet.into(),
        }
    }

    /// Log fleet startup
    pub fn log_fleet_started(&self, version: &str, fleet_size: usize) {
        info!(
            event = "fleet_started",
            fleet = %self.fleet,
            version = %version,
            fleet_size = fleet_size,
            "Hollow fleet started"
        );
    }

    /// Log a successful registration
    pub fn log_registered(&self, identity: &AgentIdentity, pod_cidr: &str, lease_version: u64) {
        info!(
            event = "agent_registered",
            fleet = %self.fleet,
            agent = %identity.name,
            uid = %identity.uid,
            generation = identity.generation,
            pod_cidr = %pod_cidr,
            lease_version = lease_version,
            "Agent registered with control plane"
        );
    }

    /// Log a lifecycle state change
    pub fn log_state_change(&self, agent: &str, from: AgentState, to: AgentState, failures: u32) {
        match to {
            AgentState::Degraded => {
                warn!(
                    event = "agent_state_changed",
                    fleet = %self.fleet,
                    agent = %agent,
                    from = %from,
                    to = %to,
                    consecutive_failures = failures,
                    "Agent degraded"
                );
            }
            _ => {
                info!(
                    event = "agent_state_changed",
                    fleet = %self.fleet,
                    agent = %agent,
                    from = %from,
                    to = %to,
                    consecutive_failures = failures,
                    "Agent state changed"
                );
            }
        }
    }

    /// Log loss of an identity that forces re-registration
    pub fn log_superseded(&self, identity: &AgentIdentity, reason: &str) {
        warn!(
            event = "lease_superseded",
            fleet = %self.fleet,
            agent = %identity.name,
            uid = %identity.uid,
            generation = identity.generation,
            reason = %reason,
            "Agent identity superseded, re-registering"
        );
    }

    /// Log a placement decision
    pub fn log_placement(&self, agent: &str, workload_id: &str, decision: &AdmissionDecision) {
        match decision {
            AdmissionDecision::Admitted { record } => {
                info!(
                    event = "placement_admitted",
                    fleet = %self.fleet,
                    agent = %agent,
                    workload_id = %workload_id,
                    cpu_millis = record.requested.cpu_millis,
                    memory_bytes = record.requested.memory_bytes,
                    gpu_count = record.requested.gpu_count,
                    "Placement admitted"
                );
            }
            AdmissionDecision::Rejected { reason } => {
                info!(
                    event = "placement_rejected",
                    fleet = %self.fleet,
                    agent = %agent,
                    workload_id = %workload_id,
                    reason = %reason,
                    "Placement rejected"
                );
            }
        }
    }

    /// Log the outcome of fleet shutdown
    pub fn log_shutdown_report(&self, stopped: usize, failed: &[String]) {
        if failed.is_empty() {
            info!(
                event = "fleet_shutdown",
                fleet = %self.fleet,
                stopped = stopped,
                "All agents stopped cleanly"
            );
        } else {
            warn!(
                event = "fleet_shutdown",
                fleet = %self.fleet,
                stopped = stopped,
                failed = ?failed,
                "Some agents did not stop before the deadline"
            );
        }
    }

    /// Log shutdown signal
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "fleet_shutdown_requested",
            fleet = %self.fleet,
            reason = %reason,
            "Hollow fleet shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fleet_metrics_creation() {
        let metrics = FleetMetrics::new();

        metrics.record_transition(None, AgentState::Unregistered);
        metrics.record_transition(Some(AgentState::Unregistered), AgentState::Registering);
        metrics.inc_lease_renewal("success");
        metrics.inc_status_publish("skipped");
        metrics.inc_registration("success");
        metrics.inc_reregistrations();
        metrics.inc_placement("admitted");
        metrics.observe_call_latency(Operation::RenewLease, 0.002);

        // A second handle shares the same registered collectors.
        let again = FleetMetrics::new();
        again.inc_lease_renewal("failure");
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-fleet");
        assert_eq!(logger.fleet, "test-fleet");
    }
}
