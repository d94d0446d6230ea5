//! Hollow fleet library
//!
//! This crate provides the core functionality for simulating a fleet of
//! cluster nodes against a single control plane:
//! - Fabricated resource profiles and per-agent admission bookkeeping
//! - Lease heartbeats and change-driven status publishing
//! - Agent lifecycle with re-registration and graceful shutdown
//! - Fleet fan-out with staggered starts
//! - Control-plane clients (gRPC and in-memory)
//! - Health checks and observability

pub mod backoff;
pub mod config;
pub mod control_plane;
pub mod controller;
pub mod health;
pub mod heartbeat;
pub mod ledger;
pub mod models;
pub mod observability;
pub mod profile;
pub mod proto;
pub mod quantity;
pub mod state;
pub mod status;
pub mod supervisor;

pub use config::{ConfigError, FleetConfig, LeaseConfig, RetryPolicy, StatusConfig};
pub use control_plane::{ControlPlane, ControlPlaneError, MemoryControlPlane};
pub use controller::{AgentController, AgentHandle, AgentRuntime, AgentSummary, StopOutcome};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use ledger::{AdmissionDecision, AdmissionLedger, RejectionReason};
pub use models::*;
pub use observability::{FleetMetrics, StructuredLogger};
pub use profile::{ProfileError, ResourceProfile};
pub use supervisor::{FleetError, FleetSupervisor, ShutdownReport};
