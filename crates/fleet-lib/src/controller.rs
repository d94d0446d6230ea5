//! Agent lifecycle controller
//!
//! Owns one agent's resource profile, admission ledger and both loops, and
//! drives its lifecycle:
//!
//! ```text
//! Unregistered -> Registering -> Active <-> Degraded
//!                      ^            |          |
//!                      +--- superseded (fresh identity)
//! any -> Terminating -> Stopped
//! ```
//!
//! `start` spawns the agent task and returns immediately. Registration is
//! retried with backoff until it succeeds or the agent is stopped.

use crate::backoff::Backoff;
use crate::config::{LeaseConfig, RetryPolicy, StatusConfig};
use crate::control_plane::{with_timeout, ControlPlane, ControlPlaneError, Operation, RegistrationAck};
use crate::health::HealthRegistry;
use crate::heartbeat::{HeartbeatLoop, LoopExit};
use crate::ledger::{AdmissionDecision, AdmissionLedger, RejectionReason, ResourceUsage};
use crate::models::{AdmissionRecord, AgentIdentity, AgentState, Lease, ResourceRequest};
use crate::observability::{FleetMetrics, StructuredLogger};
use crate::profile::ResourceProfile;
use crate::state::{AgentTracker, LoopKind};
use crate::status::StatusSyncLoop;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Collaborators shared by every agent of a fleet
#[derive(Clone)]
pub struct AgentRuntime {
    pub control_plane: Arc<dyn ControlPlane>,
    pub health: HealthRegistry,
    pub metrics: FleetMetrics,
    pub logger: StructuredLogger,
    pub retry: RetryPolicy,
    pub shutdown_timeout: Duration,
}

/// Point-in-time view of one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub name: String,
    pub state: AgentState,
    pub uid: Option<String>,
    pub generation: Option<u64>,
    pub lease_version: Option<u64>,
    pub last_lease_renewal: Option<DateTime<Utc>>,
    pub last_status_publish: Option<DateTime<Utc>>,
    pub heartbeat_failures: u32,
    pub status_failures: u32,
    pub pod_cidr: String,
    pub allocatable: BTreeMap<String, u64>,
    pub used: ResourceUsage,
    pub live_placements: usize,
    pub observed_generation: u64,
}

/// Result of stopping one agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOutcome {
    pub name: String,
    /// The agent reached `Stopped` before the shutdown timeout
    pub clean: bool,
    pub final_state: AgentState,
}

pub struct AgentController;

impl AgentController {
    /// Spawn the agent task. Must be called from within a tokio runtime.
    pub fn start(
        name: impl Into<String>,
        profile: ResourceProfile,
        lease: LeaseConfig,
        status: StatusConfig,
        runtime: AgentRuntime,
    ) -> AgentHandle {
        let name = name.into();
        let tracker = Arc::new(AgentTracker::new(
            name.clone(),
            runtime.retry.failure_threshold,
            runtime.health.clone(),
            runtime.metrics.clone(),
            runtime.logger.clone(),
        ));
        let ledger = Arc::new(AdmissionLedger::new(profile.allocatable()));
        let cancel = CancellationToken::new();

        let agent = AgentTask {
            name: name.clone(),
            profile: profile.clone(),
            lease,
            status,
            runtime: runtime.clone(),
            tracker: tracker.clone(),
            ledger: ledger.clone(),
        };
        let task = tokio::spawn(agent.run(cancel.clone()));

        AgentHandle {
            name,
            profile,
            tracker,
            ledger,
            cancel,
            task: Mutex::new(Some(task)),
            shutdown_timeout: runtime.shutdown_timeout,
            metrics: runtime.metrics,
            logger: runtime.logger,
        }
    }
}

/// Handle to a running agent
pub struct AgentHandle {
    name: String,
    profile: ResourceProfile,
    tracker: Arc<AgentTracker>,
    ledger: Arc<AdmissionLedger>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
    metrics: FleetMetrics,
    logger: StructuredLogger,
}

impl AgentHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> AgentState {
        self.tracker.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.tracker.subscribe()
    }

    pub fn profile(&self) -> &ResourceProfile {
        &self.profile
    }

    /// Current consecutive failures of one loop
    pub fn failures(&self, kind: LoopKind) -> u32 {
        self.tracker.failures(kind)
    }

    /// Admit a workload onto this agent. Only a registered agent accepts placements.
    pub async fn submit_placement(
        &self,
        workload_id: &str,
        request: ResourceRequest,
    ) -> AdmissionDecision {
        let state = self.state();
        let decision = if state.is_running() {
            self.ledger.try_admit(workload_id, request).await
        } else {
            AdmissionDecision::Rejected {
                reason: RejectionReason::AgentUnavailable {
                    state: state.to_string(),
                },
            }
        };

        self.metrics.inc_placement(if decision.is_admitted() {
            "admitted"
        } else {
            "rejected"
        });
        self.logger.log_placement(&self.name, workload_id, &decision);
        decision
    }

    /// Idempotent; returns whether a live placement was removed
    pub async fn release_placement(&self, workload_id: &str) -> bool {
        let removed = self.ledger.release(workload_id).await;
        if removed {
            self.metrics.inc_placement("released");
        }
        removed
    }

    pub async fn placements(&self) -> Vec<AdmissionRecord> {
        self.ledger.records().await
    }

    pub async fn summary(&self) -> AgentSummary {
        let details = self.tracker.details().await;
        let usage = self.ledger.snapshot().await;

        AgentSummary {
            name: self.name.clone(),
            state: self.state(),
            uid: details.identity.as_ref().map(|i| i.uid.clone()),
            generation: details.identity.as_ref().map(|i| i.generation),
            lease_version: details.lease.as_ref().map(|l| l.version),
            last_lease_renewal: details.lease.as_ref().and_then(|l| l.last_renewal_time),
            last_status_publish: details.last_status_publish,
            heartbeat_failures: self.tracker.failures(LoopKind::Heartbeat),
            status_failures: self.tracker.failures(LoopKind::StatusSync),
            pod_cidr: self.profile.pod_address_range().to_string(),
            allocatable: usage.allocatable.to_resource_list(),
            used: usage.used,
            live_placements: usage.live_records,
            observed_generation: usage.generation,
        }
    }

    /// Cancel the agent and wait for both loops and the final deregistration,
    /// bounded by the shutdown timeout. A task still running at the deadline
    /// is aborted.
    pub async fn stop(&self) -> StopOutcome {
        self.tracker.transition(AgentState::Terminating).await;
        self.cancel.cancel();

        let task = self.task.lock().await.take();
        let clean = match task {
            Some(mut task) => {
                match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        error!(agent = %self.name, error = %e, "Agent task failed");
                        false
                    }
                    Err(_) => {
                        warn!(
                            agent = %self.name,
                            timeout_secs = self.shutdown_timeout.as_secs(),
                            "Agent did not stop in time, aborting"
                        );
                        task.abort();
                        false
                    }
                }
            }
            // Already stopped by an earlier call
            None => self.state() == AgentState::Stopped,
        };

        StopOutcome {
            name: self.name.clone(),
            clean,
            final_state: self.state(),
        }
    }
}

/// State owned by the spawned agent task
struct AgentTask {
    name: String,
    profile: ResourceProfile,
    lease: LeaseConfig,
    status: StatusConfig,
    runtime: AgentRuntime,
    tracker: Arc<AgentTracker>,
    ledger: Arc<AdmissionLedger>,
}

impl AgentTask {
    async fn run(self, cancel: CancellationToken) {
        self.tracker.announce().await;

        let retry = self.runtime.retry;
        let mut reregister_backoff = Backoff::new(retry.backoff_base, retry.backoff_max);
        let mut reregister_delay: Option<Duration> = None;
        let mut generation = 0;
        let mut registered: Option<AgentIdentity> = None;

        while !cancel.is_cancelled() {
            self.tracker.transition(AgentState::Registering).await;

            if let Some(delay) = reregister_delay.take() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let Some((identity, ack, anchor)) = self.register(generation, &cancel).await else {
                break;
            };
            registered = Some(identity.clone());

            self.tracker
                .set_registered(
                    identity.clone(),
                    Lease {
                        holder_id: identity.uid.clone(),
                        renew_interval: self.lease.renew_interval,
                        last_renewal_time: Some(Utc::now()),
                        version: ack.lease_version,
                    },
                )
                .await;
            self.tracker.reset_failures();
            self.runtime.logger.log_registered(
                &identity,
                &self.profile.pod_address_range().to_string(),
                ack.lease_version,
            );
            self.tracker.transition(AgentState::Active).await;

            match self.run_loops(&identity, ack.lease_version, anchor, &cancel).await {
                Some(reason) => {
                    // An identity that outlived one lease period counts as stable
                    if anchor.elapsed() >= self.lease.renew_interval {
                        reregister_backoff.reset();
                    }
                    let delay = reregister_backoff.next_delay();
                    self.runtime.logger.log_superseded(&identity, &reason);
                    self.runtime.metrics.inc_reregistrations();
                    debug!(
                        agent = %self.name,
                        attempt = reregister_backoff.failures(),
                        reregister_in_ms = delay.as_millis() as u64,
                        "Waiting before re-registration"
                    );
                    reregister_delay = Some(delay);
                    registered = None;
                    generation = identity.generation + 1;
                }
                None => break,
            }
        }

        self.tracker.transition(AgentState::Terminating).await;
        if let Some(identity) = registered {
            self.deregister(&identity).await;
        }
        self.tracker.transition(AgentState::Stopped).await;
    }

    /// Register until acknowledged. A conflict retries under a fresh identity;
    /// any other error retries the same identity after backoff. Returns `None`
    /// if cancelled first.
    async fn register(
        &self,
        mut generation: u64,
        cancel: &CancellationToken,
    ) -> Option<(AgentIdentity, RegistrationAck, Instant)> {
        let retry = self.runtime.retry;
        let mut backoff = Backoff::new(retry.backoff_base, retry.backoff_max);
        let mut identity = AgentIdentity::fresh(self.name.clone(), generation);

        loop {
            let call_started = Instant::now();
            let call = with_timeout(
                retry.call_timeout,
                self.runtime.control_plane.register_agent(&identity, &self.profile),
            );
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                result = call => result,
            };
            self.runtime
                .metrics
                .observe_call_latency(Operation::Register, call_started.elapsed().as_secs_f64());

            let error = match result {
                Ok(ack) => {
                    self.runtime.metrics.inc_registration("success");
                    return Some((identity, ack, Instant::now()));
                }
                Err(e) => e,
            };

            self.runtime.metrics.inc_registration(error.kind());
            let delay = backoff.next_delay();
            warn!(
                agent = %self.name,
                generation = identity.generation,
                error = %error,
                attempt = backoff.failures(),
                retry_in_ms = delay.as_millis() as u64,
                "Registration failed"
            );
            if matches!(error, ControlPlaneError::Conflict(_)) {
                generation += 1;
                identity = AgentIdentity::fresh(self.name.clone(), generation);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run both loops until the agent is cancelled (returns `None`) or one
    /// loop reports the identity superseded (returns the reason). Both loops
    /// have exited when this returns.
    async fn run_loops(
        &self,
        identity: &AgentIdentity,
        lease_version: u64,
        anchor: Instant,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let loops_cancel = cancel.child_token();
        let mut loops = JoinSet::new();

        let heartbeat = HeartbeatLoop::new(
            identity.clone(),
            lease_version,
            self.lease,
            self.runtime.retry,
            self.runtime.control_plane.clone(),
            self.tracker.clone(),
            self.runtime.metrics.clone(),
        );
        loops.spawn(heartbeat.run(anchor, loops_cancel.clone()));

        let status = StatusSyncLoop::new(
            identity.clone(),
            self.status,
            self.runtime.retry,
            self.profile.clone(),
            self.ledger.clone(),
            self.runtime.control_plane.clone(),
            self.tracker.clone(),
            self.runtime.metrics.clone(),
        );
        loops.spawn(status.run(anchor, loops_cancel.clone()));

        let mut superseded = None;
        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok(LoopExit::Cancelled) => {}
                Ok(LoopExit::Superseded(e)) => {
                    loops_cancel.cancel();
                    superseded.get_or_insert_with(|| e.to_string());
                }
                Err(e) => {
                    error!(agent = %self.name, error = %e, "Agent loop panicked, re-registering");
                    loops_cancel.cancel();
                    superseded.get_or_insert_with(|| format!("loop failed: {}", e));
                }
            }
        }

        if cancel.is_cancelled() {
            None
        } else {
            superseded
        }
    }

    async fn deregister(&self, identity: &AgentIdentity) {
        let call_started = Instant::now();
        let result = with_timeout(
            self.runtime.retry.call_timeout,
            self.runtime.control_plane.deregister(identity),
        )
        .await;
        self.runtime
            .metrics
            .observe_call_latency(Operation::Deregister, call_started.elapsed().as_secs_f64());

        match result {
            Ok(()) => debug!(agent = %identity.name, "Deregistered"),
            Err(e) => debug!(agent = %identity.name, error = %e, "Deregistration failed, ignoring"),
        }
    }
}
