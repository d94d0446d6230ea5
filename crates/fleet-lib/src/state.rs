//! Shared per-agent lifecycle state
//!
//! One [`AgentTracker`] per agent is shared by the controller task and both
//! loops. It owns the lifecycle state machine, the per-loop consecutive
//! failure counters, and mirrors every transition into metrics, health and
//! logs.

use crate::health::HealthRegistry;
use crate::models::{AgentIdentity, AgentState, Lease};
use crate::observability::{FleetMetrics, StructuredLogger};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{watch, Mutex, RwLock};

/// The two periodic loops of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Heartbeat,
    StatusSync,
}

/// Registration details that change with every identity
#[derive(Debug, Clone, Default)]
pub struct AgentDetails {
    pub identity: Option<AgentIdentity>,
    pub lease: Option<Lease>,
    pub last_status_publish: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct AgentTracker {
    name: String,
    failure_threshold: u32,
    state: watch::Sender<AgentState>,
    transition_lock: Mutex<()>,
    heartbeat_failures: AtomicU32,
    status_failures: AtomicU32,
    details: RwLock<AgentDetails>,
    health: HealthRegistry,
    metrics: FleetMetrics,
    logger: StructuredLogger,
}

impl AgentTracker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        health: HealthRegistry,
        metrics: FleetMetrics,
        logger: StructuredLogger,
    ) -> Self {
        let (state, _) = watch::channel(AgentState::Unregistered);
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            state,
            transition_lock: Mutex::new(()),
            heartbeat_failures: AtomicU32::new(0),
            status_failures: AtomicU32::new(0),
            details: RwLock::new(AgentDetails::default()),
            health,
            metrics,
            logger,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Publish the initial `Unregistered` state to metrics and health
    pub async fn announce(&self) {
        let _guard = self.transition_lock.lock().await;
        let state = self.state();
        self.metrics.record_transition(None, state);
        self.health.observe_agent(&self.name, state).await;
    }

    /// Move to `to` if the state machine allows it. Returns whether the state changed.
    pub async fn transition(&self, to: AgentState) -> bool {
        self.transition_when(|_| true, to).await
    }

    /// Move `from -> to` only if the agent is currently in `from`
    pub async fn transition_from(&self, from: AgentState, to: AgentState) -> bool {
        self.transition_when(|current| current == from, to).await
    }

    async fn transition_when<F>(&self, guard: F, to: AgentState) -> bool
    where
        F: Fn(AgentState) -> bool,
    {
        let _guard = self.transition_lock.lock().await;

        let mut previous = None;
        self.state.send_if_modified(|current| {
            if *current == to || !guard(*current) || !current.can_transition_to(to) {
                return false;
            }
            previous = Some(*current);
            *current = to;
            true
        });

        let Some(from) = previous else {
            return false;
        };

        self.metrics.record_transition(Some(from), to);
        self.health.observe_agent(&self.name, to).await;
        self.logger
            .log_state_change(&self.name, from, to, self.consecutive_failures());
        true
    }

    fn counter(&self, kind: LoopKind) -> &AtomicU32 {
        match kind {
            LoopKind::Heartbeat => &self.heartbeat_failures,
            LoopKind::StatusSync => &self.status_failures,
        }
    }

    fn other(kind: LoopKind) -> LoopKind {
        match kind {
            LoopKind::Heartbeat => LoopKind::StatusSync,
            LoopKind::StatusSync => LoopKind::Heartbeat,
        }
    }

    pub fn failures(&self, kind: LoopKind) -> u32 {
        self.counter(kind).load(Ordering::SeqCst)
    }

    /// Highest consecutive-failure count across both loops
    pub fn consecutive_failures(&self) -> u32 {
        self.failures(LoopKind::Heartbeat)
            .max(self.failures(LoopKind::StatusSync))
    }

    /// Count one failure; an Active agent degrades at the threshold.
    /// Returns the new consecutive-failure count for `kind`.
    pub async fn record_failure(&self, kind: LoopKind) -> u32 {
        let count = self.counter(kind).fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.failure_threshold {
            self.transition_from(AgentState::Active, AgentState::Degraded)
                .await;
        }
        count
    }

    /// Reset the loop's counter; a Degraded agent recovers once neither loop
    /// is at the threshold.
    pub async fn record_success(&self, kind: LoopKind) {
        self.counter(kind).store(0, Ordering::SeqCst);
        if self.failures(Self::other(kind)) < self.failure_threshold {
            self.transition_from(AgentState::Degraded, AgentState::Active)
                .await;
        }
    }

    pub fn reset_failures(&self) {
        self.heartbeat_failures.store(0, Ordering::SeqCst);
        self.status_failures.store(0, Ordering::SeqCst);
    }

    /// Install a freshly registered identity and its lease
    pub async fn set_registered(&self, identity: AgentIdentity, lease: Lease) {
        let mut details = self.details.write().await;
        details.identity = Some(identity);
        details.lease = Some(lease);
        details.last_status_publish = None;
    }

    pub async fn record_renewal(&self, version: u64, at: DateTime<Utc>) {
        let mut details = self.details.write().await;
        if let Some(lease) = details.lease.as_mut() {
            lease.version = version;
            lease.last_renewal_time = Some(at);
        }
    }

    pub async fn record_publish(&self, at: DateTime<Utc>) {
        self.details.write().await.last_status_publish = Some(at);
    }

    pub async fn details(&self) -> AgentDetails {
        self.details.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(threshold: u32) -> AgentTracker {
        AgentTracker::new(
            "hollow-node-0",
            threshold,
            HealthRegistry::new(),
            FleetMetrics::new(),
            StructuredLogger::new("test"),
        )
    }

    async fn activate(tracker: &AgentTracker) {
        tracker.announce().await;
        assert!(tracker.transition(AgentState::Registering).await);
        assert!(tracker.transition(AgentState::Active).await);
    }

    #[tokio::test]
    async fn test_rejects_illegal_transitions() {
        let tracker = tracker(3);
        assert!(!tracker.transition(AgentState::Active).await);
        assert_eq!(tracker.state(), AgentState::Unregistered);

        assert!(tracker.transition(AgentState::Terminating).await);
        assert!(!tracker.transition(AgentState::Registering).await);
        assert!(tracker.transition(AgentState::Stopped).await);
        assert!(!tracker.transition(AgentState::Terminating).await);
    }

    #[tokio::test]
    async fn test_degrades_at_threshold_and_recovers() {
        let tracker = tracker(3);
        activate(&tracker).await;

        assert_eq!(tracker.record_failure(LoopKind::Heartbeat).await, 1);
        assert_eq!(tracker.record_failure(LoopKind::Heartbeat).await, 2);
        assert_eq!(tracker.state(), AgentState::Active);
        assert_eq!(tracker.record_failure(LoopKind::Heartbeat).await, 3);
        assert_eq!(tracker.state(), AgentState::Degraded);

        tracker.record_success(LoopKind::Heartbeat).await;
        assert_eq!(tracker.state(), AgentState::Active);
        assert_eq!(tracker.failures(LoopKind::Heartbeat), 0);
    }

    #[tokio::test]
    async fn test_stays_degraded_while_other_loop_failing() {
        let tracker = tracker(2);
        activate(&tracker).await;

        tracker.record_failure(LoopKind::StatusSync).await;
        tracker.record_failure(LoopKind::StatusSync).await;
        assert_eq!(tracker.state(), AgentState::Degraded);

        tracker.record_success(LoopKind::Heartbeat).await;
        assert_eq!(tracker.state(), AgentState::Degraded);

        tracker.record_success(LoopKind::StatusSync).await;
        assert_eq!(tracker.state(), AgentState::Active);
    }

    #[tokio::test]
    async fn test_failures_do_not_degrade_outside_active() {
        let tracker = tracker(1);
        tracker.announce().await;
        tracker.transition(AgentState::Registering).await;

        tracker.record_failure(LoopKind::Heartbeat).await;
        assert_eq!(tracker.state(), AgentState::Registering);
    }

    #[tokio::test]
    async fn test_watch_observes_transitions() {
        let tracker = tracker(3);
        let mut rx = tracker.subscribe();
        activate(&tracker).await;

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), AgentState::Active);
    }

    #[tokio::test]
    async fn test_health_mirrors_state() {
        let health = HealthRegistry::new();
        let tracker = AgentTracker::new(
            "hollow-node-7",
            3,
            health.clone(),
            FleetMetrics::new(),
            StructuredLogger::new("test"),
        );
        tracker.announce().await;
        tracker.transition(AgentState::Registering).await;
        tracker.transition(AgentState::Active).await;

        let report = health.health().await;
        assert_eq!(
            report.components["hollow-node-7"].status,
            crate::health::ComponentStatus::Healthy
        );
    }
}
