//! Status sync loop
//!
//! Rebuilds the full status snapshot every `min_interval` (F) from the
//! resource profile and the admission ledger and publishes it only when a
//! condition changed or the last successful publish is `max_interval` (M)
//! old. Skipped ticks are what keeps the fleet's average publish rate well
//! below N/F.

use crate::config::{RetryPolicy, StatusConfig};
use crate::control_plane::{with_timeout, ControlPlane, Operation};
use crate::heartbeat::LoopExit;
use crate::ledger::{AdmissionLedger, LedgerSnapshot};
use crate::models::{
    AgentIdentity, ConditionStatus, ConditionType, NodeCondition, Resource, StatusSnapshot,
};
use crate::observability::FleetMetrics;
use crate::profile::ResourceProfile;
use crate::state::{AgentTracker, LoopKind};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Desired status, reason and message for one condition
fn evaluate(
    condition_type: ConditionType,
    usage: &LedgerSnapshot,
    threshold: f64,
) -> (ConditionStatus, &'static str, &'static str) {
    match condition_type {
        ConditionType::Ready => (
            ConditionStatus::True,
            "AgentReady",
            "hollow agent is posting ready status",
        ),
        ConditionType::MemoryPressure => {
            if usage.utilization(Resource::Memory) >= threshold {
                (
                    ConditionStatus::True,
                    "AgentHasInsufficientMemory",
                    "admitted memory is above the pressure threshold",
                )
            } else {
                (
                    ConditionStatus::False,
                    "AgentHasSufficientMemory",
                    "agent has sufficient memory available",
                )
            }
        }
        ConditionType::DiskPressure => (
            ConditionStatus::False,
            "AgentHasNoDiskPressure",
            "agent has no disk pressure",
        ),
        ConditionType::PIDPressure => {
            if usage.utilization(Resource::Pods) >= threshold {
                (
                    ConditionStatus::True,
                    "AgentHasInsufficientPID",
                    "admitted pods are above the pressure threshold",
                )
            } else {
                (
                    ConditionStatus::False,
                    "AgentHasSufficientPID",
                    "agent has sufficient PID available",
                )
            }
        }
        ConditionType::NetworkUnavailable => (
            ConditionStatus::False,
            "RouteCreated",
            "pod network is configured",
        ),
    }
}

/// Build the conditions for `usage`, keeping the transition time of every
/// condition whose status did not change.
pub fn build_conditions(
    previous: &[NodeCondition],
    usage: &LedgerSnapshot,
    threshold: f64,
    now: DateTime<Utc>,
) -> Vec<NodeCondition> {
    ConditionType::ALL
        .iter()
        .map(|&condition_type| {
            let (status, reason, message) = evaluate(condition_type, usage, threshold);
            let last_transition_time = previous
                .iter()
                .find(|c| c.condition_type == condition_type && c.status == status)
                .map_or(now, |c| c.last_transition_time);
            NodeCondition {
                condition_type,
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time,
            }
        })
        .collect()
}

pub struct StatusSyncLoop {
    identity: AgentIdentity,
    config: StatusConfig,
    retry: RetryPolicy,
    profile: ResourceProfile,
    ledger: Arc<AdmissionLedger>,
    control_plane: Arc<dyn ControlPlane>,
    tracker: Arc<AgentTracker>,
    metrics: FleetMetrics,
    conditions: Vec<NodeCondition>,
    last_published: Option<Vec<NodeCondition>>,
    last_success: Option<Instant>,
}

impl StatusSyncLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: AgentIdentity,
        config: StatusConfig,
        retry: RetryPolicy,
        profile: ResourceProfile,
        ledger: Arc<AdmissionLedger>,
        control_plane: Arc<dyn ControlPlane>,
        tracker: Arc<AgentTracker>,
        metrics: FleetMetrics,
    ) -> Self {
        Self {
            identity,
            config,
            retry,
            profile,
            ledger,
            control_plane,
            tracker,
            metrics,
            conditions: Vec::new(),
            last_published: None,
            last_success: None,
        }
    }

    /// Recompute the snapshot from the profile and the current ledger usage
    pub async fn snapshot(&mut self) -> StatusSnapshot {
        let usage = self.ledger.snapshot().await;
        let now = Utc::now();
        self.conditions =
            build_conditions(&self.conditions, &usage, self.config.pressure_threshold, now);

        StatusSnapshot {
            conditions: self.conditions.clone(),
            capacity: self.profile.capacity(),
            allocatable: self.profile.allocatable(),
            observed_generation: usage.generation,
            pod_cidr: self.profile.pod_address_range().to_string(),
            generated_at: now,
        }
    }

    fn should_publish(&self, snapshot: &StatusSnapshot, now: Instant) -> bool {
        let Some(last_success) = self.last_success else {
            return true;
        };
        let changed = self
            .last_published
            .as_ref()
            .map_or(true, |previous| snapshot.conditions_differ(previous));
        changed || now.duration_since(last_success) >= self.config.max_interval
    }

    /// Next wake-up: the regular tick, or the staleness deadline if that
    /// comes first and is still ahead.
    fn next_wake(&self, next_tick: Instant, now: Instant) -> Instant {
        match self.last_success {
            Some(last) => {
                let stale_at = last + self.config.max_interval;
                if stale_at > now && stale_at < next_tick {
                    stale_at
                } else {
                    next_tick
                }
            }
            None => next_tick,
        }
    }

    /// Run until cancelled or superseded. The first tick fires at `anchor`
    /// and always publishes.
    pub async fn run(mut self, anchor: Instant, cancel: CancellationToken) -> LoopExit {
        let period = self.config.min_interval;
        let mut next_tick = anchor;

        loop {
            let wake = self.next_wake(next_tick, Instant::now());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return LoopExit::Cancelled,
                _ = sleep_until(wake) => {}
            }

            let now = Instant::now();
            while next_tick <= now {
                next_tick += period;
            }

            let snapshot = self.snapshot().await;
            if !self.should_publish(&snapshot, now) {
                self.metrics.inc_status_publish("skipped");
                continue;
            }

            let call = with_timeout(
                self.retry.call_timeout,
                self.control_plane.publish_status(&self.identity, &snapshot),
            );
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return LoopExit::Cancelled,
                result = call => result,
            };
            self.metrics
                .observe_call_latency(Operation::PublishStatus, now.elapsed().as_secs_f64());

            match result {
                Ok(()) => {
                    self.last_success = Some(now);
                    self.last_published = Some(snapshot.conditions);
                    self.metrics.inc_status_publish("published");
                    self.tracker.record_publish(snapshot.generated_at).await;
                    self.tracker.record_success(LoopKind::StatusSync).await;
                    debug!(
                        agent = %self.identity.name,
                        observed_generation = snapshot.observed_generation,
                        "Status published"
                    );
                }
                Err(e) if e.is_identity_lost() => {
                    self.metrics.inc_status_publish("superseded");
                    return LoopExit::Superseded(e);
                }
                Err(e) => {
                    // last_success is kept so staleness keeps counting through the outage.
                    self.metrics.inc_status_publish("failed");
                    let failures = self.tracker.record_failure(LoopKind::StatusSync).await;
                    warn!(
                        agent = %self.identity.name,
                        error = %e,
                        consecutive_failures = failures,
                        "Status publish failed"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::{ControlPlaneError, MemoryControlPlane};
    use crate::health::HealthRegistry;
    use crate::models::{AgentState, ResourceRequest};
    use crate::observability::StructuredLogger;
    use std::time::Duration;

    const GI: u64 = 1 << 30;

    struct Fixture {
        cp: Arc<MemoryControlPlane>,
        tracker: Arc<AgentTracker>,
        ledger: Arc<AdmissionLedger>,
        profile: ResourceProfile,
        identity: AgentIdentity,
    }

    async fn fixture() -> Fixture {
        let cp = Arc::new(MemoryControlPlane::new());
        let profile = ResourceProfile::builder()
            .cpu_millis(1000)
            .memory_bytes(4 * GI)
            .max_pods(10)
            .pod_address_range("10.64.0.0/24")
            .build()
            .unwrap();
        let identity = AgentIdentity::fresh("hollow-node-0", 0);
        cp.register_agent(&identity, &profile).await.unwrap();

        let tracker = Arc::new(AgentTracker::new(
            "hollow-node-0",
            3,
            HealthRegistry::new(),
            FleetMetrics::new(),
            StructuredLogger::new("test"),
        ));
        tracker.announce().await;
        tracker.transition(AgentState::Registering).await;
        tracker.transition(AgentState::Active).await;

        Fixture {
            cp,
            tracker,
            ledger: Arc::new(AdmissionLedger::new(profile.allocatable())),
            profile,
            identity,
        }
    }

    fn status_loop(f: &Fixture, min_secs: u64, max_secs: u64) -> StatusSyncLoop {
        StatusSyncLoop::new(
            f.identity.clone(),
            StatusConfig {
                min_interval: Duration::from_secs(min_secs),
                max_interval: Duration::from_secs(max_secs),
                pressure_threshold: 0.9,
            },
            RetryPolicy {
                failure_threshold: 3,
                backoff_base: Duration::from_millis(200),
                backoff_max: Duration::from_secs(30),
                call_timeout: Duration::from_secs(2),
            },
            f.profile.clone(),
            f.ledger.clone(),
            f.cp.clone(),
            f.tracker.clone(),
            FleetMetrics::new(),
        )
    }

    async fn publish_offsets(f: &Fixture, anchor: Instant) -> Vec<Duration> {
        f.cp.successes(Operation::PublishStatus, "hollow-node-0")
            .await
            .into_iter()
            .map(|at| at - anchor)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_status_publishes_only_on_staleness() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        let anchor = Instant::now();
        let task = tokio::spawn(status_loop(&f, 5, 60).run(anchor, cancel.clone()));

        tokio::time::sleep(Duration::from_secs(100)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(
            publish_offsets(&f, anchor).await,
            vec![Duration::ZERO, Duration::from_secs(60)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_bound_between_ticks() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        let anchor = Instant::now();
        let task = tokio::spawn(status_loop(&f, 10, 25).run(anchor, cancel.clone()));

        tokio::time::sleep(Duration::from_secs(80)).await;
        cancel.cancel();
        task.await.unwrap();

        let offsets = publish_offsets(&f, anchor).await;
        assert_eq!(
            offsets,
            vec![
                Duration::ZERO,
                Duration::from_secs(25),
                Duration::from_secs(50),
                Duration::from_secs(75)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_condition_change_publishes_on_next_tick() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        let anchor = Instant::now();
        let task = tokio::spawn(status_loop(&f, 5, 60).run(anchor, cancel.clone()));

        tokio::time::sleep(Duration::from_secs(12)).await;
        let decision = f
            .ledger
            .try_admit("big", ResourceRequest::new(100, 4 * GI, 0))
            .await;
        assert!(decision.is_admitted());

        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(
            publish_offsets(&f, anchor).await,
            vec![Duration::ZERO, Duration::from_secs(15)]
        );
        let node = f.cp.node("hollow-node-0").unwrap();
        let status = node.last_status.unwrap();
        assert_eq!(
            status.condition(ConditionType::MemoryPressure).unwrap().status,
            ConditionStatus::True
        );
        assert_eq!(status.observed_generation, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_publish_keeps_staleness_clock() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        let anchor = Instant::now();
        let task = tokio::spawn(status_loop(&f, 5, 20).run(anchor, cancel.clone()));

        // The forced publish at t=20 fails; the retry at the next tick still
        // sees the agent as stale.
        tokio::time::sleep(Duration::from_secs(1)).await;
        f.cp.fail_next(
            Operation::PublishStatus,
            1,
            ControlPlaneError::Unavailable("injected".into()),
        )
        .await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(
            publish_offsets(&f, anchor).await,
            vec![Duration::ZERO, Duration::from_secs(25)]
        );
        assert_eq!(f.tracker.failures(LoopKind::StatusSync), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_publish_retried_until_success() {
        let f = fixture().await;
        f.cp.fail_next(
            Operation::PublishStatus,
            2,
            ControlPlaneError::Timeout(Duration::from_secs(2)),
        )
        .await;
        let cancel = CancellationToken::new();
        let anchor = Instant::now();
        let task = tokio::spawn(status_loop(&f, 5, 60).run(anchor, cancel.clone()));

        tokio::time::sleep(Duration::from_secs(12)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(
            publish_offsets(&f, anchor).await,
            vec![Duration::from_secs(10)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_supersedes() {
        let f = fixture().await;
        assert!(f.cp.remove_node("hollow-node-0"));
        let exit = status_loop(&f, 5, 60)
            .run(Instant::now(), CancellationToken::new())
            .await;
        assert!(matches!(
            exit,
            LoopExit::Superseded(ControlPlaneError::NotFound(_))
        ));
    }

    #[test]
    fn test_transition_time_moves_only_on_change() {
        let allocatable = crate::models::NodeResources {
            cpu_millis: 1000,
            memory_bytes: 100,
            gpu_count: 0,
            ephemeral_storage_bytes: 0,
            pods: 10,
        };
        let mut usage = LedgerSnapshot {
            used: Default::default(),
            allocatable,
            live_records: 0,
            generation: 0,
        };
        let t0 = Utc::now();
        let first = build_conditions(&[], &usage, 0.9, t0);
        assert_eq!(first.len(), 5);
        assert!(first.iter().all(|c| c.last_transition_time == t0));

        let t1 = t0 + chrono::Duration::seconds(30);
        let same = build_conditions(&first, &usage, 0.9, t1);
        assert!(same.iter().all(|c| c.last_transition_time == t0));

        usage.used.memory_bytes = 95;
        let pressured = build_conditions(&same, &usage, 0.9, t1);
        let memory = pressured
            .iter()
            .find(|c| c.condition_type == ConditionType::MemoryPressure)
            .unwrap();
        assert_eq!(memory.status, ConditionStatus::True);
        assert_eq!(memory.last_transition_time, t1);
        let ready = pressured
            .iter()
            .find(|c| c.condition_type == ConditionType::Ready)
            .unwrap();
        assert_eq!(ready.last_transition_time, t0);
    }
}
