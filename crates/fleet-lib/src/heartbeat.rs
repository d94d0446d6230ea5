//! Heartbeat loop
//!
//! Renews the agent's liveness lease every `renew_interval`. The next attempt
//! is scheduled from the start of the previous attempt, so failed or slow
//! renewals never push the cadence back. After a failure the bounded backoff
//! may delay the next attempt past its tick but never brings it forward.

use crate::backoff::Backoff;
use crate::config::{LeaseConfig, RetryPolicy};
use crate::control_plane::{with_timeout, ControlPlane, ControlPlaneError, Operation};
use crate::models::AgentIdentity;
use crate::observability::FleetMetrics;
use crate::state::{AgentTracker, LoopKind};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a loop returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// The agent's cancellation token fired
    Cancelled,
    /// The control plane no longer accepts this identity
    Superseded(ControlPlaneError),
}

pub struct HeartbeatLoop {
    identity: AgentIdentity,
    lease_version: u64,
    config: LeaseConfig,
    retry: RetryPolicy,
    control_plane: Arc<dyn ControlPlane>,
    tracker: Arc<AgentTracker>,
    metrics: FleetMetrics,
    backoff: Backoff,
}

impl HeartbeatLoop {
    pub fn new(
        identity: AgentIdentity,
        lease_version: u64,
        config: LeaseConfig,
        retry: RetryPolicy,
        control_plane: Arc<dyn ControlPlane>,
        tracker: Arc<AgentTracker>,
        metrics: FleetMetrics,
    ) -> Self {
        Self {
            identity,
            lease_version,
            config,
            retry,
            control_plane,
            tracker,
            metrics,
            backoff: Backoff::new(retry.backoff_base, retry.backoff_max),
        }
    }

    /// Run until cancelled or superseded. `anchor` is the registration instant;
    /// the first renewal happens one period after it.
    pub async fn run(mut self, anchor: Instant, cancel: CancellationToken) -> LoopExit {
        let period = self.config.renew_interval;
        let mut next_attempt = anchor + period;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return LoopExit::Cancelled,
                _ = sleep_until(next_attempt) => {}
            }

            let started = next_attempt;

            let call_started = Instant::now();
            let call = with_timeout(
                self.retry.call_timeout,
                self.control_plane
                    .renew_lease(&self.identity, self.lease_version),
            );
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return LoopExit::Cancelled,
                result = call => result,
            };
            self.metrics.observe_call_latency(
                Operation::RenewLease,
                call_started.elapsed().as_secs_f64(),
            );

            next_attempt = match result {
                Ok(version) => {
                    self.lease_version = version;
                    self.backoff.reset();
                    self.metrics.inc_lease_renewal("success");
                    self.tracker.record_renewal(version, Utc::now()).await;
                    self.tracker.record_success(LoopKind::Heartbeat).await;
                    debug!(agent = %self.identity.name, lease_version = version, "Lease renewed");
                    started + period
                }
                Err(e) if e.is_identity_lost() => {
                    self.metrics.inc_lease_renewal("superseded");
                    return LoopExit::Superseded(e);
                }
                Err(e) => {
                    self.metrics.inc_lease_renewal("failure");
                    let delay = self.backoff.next_delay();
                    let failures = self.tracker.record_failure(LoopKind::Heartbeat).await;
                    warn!(
                        agent = %self.identity.name,
                        error = %e,
                        consecutive_failures = failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Lease renewal failed"
                    );
                    (started + period).max(Instant::now() + delay)
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::MemoryControlPlane;
    use crate::health::HealthRegistry;
    use crate::models::AgentState;
    use crate::observability::StructuredLogger;
    use crate::profile::ResourceProfile;
    use std::time::Duration;

    const PERIOD: Duration = Duration::from_secs(10);

    struct Fixture {
        cp: Arc<MemoryControlPlane>,
        tracker: Arc<AgentTracker>,
        identity: AgentIdentity,
        lease_version: u64,
    }

    async fn fixture() -> Fixture {
        let cp = Arc::new(MemoryControlPlane::new());
        let profile = ResourceProfile::builder()
            .cpu_millis(1000)
            .memory_bytes(1 << 30)
            .pod_address_range("10.64.0.0/24")
            .build()
            .unwrap();
        let identity = AgentIdentity::fresh("hollow-node-0", 0);
        let ack = cp.register_agent(&identity, &profile).await.unwrap();

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
            identity,
            lease_version: ack.lease_version,
        }
    }

    fn heartbeat(f: &Fixture) -> HeartbeatLoop {
        HeartbeatLoop::new(
            f.identity.clone(),
            f.lease_version,
            LeaseConfig {
                renew_interval: PERIOD,
            },
            RetryPolicy {
                failure_threshold: 3,
                backoff_base: Duration::from_millis(200),
                backoff_max: Duration::from_secs(30),
                call_timeout: Duration::from_secs(5),
            },
            f.cp.clone(),
            f.tracker.clone(),
            FleetMetrics::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewals_keep_fixed_cadence() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        let anchor = Instant::now();
        let task = tokio::spawn(heartbeat(&f).run(anchor, cancel.clone()));

        tokio::time::sleep(PERIOD * 50 + Duration::from_secs(1)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), LoopExit::Cancelled);

        let renewals = f
            .cp
            .successes(Operation::RenewLease, "hollow-node-0")
            .await;
        assert_eq!(renewals.len(), 50);
        for (i, at) in renewals.iter().enumerate() {
            assert_eq!(*at - anchor, PERIOD * (i as u32 + 1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_renewals_do_not_drift() {
        let f = fixture().await;
        f.cp.set_latency(Duration::from_secs(3)).await;
        let cancel = CancellationToken::new();
        let anchor = Instant::now();
        let task = tokio::spawn(heartbeat(&f).run(anchor, cancel.clone()));

        tokio::time::sleep(PERIOD * 10 + Duration::from_secs(5)).await;
        cancel.cancel();
        task.await.unwrap();

        let renewals = f
            .cp
            .successes(Operation::RenewLease, "hollow-node-0")
            .await;
        assert_eq!(renewals.len(), 10);
        for pair in renewals.windows(2) {
            assert_eq!(pair[1] - pair[0], PERIOD);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_degrade_then_recover() {
        let f = fixture().await;
        f.cp.fail_next(
            Operation::RenewLease,
            3,
            ControlPlaneError::Unavailable("injected".into()),
        )
        .await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(heartbeat(&f).run(Instant::now(), cancel.clone()));

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(f.tracker.state(), AgentState::Degraded);
        assert_eq!(f.tracker.failures(LoopKind::Heartbeat), 3);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.tracker.state(), AgentState::Active);
        assert_eq!(f.tracker.failures(LoopKind::Heartbeat), 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_but_never_advances() {
        let f = fixture().await;
        f.cp.fail_next(
            Operation::RenewLease,
            8,
            ControlPlaneError::Throttled("injected".into()),
        )
        .await;
        let cancel = CancellationToken::new();
        let anchor = Instant::now();
        let task = tokio::spawn(heartbeat(&f).run(anchor, cancel.clone()));

        tokio::time::sleep(Duration::from_secs(200)).await;
        cancel.cancel();
        task.await.unwrap();

        let attempts: Vec<Instant> = f
            .cp
            .calls_for(Operation::RenewLease, "hollow-node-0")
            .await
            .iter()
            .map(|c| c.at)
            .collect();
        // Backoff 200ms..12.8s: below the period for the first six failures,
        // above it afterwards.
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= PERIOD);
        }
        assert_eq!(attempts[1] - attempts[0], PERIOD);
        assert_eq!(attempts[7] - attempts[6], Duration::from_millis(12_800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_backoff_shifts_cadence_phase() {
        let f = fixture().await;
        f.cp.fail_next(
            Operation::RenewLease,
            7,
            ControlPlaneError::Throttled("injected".into()),
        )
        .await;
        let cancel = CancellationToken::new();
        let anchor = Instant::now();
        let task = tokio::spawn(heartbeat(&f).run(anchor, cancel.clone()));

        tokio::time::sleep(Duration::from_secs(110)).await;
        cancel.cancel();
        task.await.unwrap();

        let attempts: Vec<Duration> = f
            .cp
            .calls_for(Operation::RenewLease, "hollow-node-0")
            .await
            .iter()
            .map(|c| c.at - anchor)
            .collect();
        // The seventh failure backs off 12.8s past its tick; the cadence
        // continues from the delayed attempt.
        assert_eq!(attempts[6], Duration::from_secs(70));
        assert_eq!(attempts[7], Duration::from_millis(82_800));
        assert_eq!(attempts[8], Duration::from_millis(92_800));
        assert_eq!(attempts[9], Duration::from_millis(102_800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_supersedes_identity() {
        let f = fixture().await;
        assert!(f.cp.supersede("hollow-node-0"));
        let cancel = CancellationToken::new();
        let exit = heartbeat(&f).run(Instant::now(), cancel).await;

        assert!(matches!(
            exit,
            LoopExit::Superseded(ControlPlaneError::Conflict(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_inflight_call() {
        let f = fixture().await;
        f.cp.set_latency(Duration::from_secs(3600)).await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(heartbeat(&f).run(Instant::now(), cancel.clone()));

        tokio::time::sleep(Duration::from_secs(11)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), LoopExit::Cancelled);
    }
}
