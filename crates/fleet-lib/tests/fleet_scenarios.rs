//! End-to-end fleet scenarios against the in-memory control plane

use fleet_lib::control_plane::Operation;
use fleet_lib::ledger::RejectionReason;
use fleet_lib::{
    AgentState, FleetConfig, FleetError, FleetMetrics, FleetSupervisor, HealthRegistry,
    MemoryControlPlane, Resource, ResourceRequest,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const GI: u64 = 1 << 30;

fn supervisor(config: FleetConfig, cp: Arc<MemoryControlPlane>) -> (FleetSupervisor, HealthRegistry) {
    let health = HealthRegistry::new();
    let supervisor =
        FleetSupervisor::new(config, cp, health.clone(), FleetMetrics::new()).unwrap();
    (supervisor, health)
}

async fn wait_until_active(supervisor: &FleetSupervisor, count: usize) {
    loop {
        let summaries = supervisor.summaries().await;
        if summaries.len() == count && summaries.iter().all(|s| s.state == AgentState::Active) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn single_agent_admission_scenario() {
    let cp = Arc::new(MemoryControlPlane::new());
    let config = FleetConfig {
        fleet_size: 1,
        cpu_millis_per_agent: 1000,
        memory_bytes_per_agent: 4 * GI,
        gpu_count_per_agent: 0,
        ..Default::default()
    };
    let (supervisor, _) = supervisor(config, cp.clone());
    supervisor.start().await.unwrap();
    wait_until_active(&supervisor, 1).await;

    assert_eq!(cp.node_count(), 1);

    let first = supervisor
        .submit_placement("hollow-node-0", "w1", ResourceRequest::new(500, GI, 0))
        .await
        .unwrap();
    assert!(first.is_admitted());

    let second = supervisor
        .submit_placement("hollow-node-0", "w2", ResourceRequest::new(600, GI, 0))
        .await
        .unwrap();
    match second.rejection() {
        Some(RejectionReason::Insufficient {
            resource,
            requested,
            used,
            allocatable,
        }) => {
            assert_eq!(*resource, Resource::Cpu);
            assert_eq!((*requested, *used, *allocatable), (600, 500, 1000));
        }
        other => panic!("expected cpu rejection, got {other:?}"),
    }

    // Releasing twice leaves the same state as releasing once.
    assert!(supervisor.release_placement("hollow-node-0", "w1").await.unwrap());
    assert!(!supervisor.release_placement("hollow-node-0", "w1").await.unwrap());
    let summary = supervisor.agent("hollow-node-0").unwrap().summary().await;
    assert_eq!(summary.used.cpu_millis, 0);
    assert_eq!(summary.live_placements, 0);
    assert_eq!(summary.observed_generation, 2);

    let report = supervisor.shutdown().await;
    assert_eq!(report.stopped, vec!["hollow-node-0".to_string()]);
    assert!(report.is_clean());
}

#[tokio::test(start_paused = true)]
async fn fleet_launches_with_decorrelated_ticks() {
    let cp = Arc::new(MemoryControlPlane::new());
    let config = FleetConfig {
        fleet_size: 50,
        start_stagger_millis: 0,
        start_jitter_millis: 5000,
        lease_renew_interval_seconds: 10,
        ..Default::default()
    };
    let (supervisor, health) = supervisor(config, cp.clone());
    assert!(!health.readiness().await.ready);

    supervisor.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(supervisor.launched(), 50);
    assert!(health.readiness().await.ready);
    wait_until_active(&supervisor, 50).await;

    tokio::time::sleep(Duration::from_secs(30)).await;

    let mut first_renewals = HashSet::new();
    for index in 0..50 {
        let name = format!("hollow-node-{index}");
        let renewals = cp.successes(Operation::RenewLease, &name).await;
        assert!(renewals.len() >= 3, "{name} renewed {} times", renewals.len());
        first_renewals.insert(renewals[0]);
    }
    // Jittered starts spread the first renewals over many distinct instants.
    assert!(first_renewals.len() >= 45, "only {} distinct instants", first_renewals.len());

    let summaries = supervisor.summaries().await;
    let names: Vec<_> = summaries.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names[0], "hollow-node-0");
    assert_eq!(names[49], "hollow-node-49");
    let cidrs: HashSet<_> = summaries.iter().map(|s| s.pod_cidr.clone()).collect();
    assert_eq!(cidrs.len(), 50);

    let report = supervisor.shutdown().await;
    assert_eq!(report.stopped.len(), 50);
    assert!(report.failed.is_empty());
    assert_eq!(cp.node_count(), 0);
    assert!(!health.readiness().await.ready);
}

#[tokio::test(start_paused = true)]
async fn shutdown_reports_agents_that_miss_the_deadline() {
    let cp = Arc::new(MemoryControlPlane::new());
    let config = FleetConfig {
        fleet_size: 3,
        call_timeout_seconds: 120,
        shutdown_timeout_seconds: 5,
        ..Default::default()
    };
    let (supervisor, _) = supervisor(config, cp.clone());
    supervisor.start().await.unwrap();
    wait_until_active(&supervisor, 3).await;

    cp.set_latency(Duration::from_secs(3600)).await;
    let report = supervisor.shutdown().await;

    assert!(report.stopped.is_empty());
    assert_eq!(
        report.failed,
        vec![
            "hollow-node-0".to_string(),
            "hollow-node-1".to_string(),
            "hollow-node-2".to_string()
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn unknown_agent_is_an_error() {
    let cp = Arc::new(MemoryControlPlane::new());
    let (supervisor, _) = supervisor(FleetConfig::default(), cp);
    supervisor.start().await.unwrap();

    let result = supervisor
        .submit_placement("hollow-node-9", "w1", ResourceRequest::new(1, 1, 0))
        .await;
    assert!(matches!(result, Err(FleetError::UnknownAgent(name)) if name == "hollow-node-9"));
    assert!(matches!(
        supervisor.start().await,
        Err(FleetError::AlreadyStarted)
    ));

    supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn degraded_agent_keeps_serving_and_recovers() {
    let cp = Arc::new(MemoryControlPlane::new());
    let config = FleetConfig {
        failure_threshold: 3,
        lease_renew_interval_seconds: 10,
        ..Default::default()
    };
    let (supervisor, health) = supervisor(config, cp.clone());
    supervisor.start().await.unwrap();
    wait_until_active(&supervisor, 1).await;

    cp.fail_next(
        Operation::RenewLease,
        3,
        fleet_lib::ControlPlaneError::Timeout(Duration::from_secs(10)),
    )
    .await;
    let handle = supervisor.agent("hollow-node-0").unwrap();
    let mut states = handle.subscribe();
    states
        .wait_for(|s| *s == AgentState::Degraded)
        .await
        .unwrap();
    assert_eq!(
        health.health().await.status,
        fleet_lib::ComponentStatus::Degraded
    );

    // Placements are still accepted while degraded.
    assert!(handle
        .submit_placement("w1", ResourceRequest::new(100, GI, 0))
        .await
        .is_admitted());

    states.wait_for(|s| *s == AgentState::Active).await.unwrap();
    assert_eq!(handle.summary().await.heartbeat_failures, 0);

    supervisor.shutdown().await;
}
