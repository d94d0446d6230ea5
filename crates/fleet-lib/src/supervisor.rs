//! Fleet supervisor
//!
//! Fans out one [`AgentController`] per configured agent with staggered,
//! jittered start times so the fleet's periodic ticks do not line up into a
//! thundering herd, and aggregates their shutdown.

use crate::config::{ConfigError, FleetConfig};
use crate::control_plane::ControlPlane;
use crate::controller::{AgentController, AgentHandle, AgentRuntime, AgentSummary, StopOutcome};
use crate::health::HealthRegistry;
use crate::ledger::AdmissionDecision;
use crate::models::ResourceRequest;
use crate::observability::{FleetMetrics, StructuredLogger};
use crate::profile::ResourceProfile;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("invalid fleet configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("unknown agent '{0}'")]
    UnknownAgent(String),

    #[error("fleet already started")]
    AlreadyStarted,
}

/// Agents that stopped cleanly and agents that missed the shutdown deadline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    pub failed: Vec<String>,
}

impl ShutdownReport {
    /// Sort `agents` by outcome. An agent without an outcome, because its
    /// stop task failed, counts as failed.
    pub fn from_outcomes(agents: Vec<String>, outcomes: Vec<StopOutcome>) -> Self {
        let mut report = ShutdownReport::default();
        let mut reported = HashSet::new();
        for outcome in outcomes {
            reported.insert(outcome.name.clone());
            if outcome.clean {
                report.stopped.push(outcome.name);
            } else {
                report.failed.push(outcome.name);
            }
        }
        report
            .failed
            .extend(agents.into_iter().filter(|name| !reported.contains(name)));

        report.stopped.sort();
        report.failed.sort();
        report
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Start offset of every agent: `index * stagger + U[0, jitter)`
pub fn launch_offsets<R: Rng>(
    count: usize,
    stagger: Duration,
    jitter: Duration,
    rng: &mut R,
) -> Vec<Duration> {
    let jitter_nanos = jitter.as_nanos().min(u128::from(u64::MAX)) as u64;
    (0..count)
        .map(|index| {
            let base = stagger.saturating_mul(index.min(u32::MAX as usize) as u32);
            let extra = if jitter_nanos == 0 {
                Duration::ZERO
            } else {
                Duration::from_nanos(rng.gen_range(0..jitter_nanos))
            };
            base + extra
        })
        .collect()
}

struct FleetMember {
    index: usize,
    handle: Arc<AgentHandle>,
}

pub struct FleetSupervisor {
    config: FleetConfig,
    profiles: Vec<ResourceProfile>,
    runtime: AgentRuntime,
    agents: Arc<DashMap<String, FleetMember>>,
    launcher: Mutex<Option<JoinHandle<()>>>,
    launch_cancel: CancellationToken,
}

impl FleetSupervisor {
    /// Validate the configuration and build every agent's profile. Nothing
    /// touches the control plane until [`FleetSupervisor::start`].
    pub fn new(
        config: FleetConfig,
        control_plane: Arc<dyn ControlPlane>,
        health: HealthRegistry,
        metrics: FleetMetrics,
    ) -> Result<Self, FleetError> {
        config.validate()?;
        let profiles = (0..config.fleet_size)
            .map(|index| config.profile_for(index))
            .collect::<Result<Vec<_>, _>>()?;

        let runtime = AgentRuntime {
            control_plane,
            health,
            metrics,
            logger: StructuredLogger::new(config.name_prefix.clone()),
            retry: config.retry_policy(),
            shutdown_timeout: config.shutdown_timeout(),
        };

        Ok(Self {
            config,
            profiles,
            runtime,
            agents: Arc::new(DashMap::new()),
            launcher: Mutex::new(None),
            launch_cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Launch every agent in the background; readiness is set once all have
    /// been started.
    pub async fn start(&self) -> Result<(), FleetError> {
        let mut launcher = self.launcher.lock().await;
        if launcher.is_some() {
            return Err(FleetError::AlreadyStarted);
        }

        let offsets = launch_offsets(
            self.config.fleet_size,
            self.config.start_stagger(),
            self.config.start_jitter(),
            &mut rand::thread_rng(),
        );
        let mut schedule: Vec<(Duration, usize)> = offsets
            .into_iter()
            .enumerate()
            .map(|(index, offset)| (offset, index))
            .collect();
        schedule.sort();

        self.runtime
            .logger
            .log_fleet_started(env!("CARGO_PKG_VERSION"), self.config.fleet_size);

        let launch = Launch {
            config: self.config.clone(),
            profiles: self.profiles.clone(),
            runtime: self.runtime.clone(),
            agents: self.agents.clone(),
            cancel: self.launch_cancel.clone(),
        };
        *launcher = Some(tokio::spawn(launch.run(schedule)));
        Ok(())
    }

    pub fn agent(&self, name: &str) -> Result<Arc<AgentHandle>, FleetError> {
        self.agents
            .get(name)
            .map(|member| member.handle.clone())
            .ok_or_else(|| FleetError::UnknownAgent(name.to_string()))
    }

    /// Number of agents launched so far
    pub fn launched(&self) -> usize {
        self.agents.len()
    }

    pub async fn submit_placement(
        &self,
        agent: &str,
        workload_id: &str,
        request: ResourceRequest,
    ) -> Result<AdmissionDecision, FleetError> {
        let handle = self.agent(agent)?;
        Ok(handle.submit_placement(workload_id, request).await)
    }

    pub async fn release_placement(&self, agent: &str, workload_id: &str) -> Result<bool, FleetError> {
        let handle = self.agent(agent)?;
        Ok(handle.release_placement(workload_id).await)
    }

    /// Summaries of all launched agents in fleet-index order
    pub async fn summaries(&self) -> Vec<AgentSummary> {
        let mut members: Vec<(usize, Arc<AgentHandle>)> = self
            .agents
            .iter()
            .map(|entry| (entry.index, entry.handle.clone()))
            .collect();
        members.sort_by_key(|(index, _)| *index);

        let mut summaries = Vec::with_capacity(members.len());
        for (_, handle) in members {
            summaries.push(handle.summary().await);
        }
        summaries
    }

    /// Stop launching, then stop every agent concurrently. Each agent is
    /// bounded by the shutdown timeout, so the whole fleet is as well.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.launch_cancel.cancel();
        if let Some(launcher) = self.launcher.lock().await.take() {
            if let Err(e) = launcher.await {
                error!(error = %e, "Fleet launcher failed");
            }
        }
        self.runtime.health.set_ready(false).await;

        let mut names = Vec::with_capacity(self.agents.len());
        let mut stops = JoinSet::new();
        for entry in self.agents.iter() {
            names.push(entry.key().clone());
            let handle = entry.handle.clone();
            stops.spawn(async move { handle.stop().await });
        }

        let mut outcomes = Vec::with_capacity(names.len());
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "Agent stop task failed"),
            }
        }
        let report = ShutdownReport::from_outcomes(names, outcomes);

        self.runtime
            .logger
            .log_shutdown_report(report.stopped.len(), &report.failed);
        report
    }
}

/// Background task starting agents on their schedule
struct Launch {
    config: FleetConfig,
    profiles: Vec<ResourceProfile>,
    runtime: AgentRuntime,
    agents: Arc<DashMap<String, FleetMember>>,
    cancel: CancellationToken,
}

impl Launch {
    async fn run(self, schedule: Vec<(Duration, usize)>) {
        let began = Instant::now();
        for (offset, index) in schedule {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = sleep_until(began + offset) => {}
            }

            let name = self.config.agent_name(index);
            let handle = AgentController::start(
                name.clone(),
                self.profiles[index].clone(),
                self.config.lease_config(),
                self.config.status_config(),
                self.runtime.clone(),
            );
            self.agents.insert(
                name,
                FleetMember {
                    index,
                    handle: Arc::new(handle),
                },
            );
        }

        info!(agents = self.agents.len(), "All agents launched");
        self.runtime.health.set_ready(true).await;
    }
}
