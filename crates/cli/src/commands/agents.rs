//! Agent inspection commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{AgentSummary, ApiClient};
use crate::output::{
    color_state, format_bytes, format_cpu, format_timestamp, format_usage, print_json,
    print_table, OutputFormat,
};

/// Row for the agents table
#[derive(Tabled)]
struct AgentRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Pod CIDR")]
    pod_cidr: String,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "Memory")]
    memory: String,
    #[tabled(rename = "Placements")]
    placements: usize,
    #[tabled(rename = "Lease")]
    lease: String,
}

impl From<&AgentSummary> for AgentRow {
    fn from(agent: &AgentSummary) -> Self {
        Self {
            name: agent.name.clone(),
            state: color_state(&agent.state),
            pod_cidr: agent.pod_cidr.clone(),
            cpu: format_usage(
                format_cpu(agent.used.cpu_millis),
                format_cpu(allocatable(agent, "cpu")),
            ),
            memory: format_usage(
                format_bytes(agent.used.memory_bytes),
                format_bytes(allocatable(agent, "memory")),
            ),
            placements: agent.live_placements,
            lease: agent
                .lease_version
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

fn allocatable(agent: &AgentSummary, key: &str) -> u64 {
    agent.allocatable.get(key).copied().unwrap_or(0)
}

/// List every agent in the fleet
pub async fn list_agents(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let agents = client.list_agents().await?;

    match format {
        OutputFormat::Json => print_json(&agents)?,
        OutputFormat::Table => {
            print_table(agents.iter().map(AgentRow::from).collect());
            let active = agents
                .iter()
                .filter(|a| a.state == "active" || a.state == "degraded")
                .count();
            println!("\nTotal: {} agents ({} serving)", agents.len(), active);
        }
    }

    Ok(())
}

/// Show one agent with its live placements
pub async fn show_agent(client: &ApiClient, name: &str, format: OutputFormat) -> Result<()> {
    let agent = client.get_agent(name).await?;

    if format == OutputFormat::Json {
        return print_json(&agent);
    }

    println!("{}", "Agent".bold());
    println!("{}", "=".repeat(50));
    println!("Name:                 {}", agent.name.cyan());
    println!("State:                {}", color_state(&agent.state));
    println!("UID:                  {}", agent.uid.as_deref().unwrap_or("-"));
    println!(
        "Generation:           {}",
        agent
            .generation
            .map(|g| g.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("Pod CIDR:             {}", agent.pod_cidr);
    println!();
    println!("{}", "Liveness".bold());
    println!("{}", "-".repeat(50));
    println!(
        "Lease Version:        {}",
        agent
            .lease_version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!(
        "Last Renewal:         {}",
        format_timestamp(agent.last_lease_renewal.as_ref())
    );
    println!(
        "Last Status Publish:  {}",
        format_timestamp(agent.last_status_publish.as_ref())
    );
    println!(
        "Failures:             heartbeat {}, status {}",
        agent.heartbeat_failures, agent.status_failures
    );
    println!();
    println!("{}", "Resources".bold());
    println!("{}", "-".repeat(50));
    println!(
        "CPU:                  {}",
        format_usage(
            format_cpu(agent.used.cpu_millis),
            format_cpu(allocatable(&agent, "cpu"))
        )
    );
    println!(
        "Memory:               {}",
        format_usage(
            format_bytes(agent.used.memory_bytes),
            format_bytes(allocatable(&agent, "memory"))
        )
    );
    println!(
        "GPU:                  {}",
        format_usage(
            agent.used.gpu_count.to_string(),
            allocatable(&agent, "nvidia.com/gpu").to_string()
        )
    );
    println!(
        "Pods:                 {}",
        format_usage(
            agent.used.pods.to_string(),
            allocatable(&agent, "pods").to_string()
        )
    );

    let placements = client.list_placements(name).await?;
    if !placements.is_empty() {
        println!();
        super::placements::print_records(&placements);
    }

    Ok(())
}
