//! Hollow fleet CLI
//!
//! A command-line tool for inspecting simulated agents and driving
//! workload placements through the fleet daemon's API.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{agents, placements};

/// Hollow fleet CLI
#[derive(Parser)]
#[command(name = "fleetctl")]
#[command(author, version, about = "CLI for the Hollow Fleet node simulator", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via FLEETCTL_API_URL env var)
    #[arg(long, env = "FLEETCTL_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short)]
    pub format: Option<output::OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect simulated agents
    #[command(subcommand)]
    Agents(AgentCommands),

    /// List live placements on an agent
    Placements {
        /// Agent name
        agent: String,
    },

    /// Submit a workload placement to an agent
    Place {
        /// Agent name
        agent: String,

        /// Workload ID
        workload: String,

        /// CPU in millicores
        #[arg(long, default_value_t = 0)]
        cpu: u64,

        /// Memory as a quantity (e.g. 512Mi, 2Gi)
        #[arg(long, default_value = "0")]
        memory: String,

        /// GPU count
        #[arg(long, default_value_t = 0)]
        gpu: u64,
    },

    /// Release a workload placement
    Release {
        /// Agent name
        agent: String,

        /// Workload ID
        workload: String,
    },
}

#[derive(Subcommand)]
pub enum AgentCommands {
    /// List all agents
    List,

    /// Show one agent
    Get {
        /// Agent name
        agent: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::Config::load()?;
    let format = config.resolve_format(cli.format)?;
    let client = client::ApiClient::new(&config.resolve_api_url(cli.api_url))?;

    match cli.command {
        Commands::Agents(agent_cmd) => match agent_cmd {
            AgentCommands::List => agents::list_agents(&client, format).await?,
            AgentCommands::Get { agent } => agents::show_agent(&client, &agent, format).await?,
        },
        Commands::Placements { agent } => {
            placements::list_placements(&client, &agent, format).await?;
        }
        Commands::Place {
            agent,
            workload,
            cpu,
            memory,
            gpu,
        } => {
            let request = client::PlacementRequest {
                workload_id: workload,
                cpu_millis: cpu,
                memory_bytes: memory,
                gpu_count: gpu,
            };
            placements::place(&client, &agent, request, format).await?;
        }
        Commands::Release { agent, workload } => {
            placements::release(&client, &agent, &workload).await?;
        }
    }

    Ok(())
}
