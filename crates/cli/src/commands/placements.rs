//! Placement submission and release commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::{AdmissionRecord, ApiClient, PlacementDecision, PlacementRequest, RejectionReason};
use crate::output::{
    format_bytes, format_cpu, format_timestamp, print_json, print_success, print_table,
    print_warning, OutputFormat,
};

/// Row for the placements table
#[derive(Tabled)]
struct PlacementRow {
    #[tabled(rename = "Workload")]
    workload: String,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "Memory")]
    memory: String,
    #[tabled(rename = "GPU")]
    gpu: u64,
    #[tabled(rename = "Admitted")]
    admitted_at: String,
}

pub(crate) fn print_records(records: &[AdmissionRecord]) {
    let rows = records
        .iter()
        .map(|r| PlacementRow {
            workload: r.workload_id.clone(),
            cpu: format_cpu(r.requested.cpu_millis),
            memory: format_bytes(r.requested.memory_bytes),
            gpu: r.requested.gpu_count,
            admitted_at: format_timestamp(Some(&r.admitted_at)),
        })
        .collect();
    print_table(rows);
}

pub fn describe_rejection(reason: &RejectionReason) -> String {
    match reason {
        RejectionReason::Insufficient {
            resource,
            requested,
            used,
            allocatable,
        } => format!(
            "insufficient {}: requested {}, used {} of {}",
            resource, requested, used, allocatable
        ),
        RejectionReason::AgentUnavailable { state } => {
            format!("agent unavailable (state {})", state)
        }
    }
}

/// List live placements on an agent
pub async fn list_placements(client: &ApiClient, agent: &str, format: OutputFormat) -> Result<()> {
    let records = client.list_placements(agent).await?;
    match format {
        OutputFormat::Json => print_json(&records)?,
        OutputFormat::Table => print_records(&records),
    }
    Ok(())
}

/// Submit a placement. A rejection is reported but is not a failure.
pub async fn place(
    client: &ApiClient,
    agent: &str,
    request: PlacementRequest,
    format: OutputFormat,
) -> Result<()> {
    let decision = client.submit_placement(agent, &request).await?;

    if format == OutputFormat::Json {
        return print_json(&decision);
    }

    match decision {
        PlacementDecision::Admitted { record } => print_success(&format!(
            "Workload {} admitted on {} at {}",
            record.workload_id,
            agent,
            format_timestamp(Some(&record.admitted_at))
        )),
        PlacementDecision::Rejected { reason } => print_warning(&format!(
            "Workload {} rejected by {}: {}",
            request.workload_id,
            agent,
            describe_rejection(&reason)
        )),
    }

    Ok(())
}

/// Release a placement; releasing an unknown workload is not an error
pub async fn release(client: &ApiClient, agent: &str, workload: &str) -> Result<()> {
    client.release_placement(agent, workload).await?;
    print_success(&format!("Workload {} released from {}", workload, agent));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_rejection() {
        let reason = RejectionReason::Insufficient {
            resource: "cpu".to_string(),
            requested: 600,
            used: 500,
            allocatable: 1000,
        };
        assert_eq!(
            describe_rejection(&reason),
            "insufficient cpu: requested 600, used 500 of 1000"
        );

        let reason = RejectionReason::AgentUnavailable {
            state: "terminating".to_string(),
        };
        assert!(describe_rejection(&reason).contains("terminating"));
    }
}
