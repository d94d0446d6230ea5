//! API client for the hollow fleet daemon

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// API client for the fleet daemon
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            anyhow::bail!(api_error(response).await);
        }

        response.json().await.context("Failed to parse response")
    }

    /// Make a DELETE request, expecting no body
    pub async fn delete(&self, path: &str) -> Result<()> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .delete(url)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            anyhow::bail!(api_error(response).await);
        }

        Ok(())
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentSummary>> {
        self.get("api/v1/agents").await
    }

    pub async fn get_agent(&self, agent: &str) -> Result<AgentSummary> {
        self.get(&format!("api/v1/agents/{}", agent)).await
    }

    pub async fn list_placements(&self, agent: &str) -> Result<Vec<AdmissionRecord>> {
        self.get(&format!("api/v1/agents/{}/placements", agent))
            .await
    }

    /// Submit a placement. A 409 carries a rejection decision and is not an error.
    pub async fn submit_placement(
        &self,
        agent: &str,
        request: &PlacementRequest,
    ) -> Result<PlacementDecision> {
        let path = format!("api/v1/agents/{}/placements", agent);
        let url = self.base_url.join(&path).context("Invalid path")?;

        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        if status.is_success() || status == StatusCode::CONFLICT {
            return response.json().await.context("Failed to parse response");
        }

        anyhow::bail!(api_error(response).await)
    }

    pub async fn release_placement(&self, agent: &str, workload: &str) -> Result<()> {
        self.delete(&format!("api/v1/agents/{}/placements/{}", agent, workload))
            .await
    }
}

async fn api_error(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => format!("API error ({}): {}", status, parsed.error),
        Err(_) => format!("API error ({}): {}", status, body),
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub gpu_count: u64,
    pub pods: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub name: String,
    pub state: String,
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

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(default)]
    pub cpu_millis: u64,
    #[serde(default)]
    pub memory_bytes: u64,
    #[serde(default)]
    pub gpu_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionRecord {
    pub workload_id: String,
    pub requested: ResourceRequest,
    pub admitted_at: DateTime<Utc>,
}

/// Body of a placement request. Memory is sent as a quantity string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub workload_id: String,
    pub cpu_millis: u64,
    pub memory_bytes: String,
    pub gpu_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    Insufficient {
        resource: String,
        requested: u64,
        used: u64,
        allocatable: u64,
    },
    AgentUnavailable {
        state: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PlacementDecision {
    Admitted { record: AdmissionRecord },
    Rejected { reason: RejectionReason },
}
