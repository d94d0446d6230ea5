//! gRPC control-plane client with optional mTLS
//!
//! One lazily connected channel is shared by every agent in the fleet, so the
//! per-agent cost of a call is a single HTTP/2 stream.

use super::{async_trait, ControlPlane, ControlPlaneError, RegistrationAck};
use crate::models::{AgentIdentity, NodeCondition, StatusSnapshot};
use crate::profile::ResourceProfile;
use crate::proto::{self, ControlPlaneServiceClient};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::Code;
use tracing::info;

/// Configuration for the gRPC client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Control-plane endpoint URL (e.g., "https://control-plane:8443")
    pub endpoint: String,
    /// CA certificate for server verification; TLS is disabled when unset
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate for mTLS
    pub client_cert_path: Option<PathBuf>,
    /// Client private key
    pub client_key_path: Option<PathBuf>,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Transport-level request timeout
    pub request_timeout: Duration,
    /// Keepalive interval
    pub keepalive_interval: Duration,
    /// Keepalive timeout
    pub keepalive_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://control-plane:9090".to_string(),
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// Extract domain name from endpoint URL
    fn domain(&self) -> Result<String> {
        let url = url::Url::parse(&self.endpoint)
            .with_context(|| format!("Invalid endpoint URL: {}", self.endpoint))?;
        url.host_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("No host in endpoint URL"))
    }

    /// Load TLS configuration from certificate files
    async fn load_tls_config(&self) -> Result<Option<ClientTlsConfig>> {
        let Some(ca_path) = &self.ca_cert_path else {
            return Ok(None);
        };

        let ca_cert = tokio::fs::read(ca_path)
            .await
            .with_context(|| format!("Failed to read CA certificate from {:?}", ca_path))?;
        let mut tls_config = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(ca_cert))
            .domain_name(self.domain()?);

        match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = tokio::fs::read(cert_path).await.with_context(|| {
                    format!("Failed to read client certificate from {:?}", cert_path)
                })?;
                let key = tokio::fs::read(key_path)
                    .await
                    .with_context(|| format!("Failed to read client key from {:?}", key_path))?;
                tls_config = tls_config.identity(Identity::from_pem(cert, key));
            }
            (None, None) => {}
            _ => anyhow::bail!("client certificate and key must be configured together"),
        }

        Ok(Some(tls_config))
    }
}

/// gRPC implementation of [`ControlPlane`]
#[derive(Debug, Clone)]
pub struct GrpcControlPlane {
    endpoint: String,
    channel: Channel,
}

impl GrpcControlPlane {
    /// Build the shared channel. No connection is made until the first call.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let mut endpoint = Endpoint::from_shared(config.endpoint.clone())
            .with_context(|| format!("Invalid endpoint URL: {}", config.endpoint))?
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .http2_keep_alive_interval(config.keepalive_interval)
            .keep_alive_timeout(config.keepalive_timeout)
            .keep_alive_while_idle(true);

        if let Some(tls_config) = config.load_tls_config().await? {
            endpoint = endpoint
                .tls_config(tls_config)
                .context("Failed to apply TLS configuration")?;
        }

        info!(endpoint = %config.endpoint, "Control plane client configured");

        Ok(Self {
            endpoint: config.endpoint,
            channel: endpoint.connect_lazy(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn client(&self) -> ControlPlaneServiceClient<Channel> {
        ControlPlaneServiceClient::new(self.channel.clone())
    }
}

#[async_trait]
impl ControlPlane for GrpcControlPlane {
    async fn register_agent(
        &self,
        identity: &AgentIdentity,
        profile: &ResourceProfile,
    ) -> Result<RegistrationAck, ControlPlaneError> {
        let request = proto::RegisterAgentRequest {
            agent: Some(agent_ref(identity)),
            capacity: to_proto_map(profile.capacity().to_resource_list()),
            allocatable: to_proto_map(profile.allocatable().to_resource_list()),
            pod_cidr: profile.pod_address_range().to_string(),
        };

        let response = self
            .client()
            .register_agent(request)
            .await
            .map_err(map_status)?;

        Ok(RegistrationAck {
            lease_version: response.into_inner().lease_version,
        })
    }

    async fn renew_lease(
        &self,
        identity: &AgentIdentity,
        last_known_version: u64,
    ) -> Result<u64, ControlPlaneError> {
        let request = proto::RenewLeaseRequest {
            agent: Some(agent_ref(identity)),
            last_known_version,
            renew_time: Some(to_timestamp(Utc::now())),
        };

        let response = self
            .client()
            .renew_lease(request)
            .await
            .map_err(map_status)?;

        Ok(response.into_inner().new_version)
    }

    async fn publish_status(
        &self,
        identity: &AgentIdentity,
        snapshot: &StatusSnapshot,
    ) -> Result<(), ControlPlaneError> {
        let request = proto::PublishStatusRequest {
            agent: Some(agent_ref(identity)),
            conditions: snapshot.conditions.iter().map(to_proto_condition).collect(),
            capacity: to_proto_map(snapshot.capacity.to_resource_list()),
            allocatable: to_proto_map(snapshot.allocatable.to_resource_list()),
            observed_generation: snapshot.observed_generation,
            pod_cidr: snapshot.pod_cidr.clone(),
            generated_at: Some(to_timestamp(snapshot.generated_at)),
        };

        self.client()
            .publish_status(request)
            .await
            .map_err(map_status)?;

        Ok(())
    }

    async fn deregister(&self, identity: &AgentIdentity) -> Result<(), ControlPlaneError> {
        let request = proto::DeregisterRequest {
            agent: Some(agent_ref(identity)),
        };

        self.client()
            .deregister(request)
            .await
            .map_err(map_status)?;

        Ok(())
    }
}

/// Map a gRPC status onto the control-plane error taxonomy
fn map_status(status: tonic::Status) -> ControlPlaneError {
    let message = status.message().to_string();
    match status.code() {
        Code::AlreadyExists | Code::Aborted | Code::FailedPrecondition => {
            ControlPlaneError::Conflict(message)
        }
        Code::NotFound => ControlPlaneError::NotFound(message),
        Code::InvalidArgument | Code::OutOfRange => ControlPlaneError::Invalid(message),
        Code::ResourceExhausted => ControlPlaneError::Throttled(message),
        Code::DeadlineExceeded | Code::Cancelled => {
            ControlPlaneError::Unavailable(format!("deadline exceeded: {}", message))
        }
        _ => ControlPlaneError::Unavailable(format!("{:?}: {}", status.code(), message)),
    }
}

fn agent_ref(identity: &AgentIdentity) -> proto::AgentRef {
    proto::AgentRef {
        name: identity.name.clone(),
        uid: identity.uid.clone(),
        generation: identity.generation,
    }
}

fn to_proto_map<I: IntoIterator<Item = (String, u64)>>(list: I) -> HashMap<String, u64> {
    list.into_iter().collect()
}

fn to_timestamp(time: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: time.timestamp(),
        nanos: time.timestamp_subsec_nanos() as i32,
    }
}

fn to_proto_condition(condition: &NodeCondition) -> proto::NodeCondition {
    proto::NodeCondition {
        r#type: condition.condition_type.as_str().to_string(),
        status: condition.status.as_str().to_string(),
        reason: condition.reason.clone(),
        message: condition.message.clone(),
        last_transition_time: Some(to_timestamp(condition.last_transition_time)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.ca_cert_path.is_none());
    }

    #[test]
    fn test_domain_from_endpoint() {
        let config = ClientConfig {
            endpoint: "https://test:8443".to_string(),
            ..Default::default()
        };
        assert_eq!(config.domain().unwrap(), "test");
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status(tonic::Status::aborted("lease version mismatch")),
            ControlPlaneError::Conflict(_)
        ));
        assert!(matches!(
            map_status(tonic::Status::not_found("node")),
            ControlPlaneError::NotFound(_)
        ));
        assert!(matches!(
            map_status(tonic::Status::resource_exhausted("slow down")),
            ControlPlaneError::Throttled(_)
        ));
        assert!(matches!(
            map_status(tonic::Status::unavailable("connection refused")),
            ControlPlaneError::Unavailable(_)
        ));
        assert!(matches!(
            map_status(tonic::Status::invalid_argument("bad cidr")),
            ControlPlaneError::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn test_connect_is_lazy() {
        let client = GrpcControlPlane::connect(ClientConfig {
            endpoint: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(client.endpoint(), "http://127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_missing_ca_file_is_an_error() {
        let result = GrpcControlPlane::connect(ClientConfig {
            endpoint: "https://control-plane:8443".to_string(),
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.crt")),
            ..Default::default()
        })
        .await;
        assert!(result.is_err());
    }
}
