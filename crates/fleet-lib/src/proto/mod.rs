//! Generated protobuf code
//!
//! With the `proto-gen` feature the bindings are generated at build time by
//! tonic-build from `proto/simulator/v1/control_plane.proto`. Without it the
//! checked-in equivalents below are used, so a build does not need protoc.

#[cfg(feature = "proto-gen")]
pub mod simulator {
    pub mod v1 {
        tonic::include_proto!("simulator.v1");
    }
}

#[cfg(not(feature = "proto-gen"))]
pub mod simulator {
    pub mod v1 {
        use prost::Message;
        use std::collections::HashMap;

        #[derive(Clone, PartialEq, Message)]
        pub struct AgentRef {
            #[prost(string, tag = "1")]
            pub name: String,
            #[prost(string, tag = "2")]
            pub uid: String,
            #[prost(uint64, tag = "3")]
            pub generation: u64,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct RegisterAgentRequest {
            #[prost(message, optional, tag = "1")]
            pub agent: Option<AgentRef>,
            #[prost(map = "string, uint64", tag = "2")]
            pub capacity: HashMap<String, u64>,
            #[prost(map = "string, uint64", tag = "3")]
            pub allocatable: HashMap<String, u64>,
            #[prost(string, tag = "4")]
            pub pod_cidr: String,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct RegisterAgentResponse {
            #[prost(uint64, tag = "1")]
            pub lease_version: u64,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct RenewLeaseRequest {
            #[prost(message, optional, tag = "1")]
            pub agent: Option<AgentRef>,
            #[prost(uint64, tag = "2")]
            pub last_known_version: u64,
            #[prost(message, optional, tag = "3")]
            pub renew_time: Option<prost_types::Timestamp>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct RenewLeaseResponse {
            #[prost(uint64, tag = "1")]
            pub new_version: u64,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct NodeCondition {
            #[prost(string, tag = "1")]
            pub r#type: String,
            #[prost(string, tag = "2")]
            pub status: String,
            #[prost(string, tag = "3")]
            pub reason: String,
            #[prost(string, tag = "4")]
            pub message: String,
            #[prost(message, optional, tag = "5")]
            pub last_transition_time: Option<prost_types::Timestamp>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct PublishStatusRequest {
            #[prost(message, optional, tag = "1")]
            pub agent: Option<AgentRef>,
            #[prost(message, repeated, tag = "2")]
            pub conditions: Vec<NodeCondition>,
            #[prost(map = "string, uint64", tag = "3")]
            pub capacity: HashMap<String, u64>,
            #[prost(map = "string, uint64", tag = "4")]
            pub allocatable: HashMap<String, u64>,
            #[prost(uint64, tag = "5")]
            pub observed_generation: u64,
            #[prost(string, tag = "6")]
            pub pod_cidr: String,
            #[prost(message, optional, tag = "7")]
            pub generated_at: Option<prost_types::Timestamp>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct PublishStatusResponse {}

        #[derive(Clone, PartialEq, Message)]
        pub struct DeregisterRequest {
            #[prost(message, optional, tag = "1")]
            pub agent: Option<AgentRef>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct DeregisterResponse {}

        pub mod control_plane_service_client {
            use super::*;
            use tonic::codegen::*;

            #[derive(Debug, Clone)]
            pub struct ControlPlaneServiceClient<T> {
                inner: tonic::client::Grpc<T>,
            }

            impl ControlPlaneServiceClient<tonic::transport::Channel> {
                pub fn new(channel: tonic::transport::Channel) -> Self {
                    let inner = tonic::client::Grpc::new(channel);
                    Self { inner }
                }
            }

            impl<T> ControlPlaneServiceClient<T>
            where
                T: tonic::client::GrpcService<tonic::body::BoxBody>,
                T::Error: Into<StdError>,
                T::ResponseBody: Body<Data = Bytes> + Send + 'static,
                <T::ResponseBody as Body>::Error: Into<StdError> + Send,
            {
                async fn ready(&mut self) -> Result<(), tonic::Status> {
                    self.inner.ready().await.map_err(|e| {
                        tonic::Status::new(
                            tonic::Code::Unknown,
                            format!("Service was not ready: {}", e.into()),
                        )
                    })
                }

                pub async fn register_agent(
                    &mut self,
                    request: impl tonic::IntoRequest<RegisterAgentRequest>,
                ) -> Result<tonic::Response<RegisterAgentResponse>, tonic::Status> {
                    self.ready().await?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path = http::uri::PathAndQuery::from_static(
                        "/simulator.v1.ControlPlaneService/RegisterAgent",
                    );
                    self.inner.unary(request.into_request(), path, codec).await
                }

                pub async fn renew_lease(
                    &mut self,
                    request: impl tonic::IntoRequest<RenewLeaseRequest>,
                ) -> Result<tonic::Response<RenewLeaseResponse>, tonic::Status> {
                    self.ready().await?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path = http::uri::PathAndQuery::from_static(
                        "/simulator.v1.ControlPlaneService/RenewLease",
                    );
                    self.inner.unary(request.into_request(), path, codec).await
                }

                pub async fn publish_status(
                    &mut self,
                    request: impl tonic::IntoRequest<PublishStatusRequest>,
                ) -> Result<tonic::Response<PublishStatusResponse>, tonic::Status> {
                    self.ready().await?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path = http::uri::PathAndQuery::from_static(
                        "/simulator.v1.ControlPlaneService/PublishStatus",
                    );
                    self.inner.unary(request.into_request(), path, codec).await
                }

                pub async fn deregister(
                    &mut self,
                    request: impl tonic::IntoRequest<DeregisterRequest>,
                ) -> Result<tonic::Response<DeregisterResponse>, tonic::Status> {
                    self.ready().await?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path = http::uri::PathAndQuery::from_static(
                        "/simulator.v1.ControlPlaneService/Deregister",
                    );
                    self.inner.unary(request.into_request(), path, codec).await
                }
            }
        }
    }
}

pub use simulator::v1::control_plane_service_client::ControlPlaneServiceClient;
pub use simulator::v1::*;
