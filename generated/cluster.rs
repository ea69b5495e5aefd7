/// Transport-agnostic message envelope. Typed payloads are serialized by the
/// application layer and carried opaquely; `kind` selects the handler table.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoEnvelope {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(enumeration = "ProtoMessageKind", tag = "2")]
    pub kind: i32,
    #[prost(string, tag = "3")]
    pub source: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub target: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "5")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
    #[prost(int64, tag = "6")]
    pub timestamp_ms: i64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoExchangeAck {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
}
/// Empty. Liveness only.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoHealthCheckReq {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoHealthCheckReply {
    #[prost(string, tag = "1")]
    pub status: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(int64, tag = "3")]
    pub timestamp_ms: i64,
}
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ProtoMessageKind {
    Unspecified = 0,
    /// Membership
    NodeJoin = 1,
    NodeLeave = 2,
    StateUpdate = 3,
    /// Partition management
    PartitionAssign = 4,
    PartitionTransfer = 5,
    PartitionSync = 6,
    /// Health
    HealthCheck = 7,
    HealthReport = 8,
    Alert = 9,
    /// Consensus
    VoteRequest = 10,
    VoteResponse = 11,
    ReplicateRequest = 12,
    ReplicateResponse = 13,
    /// Recovery
    RecoveryRequest = 14,
    RecoveryResponse = 15,
    /// Data replication
    Replicate = 16,
    ReplicateAck = 17,
}
#[doc = r" Generated client implementations."]
pub mod grpc_cluster_client {
    #![allow(unused_variables, dead_code, missing_docs)]
    use tonic::codegen::*;
    pub struct GrpcClusterClient<T> {
        inner: tonic::client::Grpc<T>,
    }
    impl GrpcClusterClient<tonic::transport::Channel> {
        #[doc = r" Attempt to create a new client by connecting to a given endpoint."]
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: std::convert::TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }
    impl<T> GrpcClusterClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::ResponseBody: Body + HttpBody + Send + 'static,
        T::Error: Into<StdError>,
        <T::ResponseBody as HttpBody>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }
        pub fn with_interceptor(inner: T, interceptor: impl Into<tonic::Interceptor>) -> Self {
            let inner = tonic::client::Grpc::with_interceptor(inner, interceptor);
            Self { inner }
        }
        #[doc = " Accept an envelope for local dispatch. The ack means accepted-for-dispatch,"]
        #[doc = " not application-level handling."]
        pub async fn exchange(
            &mut self,
            request: impl tonic::IntoRequest<super::ProtoEnvelope>,
        ) -> Result<tonic::Response<super::ProtoExchangeAck>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/cluster.GrpcCluster/Exchange");
            self.inner.unary(request.into_request(), path, codec).await
        }
        #[doc = " Process liveness only. Cluster-level health is a coordinator concern."]
        pub async fn health(
            &mut self,
            request: impl tonic::IntoRequest<super::ProtoHealthCheckReq>,
        ) -> Result<tonic::Response<super::ProtoHealthCheckReply>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/cluster.GrpcCluster/Health");
            self.inner.unary(request.into_request(), path, codec).await
        }
    }
    impl<T: Clone> Clone for GrpcClusterClient<T> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
            }
        }
    }
    impl<T> std::fmt::Debug for GrpcClusterClient<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "GrpcClusterClient {{ ... }}")
        }
    }
}
#[doc = r" Generated server implementations."]
pub mod grpc_cluster_server {
    #![allow(unused_variables, dead_code, missing_docs)]
    use tonic::codegen::*;
    #[doc = "Generated trait containing gRPC methods that should be implemented for use with GrpcClusterServer."]
    #[async_trait]
    pub trait GrpcCluster: Send + Sync + 'static {
        #[doc = " Accept an envelope for local dispatch. The ack means accepted-for-dispatch,"]
        #[doc = " not application-level handling."]
        async fn exchange(
            &self,
            request: tonic::Request<super::ProtoEnvelope>,
        ) -> Result<tonic::Response<super::ProtoExchangeAck>, tonic::Status>;
        #[doc = " Process liveness only. Cluster-level health is a coordinator concern."]
        async fn health(
            &self,
            request: tonic::Request<super::ProtoHealthCheckReq>,
        ) -> Result<tonic::Response<super::ProtoHealthCheckReply>, tonic::Status>;
    }
    #[derive(Debug)]
    pub struct GrpcClusterServer<T: GrpcCluster> {
        inner: _Inner<T>,
    }
    struct _Inner<T>(Arc<T>, Option<tonic::Interceptor>);
    impl<T: GrpcCluster> GrpcClusterServer<T> {
        pub fn new(inner: T) -> Self {
            let inner = Arc::new(inner);
            let inner = _Inner(inner, None);
            Self { inner }
        }
        pub fn with_interceptor(inner: T, interceptor: impl Into<tonic::Interceptor>) -> Self {
            let inner = Arc::new(inner);
            let inner = _Inner(inner, Some(interceptor.into()));
            Self { inner }
        }
    }
    impl<T, B> Service<http::Request<B>> for GrpcClusterServer<T>
    where
        T: GrpcCluster,
        B: HttpBody + Send + Sync + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = Never;
        type Future = BoxFuture<Self::Response, Self::Error>;
        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            let inner = self.inner.clone();
            match req.uri().path() {
                "/cluster.GrpcCluster/Exchange" => {
                    #[allow(non_camel_case_types)]
                    struct ExchangeSvc<T: GrpcCluster>(pub Arc<T>);
                    impl<T: GrpcCluster> tonic::server::UnaryService<super::ProtoEnvelope> for ExchangeSvc<T> {
                        type Response = super::ProtoExchangeAck;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProtoEnvelope>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).exchange(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = ExchangeSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/cluster.GrpcCluster/Health" => {
                    #[allow(non_camel_case_types)]
                    struct HealthSvc<T: GrpcCluster>(pub Arc<T>);
                    impl<T: GrpcCluster> tonic::server::UnaryService<super::ProtoHealthCheckReq> for HealthSvc<T> {
                        type Response = super::ProtoHealthCheckReply;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProtoHealthCheckReq>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).health(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = HealthSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                _ => Box::pin(async move {
                    Ok(http::Response::builder()
                        .status(200)
                        .header("grpc-status", "12")
                        .header("content-type", "application/grpc")
                        .body(tonic::body::BoxBody::empty())
                        .unwrap())
                }),
            }
        }
    }
    impl<T: GrpcCluster> Clone for GrpcClusterServer<T> {
        fn clone(&self) -> Self {
            let inner = self.inner.clone();
            Self { inner }
        }
    }
    impl<T: GrpcCluster> Clone for _Inner<T> {
        fn clone(&self) -> Self {
            Self(self.0.clone(), self.1.clone())
        }
    }
    impl<T: std::fmt::Debug> std::fmt::Debug for _Inner<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }
    impl<T: GrpcCluster> tonic::transport::NamedService for GrpcClusterServer<T> {
        const NAME: &'static str = "cluster.GrpcCluster";
    }
}
