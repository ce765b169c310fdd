/// Term 0 and index 0 together mean "no entry".
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoTermIndex {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, tag = "2")]
    pub index: u64,
}
// ------- RequestVote -------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequestVoteReq {
    #[prost(string, tag = "1")]
    pub client_node_id: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(message, optional, tag = "3")]
    pub last_log_entry: ::core::option::Option<ProtoTermIndex>,
    #[prost(bool, tag = "4")]
    pub pre_vote: bool,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequestVoteResult {
    #[prost(oneof = "proto_request_vote_result::Result", tags = "1, 2")]
    pub result: ::core::option::Option<proto_request_vote_result::Result>,
}
/// Nested message and enum types in `ProtoRequestVoteResult`.
pub mod proto_request_vote_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "1")]
        Ok(super::ProtoRequestVoteSuccess),
        #[prost(message, tag = "2")]
        Err(super::ProtoServerFault),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequestVoteSuccess {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(bool, tag = "2")]
    pub vote_granted: bool,
    #[prost(bool, tag = "3")]
    pub should_shutdown: bool,
    #[prost(message, optional, tag = "4")]
    pub last_log_entry: ::core::option::Option<ProtoTermIndex>,
}
// ------- AppendEntries -------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntriesReq {
    #[prost(string, tag = "1")]
    pub client_node_id: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(message, optional, tag = "3")]
    pub previous_log_entry: ::core::option::Option<ProtoTermIndex>,
    #[prost(uint64, tag = "4")]
    pub commit_index: u64,
    /// Each entry is a serialized write-ahead-log entry.
    #[prost(bytes = "vec", repeated, tag = "5")]
    pub new_entries: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    #[prost(uint64, tag = "6")]
    pub call_id: u64,
    #[prost(bool, tag = "7")]
    pub is_heartbeat: bool,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntriesResult {
    #[prost(oneof = "proto_append_entries_result::Result", tags = "1, 2")]
    pub result: ::core::option::Option<proto_append_entries_result::Result>,
}
/// Nested message and enum types in `ProtoAppendEntriesResult`.
pub mod proto_append_entries_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "1")]
        Ok(super::ProtoAppendEntriesSuccess),
        #[prost(message, tag = "2")]
        Err(super::ProtoServerFault),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntriesSuccess {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, tag = "2")]
    pub next_index: u64,
    #[prost(uint64, tag = "3")]
    pub match_index: u64,
    #[prost(uint64, tag = "4")]
    pub follower_commit: u64,
    #[prost(uint64, tag = "5")]
    pub call_id: u64,
    #[prost(bool, tag = "6")]
    pub is_heartbeat: bool,
    #[prost(oneof = "proto_append_entries_success::Outcome", tags = "7, 8, 9")]
    pub outcome: ::core::option::Option<proto_append_entries_success::Outcome>,
}
/// Nested message and enum types in `ProtoAppendEntriesSuccess`.
pub mod proto_append_entries_success {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Outcome {
        #[prost(message, tag = "7")]
        Appended(super::ProtoAppended),
        #[prost(message, tag = "8")]
        NotLeader(super::ProtoNotLeader),
        #[prost(message, tag = "9")]
        Inconsistency(super::ProtoInconsistency),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppended {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoNotLeader {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInconsistency {}
// ------- InstallSnapshot -------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshotReq {
    #[prost(string, tag = "1")]
    pub client_node_id: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(message, optional, tag = "3")]
    pub last_included: ::core::option::Option<ProtoTermIndex>,
    /// Serialized raft configuration as of `last_included`.
    #[prost(bytes = "vec", tag = "4")]
    pub configuration: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint32, tag = "5")]
    pub request_index: u32,
    #[prost(bytes = "vec", tag = "6")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "7")]
    pub done: bool,
    /// Serialized client invocations applied through `last_included`. Only on the first chunk.
    #[prost(bytes = "vec", tag = "8")]
    pub applied_invocations: ::prost::alloc::vec::Vec<u8>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshotResult {
    #[prost(oneof = "proto_install_snapshot_result::Result", tags = "1, 2")]
    pub result: ::core::option::Option<proto_install_snapshot_result::Result>,
}
/// Nested message and enum types in `ProtoInstallSnapshotResult`.
pub mod proto_install_snapshot_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "1")]
        Ok(super::ProtoInstallSnapshotSuccess),
        #[prost(message, tag = "2")]
        Err(super::ProtoServerFault),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshotSuccess {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint32, tag = "2")]
    pub request_index: u32,
    #[prost(uint64, tag = "3")]
    pub snapshot_index: u64,
    #[prost(
        oneof = "proto_install_snapshot_success::Outcome",
        tags = "4, 5, 6, 7, 8"
    )]
    pub outcome: ::core::option::Option<proto_install_snapshot_success::Outcome>,
}
/// Nested message and enum types in `ProtoInstallSnapshotSuccess`.
pub mod proto_install_snapshot_success {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Outcome {
        #[prost(message, tag = "4")]
        ChunkAccepted(super::ProtoChunkAccepted),
        #[prost(message, tag = "5")]
        SnapshotInstalled(super::ProtoSnapshotInstalled),
        #[prost(message, tag = "6")]
        AlreadyInstalled(super::ProtoAlreadyInstalled),
        #[prost(message, tag = "7")]
        NotLeader(super::ProtoNotLeader),
        #[prost(message, tag = "8")]
        Rejected(super::ProtoSnapshotRejected),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoChunkAccepted {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoSnapshotInstalled {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAlreadyInstalled {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoSnapshotRejected {
    #[prost(string, tag = "1")]
    pub message: ::prost::alloc::string::String,
}
// ------- StartLeaderElection -------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoStartLeaderElectionReq {
    #[prost(string, tag = "1")]
    pub client_node_id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub leader_last_entry: ::core::option::Option<ProtoTermIndex>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoStartLeaderElectionResult {
    #[prost(oneof = "proto_start_leader_election_result::Result", tags = "1, 2")]
    pub result: ::core::option::Option<proto_start_leader_election_result::Result>,
}
/// Nested message and enum types in `ProtoStartLeaderElectionResult`.
pub mod proto_start_leader_election_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "1")]
        Ok(super::ProtoStartLeaderElectionSuccess),
        #[prost(message, tag = "2")]
        Err(super::ProtoServerFault),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoStartLeaderElectionSuccess {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
}
// ------- ReadIndex -------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoReadIndexReq {
    #[prost(string, tag = "1")]
    pub client_node_id: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoReadIndexResult {
    #[prost(oneof = "proto_read_index_result::Result", tags = "1, 2")]
    pub result: ::core::option::Option<proto_read_index_result::Result>,
}
/// Nested message and enum types in `ProtoReadIndexResult`.
pub mod proto_read_index_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "1")]
        Ok(super::ProtoReadIndexSuccess),
        #[prost(message, tag = "2")]
        Err(super::ProtoServerFault),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoReadIndexSuccess {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(uint64, tag = "2")]
    pub read_index: u64,
}
// ------- Common -------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoServerFault {
    #[prost(string, tag = "1")]
    pub message: ::prost::alloc::string::String,
}
#[doc = r" Generated client implementations."]
pub mod grpc_raft_client {
    #![allow(unused_variables, dead_code, missing_docs)]
    use tonic::codegen::*;
    #[doc = " GrpcRaft is the peer-to-peer RPC surface of a single raft division."]
    pub struct GrpcRaftClient<T> {
        inner: tonic::client::Grpc<T>,
    }
    impl GrpcRaftClient<tonic::transport::Channel> {
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
    impl<T> GrpcRaftClient<T>
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
        pub async fn request_vote(
            &mut self,
            request: impl tonic::IntoRequest<super::ProtoRequestVoteReq>,
        ) -> Result<tonic::Response<super::ProtoRequestVoteResult>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/raft.GrpcRaft/RequestVote");
            self.inner.unary(request.into_request(), path, codec).await
        }
        pub async fn append_entries(
            &mut self,
            request: impl tonic::IntoRequest<super::ProtoAppendEntriesReq>,
        ) -> Result<tonic::Response<super::ProtoAppendEntriesResult>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/raft.GrpcRaft/AppendEntries");
            self.inner.unary(request.into_request(), path, codec).await
        }
        pub async fn install_snapshot(
            &mut self,
            request: impl tonic::IntoRequest<super::ProtoInstallSnapshotReq>,
        ) -> Result<tonic::Response<super::ProtoInstallSnapshotResult>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/raft.GrpcRaft/InstallSnapshot");
            self.inner.unary(request.into_request(), path, codec).await
        }
        pub async fn start_leader_election(
            &mut self,
            request: impl tonic::IntoRequest<super::ProtoStartLeaderElectionReq>,
        ) -> Result<tonic::Response<super::ProtoStartLeaderElectionResult>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/raft.GrpcRaft/StartLeaderElection");
            self.inner.unary(request.into_request(), path, codec).await
        }
        pub async fn read_index(
            &mut self,
            request: impl tonic::IntoRequest<super::ProtoReadIndexReq>,
        ) -> Result<tonic::Response<super::ProtoReadIndexResult>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/raft.GrpcRaft/ReadIndex");
            self.inner.unary(request.into_request(), path, codec).await
        }
    }
    impl<T: Clone> Clone for GrpcRaftClient<T> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
            }
        }
    }
    impl<T> std::fmt::Debug for GrpcRaftClient<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "GrpcRaftClient {{ ... }}")
        }
    }
}
#[doc = r" Generated server implementations."]
pub mod grpc_raft_server {
    #![allow(unused_variables, dead_code, missing_docs)]
    use tonic::codegen::*;
    #[doc = "Generated trait containing gRPC methods that should be implemented for use with GrpcRaftServer."]
    #[async_trait]
    pub trait GrpcRaft: Send + Sync + 'static {
        async fn request_vote(
            &self,
            request: tonic::Request<super::ProtoRequestVoteReq>,
        ) -> Result<tonic::Response<super::ProtoRequestVoteResult>, tonic::Status>;
        async fn append_entries(
            &self,
            request: tonic::Request<super::ProtoAppendEntriesReq>,
        ) -> Result<tonic::Response<super::ProtoAppendEntriesResult>, tonic::Status>;
        async fn install_snapshot(
            &self,
            request: tonic::Request<super::ProtoInstallSnapshotReq>,
        ) -> Result<tonic::Response<super::ProtoInstallSnapshotResult>, tonic::Status>;
        async fn start_leader_election(
            &self,
            request: tonic::Request<super::ProtoStartLeaderElectionReq>,
        ) -> Result<tonic::Response<super::ProtoStartLeaderElectionResult>, tonic::Status>;
        async fn read_index(
            &self,
            request: tonic::Request<super::ProtoReadIndexReq>,
        ) -> Result<tonic::Response<super::ProtoReadIndexResult>, tonic::Status>;
    }
    #[doc = " GrpcRaft is the peer-to-peer RPC surface of a single raft division."]
    #[derive(Debug)]
    pub struct GrpcRaftServer<T: GrpcRaft> {
        inner: _Inner<T>,
    }
    struct _Inner<T>(Arc<T>, Option<tonic::Interceptor>);
    impl<T: GrpcRaft> GrpcRaftServer<T> {
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
    impl<T, B> Service<http::Request<B>> for GrpcRaftServer<T>
    where
        T: GrpcRaft,
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
                "/raft.GrpcRaft/RequestVote" => {
                    #[allow(non_camel_case_types)]
                    struct RequestVoteSvc<T: GrpcRaft>(pub Arc<T>);
                    impl<T: GrpcRaft> tonic::server::UnaryService<super::ProtoRequestVoteReq> for RequestVoteSvc<T> {
                        type Response = super::ProtoRequestVoteResult;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProtoRequestVoteReq>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).request_vote(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = RequestVoteSvc(inner);
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
                "/raft.GrpcRaft/AppendEntries" => {
                    #[allow(non_camel_case_types)]
                    struct AppendEntriesSvc<T: GrpcRaft>(pub Arc<T>);
                    impl<T: GrpcRaft> tonic::server::UnaryService<super::ProtoAppendEntriesReq>
                        for AppendEntriesSvc<T>
                    {
                        type Response = super::ProtoAppendEntriesResult;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProtoAppendEntriesReq>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).append_entries(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = AppendEntriesSvc(inner);
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
                "/raft.GrpcRaft/InstallSnapshot" => {
                    #[allow(non_camel_case_types)]
                    struct InstallSnapshotSvc<T: GrpcRaft>(pub Arc<T>);
                    impl<T: GrpcRaft> tonic::server::UnaryService<super::ProtoInstallSnapshotReq>
                        for InstallSnapshotSvc<T>
                    {
                        type Response = super::ProtoInstallSnapshotResult;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProtoInstallSnapshotReq>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).install_snapshot(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = InstallSnapshotSvc(inner);
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
                "/raft.GrpcRaft/StartLeaderElection" => {
                    #[allow(non_camel_case_types)]
                    struct StartLeaderElectionSvc<T: GrpcRaft>(pub Arc<T>);
                    impl<T: GrpcRaft>
                        tonic::server::UnaryService<super::ProtoStartLeaderElectionReq>
                        for StartLeaderElectionSvc<T>
                    {
                        type Response = super::ProtoStartLeaderElectionResult;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProtoStartLeaderElectionReq>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).start_leader_election(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = StartLeaderElectionSvc(inner);
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
                "/raft.GrpcRaft/ReadIndex" => {
                    #[allow(non_camel_case_types)]
                    struct ReadIndexSvc<T: GrpcRaft>(pub Arc<T>);
                    impl<T: GrpcRaft> tonic::server::UnaryService<super::ProtoReadIndexReq> for ReadIndexSvc<T> {
                        type Response = super::ProtoReadIndexResult;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProtoReadIndexReq>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).read_index(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = ReadIndexSvc(inner);
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
    impl<T: GrpcRaft> Clone for GrpcRaftServer<T> {
        fn clone(&self) -> Self {
            let inner = self.inner.clone();
            Self { inner }
        }
    }
    impl<T: GrpcRaft> Clone for _Inner<T> {
        fn clone(&self) -> Self {
            Self(self.0.clone(), self.1.clone())
        }
    }
    impl<T: std::fmt::Debug> std::fmt::Debug for _Inner<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }
    impl<T: GrpcRaft> tonic::transport::NamedService for GrpcRaftServer<T> {
        const NAME: &'static str = "raft.GrpcRaft";
    }
}
