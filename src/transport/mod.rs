//! Outbound peer RPCs. The replica only talks to peers through `RaftTransport`, so the same core
//! runs over gRPC in production and over an in-process network in tests.
mod grpc;
mod local;
mod proto;

use crate::replica::{
    AppendEntriesReply, AppendEntriesRequest, InstallSnapshotReply, InstallSnapshotRequest, ReadIndexReply,
    ReadIndexRequest, ReplicaMetadata, RequestVoteReply, RequestVoteRequest, StartLeaderElectionReply,
    StartLeaderElectionRequest,
};

pub(crate) use grpc::GrpcTransport;
pub use local::LocalNetwork;
pub(crate) use proto::ProtoConversionError;

#[derive(Debug, thiserror::Error)]
pub(crate) enum TransportError {
    #[error("Peer is unreachable: {0}")]
    Unreachable(String),
    #[error("Peer reported a server fault: {0}")]
    ServerFault(String),
    #[error("Peer sent a malformed reply: {0}")]
    Malformed(String),
}

#[async_trait::async_trait]
pub(crate) trait RaftTransport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        peer: &ReplicaMetadata,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteReply, TransportError>;

    async fn append_entries(
        &self,
        peer: &ReplicaMetadata,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, TransportError>;

    async fn install_snapshot(
        &self,
        peer: &ReplicaMetadata,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotReply, TransportError>;

    async fn start_leader_election(
        &self,
        peer: &ReplicaMetadata,
        request: StartLeaderElectionRequest,
    ) -> Result<StartLeaderElectionReply, TransportError>;

    async fn read_index(
        &self,
        peer: &ReplicaMetadata,
        request: ReadIndexRequest,
    ) -> Result<ReadIndexReply, TransportError>;
}
