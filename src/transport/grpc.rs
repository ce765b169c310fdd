use crate::grpc::grpc_raft_client::GrpcRaftClient;
use crate::grpc::{
    ProtoAppendEntriesReq, ProtoInstallSnapshotReq, ProtoReadIndexReq, ProtoRequestVoteReq,
    ProtoStartLeaderElectionReq,
};
use crate::replica::{
    AppendEntriesReply, AppendEntriesRequest, InstallSnapshotReply, InstallSnapshotRequest, ReadIndexReply,
    ReadIndexRequest, ReplicaId, ReplicaMetadata, RequestVoteReply, RequestVoteRequest, StartLeaderElectionReply,
    StartLeaderElectionRequest,
};
use crate::transport::{RaftTransport, TransportError};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::Mutex;
use tonic::codegen::http::uri;
use tonic::transport::{Channel, Endpoint};

/// GrpcTransport calls peers over tonic. One lazily connected channel is kept per peer, so a peer
/// that's down doesn't stop us from starting up, and reconnects happen on the next call.
pub(crate) struct GrpcTransport {
    logger: slog::Logger,
    clients: Mutex<HashMap<ReplicaId, GrpcRaftClient<Channel>>>,
}

impl GrpcTransport {
    pub(crate) fn new(logger: slog::Logger) -> Self {
        GrpcTransport {
            logger,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, peer: &ReplicaMetadata) -> Result<GrpcRaftClient<Channel>, TransportError> {
        let mut clients = self.clients.lock().expect("GrpcTransport.client() mutex guard poison");
        if let Some(client) = clients.get(peer.replica_id()) {
            return Ok(client.clone());
        }

        let client = Self::connect_lazy(peer).map_err(|e| {
            slog::warn!(self.logger, "Failed to create client for {:?}: {:?}", peer.replica_id(), e);
            TransportError::Unreachable(format!("{:?}", e))
        })?;
        clients.insert(peer.replica_id().clone(), client.clone());

        Ok(client)
    }

    fn connect_lazy(peer: &ReplicaMetadata) -> Result<GrpcRaftClient<Channel>, ConnectError> {
        let ip_octets = peer.ip_addr().octets();
        let url = format!(
            "http://{}.{}.{}.{}:{}",
            ip_octets[0],
            ip_octets[1],
            ip_octets[2],
            ip_octets[3],
            peer.port()
        );
        let endpoint = Endpoint::from_shared(url)?;
        let channel = endpoint.connect_lazy()?;

        Ok(GrpcRaftClient::new(channel))
    }
}

#[derive(Debug)]
enum ConnectError {
    InvalidUri(uri::InvalidUri),
    ConnectFailure(tonic::transport::Error),
}

impl From<uri::InvalidUri> for ConnectError {
    fn from(e: uri::InvalidUri) -> Self {
        ConnectError::InvalidUri(e)
    }
}

impl From<tonic::transport::Error> for ConnectError {
    fn from(e: tonic::transport::Error) -> Self {
        ConnectError::ConnectFailure(e)
    }
}

fn status_to_error(status: tonic::Status) -> TransportError {
    TransportError::Unreachable(format!("{:?}", status))
}

#[async_trait::async_trait]
impl RaftTransport for GrpcTransport {
    async fn request_vote(
        &self,
        peer: &ReplicaMetadata,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteReply, TransportError> {
        let mut client = self.client(peer)?;
        let reply = client
            .request_vote(ProtoRequestVoteReq::from(request))
            .await
            .map_err(status_to_error)?;
        RequestVoteReply::try_from(reply.into_inner())
    }

    async fn append_entries(
        &self,
        peer: &ReplicaMetadata,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, TransportError> {
        let mut client = self.client(peer)?;
        let reply = client
            .append_entries(ProtoAppendEntriesReq::from(request))
            .await
            .map_err(status_to_error)?;
        AppendEntriesReply::try_from(reply.into_inner())
    }

    async fn install_snapshot(
        &self,
        peer: &ReplicaMetadata,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotReply, TransportError> {
        let mut client = self.client(peer)?;
        let reply = client
            .install_snapshot(ProtoInstallSnapshotReq::from(request))
            .await
            .map_err(status_to_error)?;
        InstallSnapshotReply::try_from(reply.into_inner())
    }

    async fn start_leader_election(
        &self,
        peer: &ReplicaMetadata,
        request: StartLeaderElectionRequest,
    ) -> Result<StartLeaderElectionReply, TransportError> {
        let mut client = self.client(peer)?;
        let reply = client
            .start_leader_election(ProtoStartLeaderElectionReq::from(request))
            .await
            .map_err(status_to_error)?;
        StartLeaderElectionReply::try_from(reply.into_inner())
    }

    async fn read_index(
        &self,
        peer: &ReplicaMetadata,
        request: ReadIndexRequest,
    ) -> Result<ReadIndexReply, TransportError> {
        let mut client = self.client(peer)?;
        let reply = client
            .read_index(ProtoReadIndexReq::from(request))
            .await
            .map_err(status_to_error)?;
        ReadIndexReply::try_from(reply.into_inner())
    }
}
