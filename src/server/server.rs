use crate::actor::WeakActorClient;
use crate::grpc::grpc_raft_server::{GrpcRaft, GrpcRaftServer};
use crate::grpc::{
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoInstallSnapshotReq, ProtoInstallSnapshotResult,
    ProtoReadIndexReq, ProtoReadIndexResult, ProtoRequestVoteReq, ProtoRequestVoteResult,
    ProtoStartLeaderElectionReq, ProtoStartLeaderElectionResult,
};
use crate::replica::{
    AppendEntriesRequest, InstallSnapshotRequest, ReadIndexReply, RequestVoteRequest, StartLeaderElectionRequest,
};
use crate::server::RpcServerShutdownSignal;
use crate::transport::ProtoConversionError;
use std::convert::TryFrom;
use std::net::SocketAddr;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// RpcServer is the type that implements the Raft gRPC interface. It only translates between
/// proto and replica types; every request is handled by the replica actor.
pub(crate) struct RpcServer {
    logger: slog::Logger,
    local_replica: WeakActorClient,
}

impl RpcServer {
    pub(crate) fn new(logger: slog::Logger, local_replica: WeakActorClient) -> Self {
        RpcServer { logger, local_replica }
    }

    pub(crate) async fn run(self, socket_addr: SocketAddr, shutdown_signal: RpcServerShutdownSignal) {
        let logger = self.logger.clone();
        slog::info!(logger, "Listening on '{:?}'", socket_addr);

        let result = Server::builder()
            .add_service(GrpcRaftServer::new(self))
            .serve_with_shutdown(socket_addr, shutdown_signal.wait())
            .await;

        slog::info!(logger, "Server run() has exited: {:?}", result);
    }

    async fn handle_request_vote(&self, rpc_request: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status> {
        let app_input = RequestVoteRequest::try_from(rpc_request).map_err(invalid_argument)?;
        let app_result = self.local_replica.request_vote(app_input).await;
        Ok(ProtoRequestVoteResult::from(app_result))
    }

    async fn handle_append_entries(
        &self,
        rpc_request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResult, Status> {
        let app_input = AppendEntriesRequest::try_from(rpc_request).map_err(invalid_argument)?;
        let app_result = self.local_replica.append_entries(app_input).await;
        Ok(ProtoAppendEntriesResult::from(app_result))
    }

    async fn handle_install_snapshot(
        &self,
        rpc_request: ProtoInstallSnapshotReq,
    ) -> Result<ProtoInstallSnapshotResult, Status> {
        let app_input = InstallSnapshotRequest::try_from(rpc_request).map_err(invalid_argument)?;
        let app_result = self.local_replica.install_snapshot(app_input).await;
        Ok(ProtoInstallSnapshotResult::from(app_result))
    }

    async fn handle_start_leader_election(
        &self,
        rpc_request: ProtoStartLeaderElectionReq,
    ) -> Result<ProtoStartLeaderElectionResult, Status> {
        let app_input = StartLeaderElectionRequest::try_from(rpc_request).map_err(invalid_argument)?;
        let app_result = self.local_replica.start_leader_election(app_input).await;
        Ok(ProtoStartLeaderElectionResult::from(app_result))
    }

    async fn handle_read_index(&self, _rpc_request: ProtoReadIndexReq) -> Result<ProtoReadIndexResult, Status> {
        let app_result = self.local_replica.read_index().await;
        if let Err(e) = &app_result {
            slog::debug!(self.logger, "Read index for peer failed: {:?}", e);
        }
        Ok(ProtoReadIndexResult::from(ReadIndexReply::from(app_result)))
    }
}

fn invalid_argument(error: ProtoConversionError) -> Status {
    Status::invalid_argument(error.to_string())
}

#[async_trait::async_trait]
impl GrpcRaft for RpcServer {
    async fn request_vote(
        &self,
        rpc_request_wrapped: Request<ProtoRequestVoteReq>,
    ) -> Result<Response<ProtoRequestVoteResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_request_vote(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn append_entries(
        &self,
        rpc_request_wrapped: Request<ProtoAppendEntriesReq>,
    ) -> Result<Response<ProtoAppendEntriesResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_append_entries(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn install_snapshot(
        &self,
        rpc_request_wrapped: Request<ProtoInstallSnapshotReq>,
    ) -> Result<Response<ProtoInstallSnapshotResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        // Chunks can be big. Only log what they're about.
        slog::debug!(
            self.logger,
            "ServerWire - InstallSnapshot chunk {} ({} bytes, done: {})",
            rpc_request.request_index,
            rpc_request.data.len(),
            rpc_request.done
        );
        let rpc_result = self.handle_install_snapshot(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn start_leader_election(
        &self,
        rpc_request_wrapped: Request<ProtoStartLeaderElectionReq>,
    ) -> Result<Response<ProtoStartLeaderElectionResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_start_leader_election(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn read_index(
        &self,
        rpc_request_wrapped: Request<ProtoReadIndexReq>,
    ) -> Result<Response<ProtoReadIndexResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_read_index(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }
}
