use crate::actor::{ActorClient, ReplicaActor};
use crate::api::client::RaftClient;
use crate::api::event_bus::RaftEventListener;
use crate::api::options::{RaftOptions, RaftOptionsValidated};
use crate::api::replicated_log::ReplicatedLog;
use crate::api::state_machine::StateMachine;
use crate::api::types::RaftMemberInfo;
use crate::commitlog::Log;
use crate::replica::{
    ElectionConfig, FileLocalState, PeerConfiguration, PersistentLocalState, RaftConfiguration, Replica,
    ReplicaConfig, ReplicaId, ReplicaMetadata, RetryCache, StateMachineUpdaterHandle, VolatileLocalState,
    WriteAheadLogEntry,
};
use crate::server::{self, RpcServer, RpcServerShutdownHandle};
use crate::transport::{GrpcTransport, LocalNetwork, RaftTransport};
use std::collections::HashSet;
use std::convert::TryFrom;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

const ACTOR_QUEUE_SIZE: usize = 64;

pub struct RaftClientConfig {
    pub my_replica_id: String,
    /// The configuration to start with, until the log says otherwise. A replica that's going to be
    /// added to an existing cluster should start with the cluster's current members, without itself.
    pub cluster_members: Vec<RaftMemberInfo>,
    pub transport: RaftTransportConfig,
    /// Where term and vote are persisted. `None` keeps them in memory, which is only safe if this
    /// replica never restarts.
    ///
    /// Term and vote must be exactly as durable as the log passed to `try_create_raft_client()`.
    /// A replica that comes back with its term but without the log entries it acknowledged can
    /// elect a leader missing committed entries. Pair an `InMemoryLog` with `None` here.
    pub local_state_directory: Option<PathBuf>,
    pub info_logger: slog::Logger,
    pub options: RaftOptions,
}

pub enum RaftTransportConfig {
    /// Serve and call peers over gRPC.
    Grpc { listen_addr: SocketAddr },
    /// Talk to replicas in the same process.
    Local(LocalNetwork),
}

#[derive(Debug, thiserror::Error)]
pub enum RaftClientCreationError {
    #[error("Invalid cluster info: {0}")]
    InvalidClusterInfo(String),
    #[error("Illegal options for configuring client: {0}")]
    IllegalClientOptions(String),
    #[error("Log initialization failure")]
    LogInitialization(io::Error),
    #[error("Local state initialization failure")]
    LocalStateInitialization(io::Error),
}

/// Starts a raft division replica (actor, timers, state machine updater and, for gRPC, the server)
/// and returns the application's handle to it. Must be called within a tokio runtime.
///
/// `log` is the division's log storage. A non-empty log is picked up where it left off: its
/// configuration entries take effect again and its entries are re-applied to `state_machine`
/// once the leader confirms they're committed.
pub async fn try_create_raft_client<M, L>(
    config: RaftClientConfig,
    log: L,
    state_machine: M,
) -> Result<RaftClient, RaftClientCreationError>
where
    M: StateMachine,
    L: Log<WriteAheadLogEntry>,
{
    let options = RaftOptionsValidated::try_from(config.options)
        .map_err(|e| RaftClientCreationError::IllegalClientOptions(e.to_string()))?;

    let my_replica_id = ReplicaId::new(config.my_replica_id);
    let logger = config.info_logger;
    let initial_configuration = initial_configuration(config.cluster_members)?;

    let local_state = create_local_state(config.local_state_directory, &my_replica_id)
        .map_err(RaftClientCreationError::LocalStateInitialization)?;

    let (actor_client, actor_queue_rx) = ActorClient::new(ACTOR_QUEUE_SIZE);

    let retry_cache = Arc::new(RetryCache::new(options.retry_cache_expiry));
    tokio::spawn(evict_retry_cache_periodically(
        Arc::downgrade(&retry_cache),
        options.retry_cache_expiry,
    ));

    let state_machine_updater = StateMachineUpdaterHandle::spawn(
        logger.new(slog::o!("Task" => "StateMachineUpdater")),
        state_machine,
        initial_configuration.clone(),
        options.snapshot_auto_trigger_threshold,
        retry_cache.clone(),
        actor_client.weak(),
    );

    let (transport, server_shutdown_handle) =
        create_transport(&logger, config.transport, &my_replica_id, &actor_client);

    let (replica, election_state_change_listener) = Replica::new(ReplicaConfig {
        logger: logger.clone(),
        my_replica_id: my_replica_id.clone(),
        initial_configuration,
        log,
        local_state,
        transport,
        state_machine_updater: state_machine_updater.clone(),
        actor_client: actor_client.weak(),
        server_shutdown_handle,
        election_config: ElectionConfig {
            my_replica_id,
            leader_heartbeat_duration: options.leader_heartbeat_duration,
            follower_min_timeout: options.follower_min_timeout,
            follower_max_timeout: options.follower_max_timeout,
            leader_lease_duration: options.leader_lease_duration(),
        },
        rpc_timeout: options.leader_append_entries_timeout,
        max_entries_per_request: options.max_entries_per_append_entries,
        snapshot_chunk_size: options.snapshot_chunk_size,
        pre_vote: options.pre_vote,
    })
    .map_err(RaftClientCreationError::LogInitialization)?;

    let replica_actor = ReplicaActor::new(logger, actor_queue_rx, replica);
    tokio::spawn(replica_actor.run_event_loop());

    Ok(RaftClient {
        replicated_log: ReplicatedLog::new(actor_client.clone(), retry_cache, state_machine_updater),
        event_listener: RaftEventListener::new(election_state_change_listener),
        actor_client,
    })
}

fn initial_configuration(members: Vec<RaftMemberInfo>) -> Result<RaftConfiguration, RaftClientCreationError> {
    let members: Vec<ReplicaMetadata> = members.into_iter().map(ReplicaMetadata::from).collect();

    let mut seen = HashSet::with_capacity(members.len());
    for member in members.iter() {
        if !seen.insert(member.replica_id().clone()) {
            return Err(RaftClientCreationError::InvalidClusterInfo(format!(
                "Replica {:?} is listed twice",
                member.replica_id()
            )));
        }
    }
    if !members.iter().any(|m| m.is_voter()) {
        return Err(RaftClientCreationError::InvalidClusterInfo(
            "Cluster must have at least one voter".to_string(),
        ));
    }

    Ok(RaftConfiguration::new_stable(None, PeerConfiguration::new(members)))
}

fn create_local_state(
    directory: Option<PathBuf>,
    my_replica_id: &ReplicaId,
) -> io::Result<Box<dyn PersistentLocalState>> {
    match directory {
        None => Ok(Box::new(VolatileLocalState::new(my_replica_id.clone()))),
        Some(directory) => {
            std::fs::create_dir_all(&directory)?;
            let path = directory.join(format!("{}.local_state", my_replica_id.as_str()));
            Ok(Box::new(FileLocalState::open(path, my_replica_id.clone())?))
        }
    }
}

fn create_transport(
    logger: &slog::Logger,
    transport_config: RaftTransportConfig,
    my_replica_id: &ReplicaId,
    actor_client: &ActorClient,
) -> (Arc<dyn RaftTransport>, Option<RpcServerShutdownHandle>) {
    match transport_config {
        RaftTransportConfig::Grpc { listen_addr } => {
            let (server_shutdown_handle, server_shutdown_signal) = server::shutdown_signal();
            let rpc_server = RpcServer::new(logger.new(slog::o!("Task" => "RpcServer")), actor_client.weak());
            tokio::spawn(rpc_server.run(listen_addr, server_shutdown_signal));

            let transport = GrpcTransport::new(logger.clone());
            (Arc::new(transport), Some(server_shutdown_handle))
        }
        RaftTransportConfig::Local(network) => {
            network.register(my_replica_id.clone(), actor_client.weak());
            (Arc::new(network.transport_for(my_replica_id.clone())), None)
        }
    }
}

// Stops once the division is gone.
async fn evict_retry_cache_periodically(retry_cache: Weak<RetryCache>, expiry: tokio::time::Duration) {
    let mut interval = tokio::time::interval(expiry);
    loop {
        interval.tick().await;
        match retry_cache.upgrade() {
            Some(retry_cache) => retry_cache.evict_expired(),
            None => return,
        }
    }
}
