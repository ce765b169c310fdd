use crate::actor::{Callback, WeakActorClient};
use crate::commitlog::{Index, Log};
use crate::replica::configuration::{PeerConfiguration, RaftConfiguration};
use crate::replica::election::{CurrentLeader, ElectionConfig, ElectionState, ElectionStateChangeListener};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::peers::{PeerRole, ReplicaId, ReplicaInfoBlob, ReplicaMetadata};
use crate::replica::snapshot::SnapshotReceiver;
use crate::replica::state_machine_updater::StateMachineUpdaterHandle;
use crate::replica::term_index::TermIndex;
use crate::replica::write_ahead_log::{EntryPayload, WriteAheadLog, WriteAheadLogEntry};
use crate::replica::{
    ClientWriteError, ClientWriteInput, ClientWriteOutput, EntryApplied, LeaderRedirectInfo, ReadIndexError,
    ReadIndexInput, ReadIndexOutput, ReadIndexReply, ReadIndexRequest, ReplicaStatus, RpcHandlerError,
    SetConfigurationError, SetConfigurationInput, StartLeaderElectionRequest, TransferLeadershipError,
    TransferLeadershipInput,
};
use crate::server::RpcServerShutdownHandle;
use crate::transport::RaftTransport;
use std::collections::HashSet;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

pub(crate) struct ReplicaConfig<L>
where
    L: Log<WriteAheadLogEntry>,
{
    pub(crate) logger: slog::Logger,
    pub(crate) my_replica_id: ReplicaId,
    // In effect until the log says otherwise.
    pub(crate) initial_configuration: RaftConfiguration,
    pub(crate) log: L,
    pub(crate) local_state: Box<dyn PersistentLocalState>,
    pub(crate) transport: Arc<dyn RaftTransport>,
    pub(crate) state_machine_updater: StateMachineUpdaterHandle,
    pub(crate) actor_client: WeakActorClient,
    pub(crate) server_shutdown_handle: Option<RpcServerShutdownHandle>,
    pub(crate) election_config: ElectionConfig,
    pub(crate) rpc_timeout: Duration,
    pub(crate) max_entries_per_request: usize,
    pub(crate) snapshot_chunk_size: usize,
    pub(crate) pre_vote: bool,
}

/// Replica is the raft state of one member of a division. It's driven entirely by `ReplicaActor`,
/// one event at a time, and never blocks: anything slow (peer RPCs, the state machine) runs on
/// other tasks that report back as events.
///
/// The handlers are spread over a few files: client operations and the commit pipeline live here,
/// elections in `replica_election.rs`, and log replication in `replica_replication.rs`.
pub(crate) struct Replica<L>
where
    L: Log<WriteAheadLogEntry>,
{
    pub(super) logger: slog::Logger,
    pub(super) my_replica_id: ReplicaId,
    pub(super) local_state: Box<dyn PersistentLocalState>,
    pub(super) election_state: ElectionState,
    pub(super) election_config: ElectionConfig,
    pub(super) wal: WriteAheadLog<L>,
    pub(super) transport: Arc<dyn RaftTransport>,
    pub(super) state_machine_updater: StateMachineUpdaterHandle,
    pub(super) snapshot_receiver: SnapshotReceiver,
    pub(super) actor_client: WeakActorClient,
    // Dropping this stops the RPC server.
    pub(super) server_shutdown_handle: Option<RpcServerShutdownHandle>,
    pub(super) rpc_timeout: Duration,
    pub(super) max_entries_per_request: usize,
    pub(super) snapshot_chunk_size: usize,
    pub(super) pre_vote: bool,
}

impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry>,
{
    pub(crate) fn new(config: ReplicaConfig<L>) -> io::Result<(Self, ElectionStateChangeListener)> {
        let wal = WriteAheadLog::new(config.logger.clone(), config.log, config.initial_configuration)?;

        // A replica that isn't a voter (yet) only follows the log.
        let as_listener = !wal.current_configuration().is_voter(&config.my_replica_id);
        let (election_state, listener) =
            ElectionState::new(config.election_config.clone(), config.actor_client.clone(), as_listener);

        slog::info!(
            config.logger,
            "Starting replica at term {:?} with log {:?}, configuration {:?}",
            config.local_state.current_term(),
            wal.latest_entry(),
            wal.current_configuration()
        );

        let replica = Replica {
            logger: config.logger,
            my_replica_id: config.my_replica_id,
            local_state: config.local_state,
            election_state,
            election_config: config.election_config,
            wal,
            transport: config.transport,
            state_machine_updater: config.state_machine_updater,
            snapshot_receiver: SnapshotReceiver::default(),
            actor_client: config.actor_client,
            server_shutdown_handle: config.server_shutdown_handle,
            rpc_timeout: config.rpc_timeout,
            max_entries_per_request: config.max_entries_per_request,
            snapshot_chunk_size: config.snapshot_chunk_size,
            pre_vote: config.pre_vote,
        };

        Ok((replica, listener))
    }

    // ------- Client operations -------

    pub(crate) fn handle_client_write(
        &mut self,
        input: ClientWriteInput,
        callback: Callback<ClientWriteOutput, ClientWriteError>,
    ) {
        // Leader check
        match self.election_state.current_leader() {
            CurrentLeader::Me => { /* carry on */ }
            CurrentLeader::Other(leader) => {
                callback.send(Err(ClientWriteError::LeaderRedirect(leader)));
                return;
            }
            CurrentLeader::Unknown => {
                callback.send(Err(if self.is_shut_down() {
                    ClientWriteError::Shutdown
                } else {
                    ClientWriteError::NoLeader
                }));
                return;
            }
        }

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        let term = self.local_state.current_term();
        let new_entry = WriteAheadLogEntry {
            term,
            payload: EntryPayload::Application {
                invocation: input.invocation,
                data: input.data,
            },
        };
        let appended_index = match self.append_and_flush(new_entry) {
            Ok(index) => index,
            Err(e) => {
                self.handle_fatal_io_error("appending a client entry", &e);
                callback.send(Err(ClientWriteError::LocalIoError(Arc::new(e))));
                return;
            }
        };

        match self.election_state.leader_state_mut() {
            Some(leader_state) => {
                leader_state
                    .pending_requests_mut()
                    .insert(TermIndex::new(term, appended_index), callback);
                leader_state.trigger_replication();
            }
            None => callback.send(Err(ClientWriteError::NoLeader)),
        }

        // A lone voter commits on its own.
        self.try_advance_leader_commit();
    }

    pub(crate) fn handle_read_index(
        &mut self,
        input: ReadIndexInput,
        callback: Callback<ReadIndexOutput, ReadIndexError>,
    ) {
        match self.election_state.current_leader() {
            CurrentLeader::Me => self.leader_read_index(callback),
            CurrentLeader::Other(leader) if input.forward_to_leader => self.forward_read_index(leader, callback),
            CurrentLeader::Other(leader) => callback.send(Err(ReadIndexError::LeaderRedirect(leader))),
            CurrentLeader::Unknown if self.is_shut_down() => callback.send(Err(ReadIndexError::Shutdown)),
            CurrentLeader::Unknown => callback.send(Err(ReadIndexError::NoLeader)),
        }
    }

    fn leader_read_index(&mut self, callback: Callback<ReadIndexOutput, ReadIndexError>) {
        let commit_index = self.wal.commit_index();
        let configuration = self.wal.current_configuration();
        let now = Instant::now();
        let lone_voter = configuration.has_majority(|id| *id == self.my_replica_id);

        let leader_state = match self.election_state.leader_state_mut() {
            Some(leader_state) => leader_state,
            None => {
                callback.send(Err(ReadIndexError::NoLeader));
                return;
            }
        };

        // Until our no-op commits, our commit index may be behind the cluster's.
        if !leader_state.is_ready(commit_index) {
            callback.send(Err(ReadIndexError::LeaderNotReady));
            return;
        }

        if lone_voter || leader_state.is_lease_valid(configuration, &self.my_replica_id, now) {
            callback.send(Ok(ReadIndexOutput {
                read_index: commit_index,
            }));
            return;
        }

        // Confirm leadership with a round of heartbeats.
        leader_state
            .pending_reads_mut()
            .register(commit_index, now, callback);
        leader_state.trigger_replication();
    }

    fn forward_read_index(&self, leader: LeaderRedirectInfo, callback: Callback<ReadIndexOutput, ReadIndexError>) {
        let peer = self.leader_metadata(leader);
        let request = ReadIndexRequest {
            requestor_id: self.my_replica_id.clone(),
        };
        let logger = self.logger.clone();
        let transport = self.transport.clone();
        let rpc_timeout = self.rpc_timeout;

        tokio::task::spawn(async move {
            slog::debug!(logger, "ClientWire - {:?}", request);
            let rpc_reply = tokio::time::timeout(rpc_timeout, transport.read_index(&peer, request)).await;
            slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

            let result = match rpc_reply {
                Ok(Ok(ReadIndexReply {
                    success: true,
                    read_index,
                })) => Ok(ReadIndexOutput { read_index }),
                Ok(Ok(_)) => Err(ReadIndexError::LeaderUnreachable(
                    "Leader refused the read index request".to_string(),
                )),
                Ok(Err(e)) => Err(ReadIndexError::LeaderUnreachable(e.to_string())),
                Err(_timeout) => Err(ReadIndexError::LeaderUnreachable(
                    "Timed out calling ReadIndex".to_string(),
                )),
            };
            callback.send(result);
        });
    }

    pub(crate) fn handle_set_configuration(
        &mut self,
        input: SetConfigurationInput,
        callback: Callback<(), SetConfigurationError>,
    ) {
        if let Err(e) = self.check_membership_change_allowed() {
            callback.send(Err(e));
            return;
        }
        let new_peers = match validate_members(input.members) {
            Ok(peers) => peers,
            Err(e) => {
                callback.send(Err(e));
                return;
            }
        };

        // Joint consensus first: decisions need a majority of both the old and the new members
        // until the joint configuration commits.
        let joint = RaftConfiguration::new(None, new_peers, Some(self.wal.current_configuration().current().clone()));
        slog::info!(self.logger, "Starting membership change: {:?}", joint);
        let entry = WriteAheadLogEntry {
            term: self.local_state.current_term(),
            payload: EntryPayload::Configuration(joint),
        };
        if let Err(e) = self.append_and_flush(entry) {
            self.handle_fatal_io_error("appending a configuration entry", &e);
            callback.send(Err(SetConfigurationError::LocalIoError(e)));
            return;
        }

        match self.election_state.leader_state_mut() {
            Some(leader_state) => leader_state.set_pending_reconfiguration(callback),
            None => callback.send(Err(SetConfigurationError::LostLeadership)),
        }

        self.sync_leader_peers();
        if let Some(leader_state) = self.election_state.leader_state() {
            leader_state.trigger_replication();
        }
        self.try_advance_leader_commit();
    }

    fn check_membership_change_allowed(&self) -> Result<(), SetConfigurationError> {
        let leader_state = match self.election_state.current_leader() {
            CurrentLeader::Me => self
                .election_state
                .leader_state()
                .ok_or(SetConfigurationError::NoLeader)?,
            CurrentLeader::Other(leader) => return Err(SetConfigurationError::LeaderRedirect(leader)),
            CurrentLeader::Unknown if self.is_shut_down() => return Err(SetConfigurationError::Shutdown),
            CurrentLeader::Unknown => return Err(SetConfigurationError::NoLeader),
        };

        let commit_index = self.wal.commit_index();
        if leader_state.has_pending_reconfiguration() || self.wal.configurations().is_transitioning(commit_index) {
            return Err(SetConfigurationError::InProgress);
        }
        // We might not know about an uncommitted configuration from an earlier term yet.
        if !leader_state.is_ready(commit_index) {
            return Err(SetConfigurationError::InProgress);
        }

        Ok(())
    }

    pub(crate) fn handle_transfer_leadership(
        &mut self,
        input: TransferLeadershipInput,
        callback: Callback<(), TransferLeadershipError>,
    ) {
        let leader_state = match self.election_state.leader_state() {
            Some(leader_state) => leader_state,
            None => {
                callback.send(Err(TransferLeadershipError::NotLeader));
                return;
            }
        };

        let target = match self.wal.current_configuration().peer(&input.target) {
            Some(peer) if peer.is_voter() && *peer.replica_id() != self.my_replica_id => peer.clone(),
            _ => {
                callback.send(Err(TransferLeadershipError::InvalidTarget));
                return;
            }
        };

        let my_latest = self.wal.latest_entry();
        let target_matched = leader_state.peer_state(&input.target).and_then(|p| p.matched());
        if target_matched != my_latest.map(|e| e.index) {
            callback.send(Err(TransferLeadershipError::TargetNotUpToDate));
            return;
        }

        slog::info!(self.logger, "Transferring leadership to {:?}", input.target);
        let call = self.start_leader_election_call(target);
        tokio::task::spawn(async move {
            let result = match call.await {
                Ok(true) => Ok(()),
                Ok(false) => Err(TransferLeadershipError::Rejected),
                Err(message) => Err(TransferLeadershipError::TargetUnreachable(message)),
            };
            callback.send(result);
        });
    }

    /// Asks `peer` to start an election right away. Resolves to whether it agreed.
    pub(super) fn start_leader_election_call(
        &self,
        peer: ReplicaMetadata,
    ) -> impl std::future::Future<Output = Result<bool, String>> + Send + 'static {
        let logger = self.logger.clone();
        let transport = self.transport.clone();
        let rpc_timeout = self.rpc_timeout;
        let request = StartLeaderElectionRequest {
            leader_id: self.my_replica_id.clone(),
            leader_last_entry: self.wal.latest_entry(),
        };

        async move {
            slog::debug!(logger, "ClientWire - {:?}", request);
            let rpc_reply =
                tokio::time::timeout(rpc_timeout, transport.start_leader_election(&peer, request)).await;
            slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

            match rpc_reply {
                Ok(Ok(reply)) => Ok(reply.accepted),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_timeout) => Err("Timed out calling StartLeaderElection".to_string()),
            }
        }
    }

    pub(crate) fn status(&self) -> Result<ReplicaStatus, RpcHandlerError> {
        Ok(ReplicaStatus {
            my_replica_id: self.my_replica_id.clone(),
            term: self.local_state.current_term(),
            election_state: self.election_state.current_state(),
            commit_index: self.wal.commit_index(),
            applied_index: self.state_machine_updater.applied_index(),
            latest_entry: self.wal.latest_entry(),
            first_log_index: self.wal.first_index(),
            configuration: self.wal.current_configuration().clone(),
        })
    }

    // ------- Commit pipeline -------

    /// > If there exists an N such that N > commitIndex, a majority
    /// > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
    /// > set commitIndex = N (§5.3, §5.4).
    ///
    /// The majority is counted per the configuration in effect, which during a membership change
    /// means a majority of both the old and the new members.
    pub(super) fn try_advance_leader_commit(&mut self) {
        let leader_state = match self.election_state.leader_state() {
            Some(leader_state) => leader_state,
            None => return,
        };

        let my_latest = self.wal.latest_entry().map(|e| e.index);
        let tentative_new_commit_index = self
            .wal
            .current_configuration()
            .quorum_index(|id| leader_state.matched_index(id, &self.my_replica_id, my_latest));
        let tentative_new_commit_index = match tentative_new_commit_index {
            Some(index) => index,
            None => return,
        };

        match self
            .wal
            .ratchet_fwd_commit_index_if_valid(tentative_new_commit_index, self.local_state.current_term())
        {
            Ok(true) => self.on_commit_advanced(),
            Ok(false) => {}
            Err(ioe) => self.handle_fatal_io_error(
                &format!("confirming new commit index {:?}", tentative_new_commit_index),
                &ioe,
            ),
        }
    }

    /// > If commitIndex > lastApplied: increment lastApplied, apply
    /// > log[lastApplied] to state machine (§5.3)
    pub(super) fn on_commit_advanced(&mut self) {
        match self.wal.publish_committed_entries() {
            Ok(entries) => self.state_machine_updater.apply(entries),
            Err(e) => {
                self.handle_fatal_io_error("reading committed entries", &e);
                return;
            }
        }

        if self.election_state.is_leader() {
            self.advance_membership_change();
        }

        if self
            .wal
            .configurations()
            .was_removed(&self.my_replica_id, self.wal.commit_index())
        {
            self.shutdown("Removed from the committed configuration");
        }
    }

    // Called on the leader whenever the commit index moves.
    fn advance_membership_change(&mut self) {
        let commit_index = self.wal.commit_index();
        let current = self.wal.current_configuration();
        if current.log_index() > commit_index {
            return;
        }

        if current.is_joint() {
            let new_only = current.to_new_only();
            slog::info!(self.logger, "Joint configuration committed, moving to {:?}", new_only);
            let entry = WriteAheadLogEntry {
                term: self.local_state.current_term(),
                payload: EntryPayload::Configuration(new_only),
            };
            if let Err(e) = self.append_and_flush(entry) {
                self.handle_fatal_io_error("appending a configuration entry", &e);
                return;
            }

            self.sync_leader_peers();
            if let Some(leader_state) = self.election_state.leader_state() {
                leader_state.trigger_replication();
            }
            self.try_advance_leader_commit();
            return;
        }

        // Members removed by the committed configuration stop getting replicated to.
        self.sync_leader_peers();
        if let Some(callback) = self
            .election_state
            .leader_state_mut()
            .and_then(|leader_state| leader_state.take_pending_reconfiguration())
        {
            slog::info!(self.logger, "Membership change complete");
            callback.send(Ok(()));
        }
    }

    // ------- Events from the state machine updater -------

    pub(crate) fn handle_entry_applied(&mut self, input: EntryApplied) {
        if let Some(leader_state) = self.election_state.leader_state_mut() {
            leader_state
                .pending_requests_mut()
                .resolve(input.entry, input.outcome);
        }
    }

    pub(crate) fn handle_snapshot_taken(&mut self, snapshot_index: TermIndex) {
        match self.wal.compact(snapshot_index) {
            Ok(()) => slog::info!(self.logger, "Compacted log through {:?}", snapshot_index),
            Err(e) => slog::warn!(
                self.logger,
                "Failed to compact log through {:?}: {:?}",
                snapshot_index,
                e
            ),
        }
    }

    pub(crate) fn handle_state_machine_failed(&mut self, message: String) {
        slog::crit!(self.logger, "State machine failed: {}", message);
        if let Some(leader_state) = self.election_state.leader_state_mut() {
            leader_state
                .pending_requests_mut()
                .fail_all(|| ClientWriteError::StateMachineFailed(message.clone()));
        }
        self.shutdown("State machine failed");
    }

    // ------- Lifecycle -------

    pub(crate) fn shutdown(&mut self, reason: &str) {
        if self.is_shut_down() {
            return;
        }
        slog::warn!(self.logger, "Shutting down replica: {}", reason);

        if let Some(leader_state) = self.election_state.leader_state_mut() {
            leader_state
                .pending_requests_mut()
                .fail_all(|| ClientWriteError::Shutdown);
            leader_state
                .pending_reads_mut()
                .fail_all(|| ReadIndexError::Shutdown);
            if let Some(callback) = leader_state.take_pending_reconfiguration() {
                callback.send(Err(SetConfigurationError::Shutdown));
            }
        }

        self.election_state.transition_to_shutdown();
        self.snapshot_receiver.abort();
        if let Some(mut server_shutdown_handle) = self.server_shutdown_handle.take() {
            server_shutdown_handle.stop();
        }
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.election_state.is_shutdown()
    }

    // ------- Helpers shared by the handlers -------

    pub(super) fn append_and_flush(&mut self, entry: WriteAheadLogEntry) -> io::Result<Index> {
        let index = self.wal.append(entry)?;
        self.wal.flush()?;
        Ok(index)
    }

    /// Our log or term store is unusable, so we can't safely take part in the cluster anymore.
    pub(super) fn handle_fatal_io_error(&mut self, context: &str, error: &io::Error) {
        slog::crit!(self.logger, "IO failure while {}: {:?}", context, error);
        self.shutdown("Local IO failure");
    }

    /// Transitions to follower, or to listener if we don't have a vote in the current
    /// configuration.
    pub(super) fn become_follower(&mut self, leader: Option<LeaderRedirectInfo>) {
        if self.wal.current_configuration().is_voter(&self.my_replica_id) {
            self.election_state.transition_to_follower(leader);
        } else {
            self.election_state.transition_to_listener(leader);
        }
    }

    /// Promotes or demotes us after the configuration in effect changed.
    pub(super) fn refresh_role(&mut self) {
        let configuration = self.wal.current_configuration();
        let is_voter = configuration.is_voter(&self.my_replica_id);
        let is_member = configuration.contains(&self.my_replica_id);
        let leader = match self.election_state.current_leader() {
            CurrentLeader::Other(leader) => Some(leader),
            _ => None,
        };

        if self.election_state.is_listener() && is_voter {
            slog::info!(self.logger, "Promoted to voter");
            self.election_state.transition_to_follower(leader);
        } else if self.election_state.is_follower() && is_member && !is_voter {
            slog::info!(self.logger, "Demoted to listener");
            self.election_state.transition_to_listener(leader);
        }
    }

    /// Everyone the leader replicates to: members of the configuration in effect, plus members of
    /// the committed one until their removal commits.
    pub(super) fn replication_targets(&self) -> Vec<ReplicaMetadata> {
        let mut targets = self.wal.current_configuration().other_peers(&self.my_replica_id);
        let committed = self.wal.configurations().committed(self.wal.commit_index());
        for peer in committed.other_peers(&self.my_replica_id) {
            if !targets.iter().any(|t| t.replica_id() == peer.replica_id()) {
                targets.push(peer);
            }
        }

        targets
    }

    pub(super) fn sync_leader_peers(&mut self) {
        let targets = self.replication_targets();
        let latest_index = self.wal.latest_entry().map(|e| e.index);
        if let Some(leader_state) = self.election_state.leader_state_mut() {
            leader_state.sync_peers(targets, latest_index);
        }
    }

    pub(super) fn leader_redirect_info(&self, leader_id: &ReplicaId) -> LeaderRedirectInfo {
        match self.wal.current_configuration().peer(leader_id) {
            Some(metadata) => LeaderRedirectInfo::from(metadata),
            // Leader isn't in our configuration yet. We still know its name.
            None => LeaderRedirectInfo {
                replica_id: leader_id.clone(),
                ip_addr: Ipv4Addr::UNSPECIFIED,
                port: 0,
                replica_blob: ReplicaInfoBlob::new(0),
            },
        }
    }

    fn leader_metadata(&self, leader: LeaderRedirectInfo) -> ReplicaMetadata {
        match self.wal.current_configuration().peer(&leader.replica_id) {
            Some(metadata) => metadata.clone(),
            None => ReplicaMetadata::new(
                leader.replica_id,
                leader.ip_addr,
                leader.port,
                leader.replica_blob,
                0,
                PeerRole::Voter,
            ),
        }
    }

    pub(super) fn current_term(&self) -> Term {
        self.local_state.current_term()
    }
}

fn validate_members(members: Vec<ReplicaMetadata>) -> Result<PeerConfiguration, SetConfigurationError> {
    if members.is_empty() {
        return Err(SetConfigurationError::InvalidConfiguration(
            "Configuration has no members".to_string(),
        ));
    }
    if !members.iter().any(|m| m.is_voter()) {
        return Err(SetConfigurationError::InvalidConfiguration(
            "Configuration has no voters".to_string(),
        ));
    }

    let mut seen = HashSet::with_capacity(members.len());
    for member in members.iter() {
        if !seen.insert(member.replica_id().clone()) {
            return Err(SetConfigurationError::InvalidConfiguration(format!(
                "Replica {:?} is listed twice",
                member.replica_id()
            )));
        }
    }

    Ok(PeerConfiguration::new(members))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, role: PeerRole) -> ReplicaMetadata {
        ReplicaMetadata::new(ReplicaId::new(id), Ipv4Addr::LOCALHOST, 1, ReplicaInfoBlob::new(0), 0, role)
    }

    #[test]
    fn membership_validation() {
        assert!(matches!(
            validate_members(Vec::new()),
            Err(SetConfigurationError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            validate_members(vec![member("a", PeerRole::Listener)]),
            Err(SetConfigurationError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            validate_members(vec![member("a", PeerRole::Voter), member("a", PeerRole::Listener)]),
            Err(SetConfigurationError::InvalidConfiguration(_))
        ));

        let peers = validate_members(vec![member("a", PeerRole::Voter), member("b", PeerRole::Listener)]).unwrap();
        assert!(peers.is_voter(&ReplicaId::new("a")));
        assert!(peers.contains(&ReplicaId::new("b")));
        assert!(!peers.is_voter(&ReplicaId::new("b")));
    }
}
