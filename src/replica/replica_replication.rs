use crate::actor::{Callback, WeakActorClient};
use crate::commitlog::{Index, Log};
use crate::replica::election::PeerStateUpdate;
use crate::replica::local_state::Term;
use crate::replica::peers::{ReplicaId, ReplicaMetadata};
use crate::replica::replica::Replica;
use crate::replica::snapshot::{snapshot_reply, ReceiveOutcome, SnapshotTransfer};
use crate::replica::term_index::TermIndex;
use crate::replica::write_ahead_log::WriteAheadLogEntry;
use crate::replica::{
    AppendEntriesOutcome, AppendEntriesReply, AppendEntriesReplyFromPeer, AppendEntriesReplyFromPeerDescriptor,
    AppendEntriesRequest, InstallSnapshotOutcome, InstallSnapshotReply, InstallSnapshotReplyFromPeer,
    InstallSnapshotRequest, LeaderTimerTick, RpcHandlerError, SnapshotInstalledLocally,
};
use crate::transport::RaftTransport;
use std::collections::HashSet;
use std::sync::Arc;
use std::{cmp, io};
use tokio::time::{Duration, Instant};

impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry>,
{
    // ------- Follower side -------

    pub(crate) fn server_handle_append_entries(
        &mut self,
        input: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, RpcHandlerError> {
        if self.is_shut_down() {
            return Err(RpcHandlerError::Shutdown);
        }

        // 1. Reply false if term < currentTerm (§5.1)
        let current_term = self.current_term();
        if input.leader_term < current_term {
            return Ok(self.append_entries_reply(&input, None, AppendEntriesOutcome::NotLeader));
        }

        self.observe_leader(&input.leader_id, input.leader_term)?;

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        if let Some(previous_log_entry) = input.previous_log_entry {
            if !self
                .log_contains(previous_log_entry)
                .map_err(RpcHandlerError::LocalIoError)?
            {
                let mut reply = self.append_entries_reply(&input, None, AppendEntriesOutcome::Inconsistency);
                // Tell the leader where to look next, so it doesn't have to walk back one entry at
                // a time over a long gap.
                reply.next_index = cmp::min(self.wal.next_index(), previous_log_entry.index);
                return Ok(reply);
            }
        }

        // 3. If [my] existing entry conflicts with [leader's new entries]
        // (same index but different terms), delete [my] existing entry and
        // all that follow it (§5.3)
        // 4. Append any new entries not already in the log
        let previous_index_u64 = input.previous_log_entry.map_or(0, |e| e.index.as_u64());
        let index_of_last_new_entry = Index::from_u64_or_none(previous_index_u64 + input.entries.len() as u64);
        let mut next_entry_index = Index::new(previous_index_u64 + 1);
        // Everything before this is in our snapshot, hence committed and already matching.
        let first_index = self.wal.first_index();

        for new_entry in input.entries.iter() {
            let entry_index = next_entry_index;
            next_entry_index = next_entry_index.plus(1);
            if entry_index < first_index {
                continue;
            }

            match self
                .wal
                .term_at(entry_index)
                .map_err(RpcHandlerError::LocalIoError)?
            {
                // 4. (no-op)
                Some(existing_term) if existing_term == new_entry.term => continue,
                // 3. (delete)
                Some(_) => self
                    .wal
                    .truncate(entry_index)
                    .map_err(RpcHandlerError::LocalIoError)?,
                None => {}
            }

            // 4. (append)
            let appended_index = self
                .wal
                .append(new_entry.clone())
                .map_err(RpcHandlerError::LocalIoError)?;
            if appended_index != entry_index {
                return Err(RpcHandlerError::LocalIoError(io::Error::new(
                    io::ErrorKind::Other,
                    format!(
                        "Appended log entry to {:?}, expected {:?}",
                        appended_index, entry_index
                    ),
                )));
            }
        }
        self.wal.flush().map_err(RpcHandlerError::LocalIoError)?;

        // A configuration entry takes effect as soon as it's in our log.
        self.refresh_role();

        // 5. If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        if let (Some(leader_commit_index), Some(index_of_last_new_entry)) =
            (input.leader_commit_index, index_of_last_new_entry)
        {
            let new_commit_index = cmp::min(leader_commit_index, index_of_last_new_entry);
            if self.wal.ratchet_fwd_commit_index_if_changed(new_commit_index) {
                self.on_commit_advanced();
            }
        }

        Ok(self.append_entries_reply(&input, index_of_last_new_entry, AppendEntriesOutcome::Success))
    }

    fn append_entries_reply(
        &self,
        input: &AppendEntriesRequest,
        match_index: Option<Index>,
        outcome: AppendEntriesOutcome,
    ) -> AppendEntriesReply {
        AppendEntriesReply {
            term: self.current_term(),
            next_index: self.wal.next_index(),
            match_index,
            follower_commit: self.wal.commit_index(),
            call_id: input.call_id,
            is_heartbeat: input.is_heartbeat,
            outcome,
        }
    }

    fn log_contains(&self, entry: TermIndex) -> io::Result<bool> {
        if let Some(snapshot) = self.wal.snapshot_last_included() {
            if entry.index <= snapshot.index {
                return Ok(true);
            }
        }

        Ok(self.wal.term_at(entry.index)? == Some(entry.term))
    }

    /// Common to every request from a leader whose term is at least ours.
    fn observe_leader(&mut self, leader_id: &ReplicaId, leader_term: Term) -> Result<(), RpcHandlerError> {
        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = self
            .local_state
            .store_term_if_increased(leader_term)
            .map_err(RpcHandlerError::LocalIoError)?;
        let leader = self.leader_redirect_info(leader_id);

        if increased || self.election_state.is_candidate() {
            self.become_follower(Some(leader.clone()));
            slog::info!(
                self.logger,
                "Heard from leader {:?} for term {:?}. Election state: {:?}",
                leader_id,
                leader_term,
                self.election_state
            );
        } else if self.election_state.is_leader() {
            slog::error!(
                self.logger,
                "Another leader {:?} claims our term {:?}. This should be impossible.",
                leader_id,
                leader_term
            );
        }

        self.election_state
            .record_leader_contact(&leader, Instant::now());
        self.election_state.reset_timeout_if_follower();
        Ok(())
    }

    pub(crate) fn server_handle_install_snapshot(
        &mut self,
        input: InstallSnapshotRequest,
        callback: Callback<InstallSnapshotReply, RpcHandlerError>,
    ) {
        if self.is_shut_down() {
            callback.send(Err(RpcHandlerError::Shutdown));
            return;
        }

        let current_term = self.current_term();
        if input.leader_term < current_term {
            callback.send(Ok(snapshot_reply(
                current_term,
                input.request_index,
                None,
                InstallSnapshotOutcome::NotLeader,
            )));
            return;
        }

        if let Err(e) = self.observe_leader(&input.leader_id, input.leader_term) {
            callback.send(Err(e));
            return;
        }
        let term = self.current_term();

        let last_included = input.last_included;
        let already_installed = match self.wal.term_at(last_included.index) {
            Ok(existing_term) => {
                existing_term == Some(last_included.term)
                    || matches!(self.wal.commit_index(), Some(ci) if ci >= last_included.index)
            }
            Err(e) => {
                callback.send(Err(RpcHandlerError::LocalIoError(e)));
                return;
            }
        };
        if already_installed {
            self.snapshot_receiver.abort();
            callback.send(Ok(snapshot_reply(
                term,
                input.request_index,
                Some(last_included.index),
                InstallSnapshotOutcome::AlreadyInstalled,
            )));
            return;
        }

        let request_index = input.request_index;
        match self.snapshot_receiver.receive(input) {
            ReceiveOutcome::Accepted => callback.send(Ok(snapshot_reply(
                term,
                request_index,
                None,
                InstallSnapshotOutcome::ChunkAccepted,
            ))),
            ReceiveOutcome::OutOfOrder { expected } => callback.send(Ok(snapshot_reply(
                term,
                request_index,
                None,
                InstallSnapshotOutcome::Rejected(format!("Expected chunk {} but got {}", expected, request_index)),
            ))),
            ReceiveOutcome::Complete(snapshot) => {
                slog::info!(
                    self.logger,
                    "Received full snapshot through {:?}. Installing.",
                    snapshot.last_included
                );
                // Replied to once the state machine has it.
                self.state_machine_updater
                    .install_snapshot(Arc::new(snapshot), term, request_index, callback);
            }
        }
    }

    pub(crate) fn handle_snapshot_installed_locally(&mut self, input: SnapshotInstalledLocally) {
        let term = self.current_term();
        let last_included = input.snapshot.last_included;

        if let Err(message) = input.result {
            slog::warn!(self.logger, "Failed to install snapshot through {:?}: {}", last_included, message);
            input.callback.send(Ok(snapshot_reply(
                term,
                input.request_index,
                None,
                InstallSnapshotOutcome::Rejected(message),
            )));
            return;
        }

        if let Err(e) = self.wal.reset_to_snapshot(&input.snapshot) {
            self.handle_fatal_io_error("resetting the log to a snapshot", &e);
            input.callback.send(Err(RpcHandlerError::LocalIoError(e)));
            return;
        }
        if term != input.leader_term {
            slog::info!(
                self.logger,
                "Term moved from {:?} to {:?} while installing snapshot",
                input.leader_term,
                term
            );
        }

        slog::info!(self.logger, "Log now starts after snapshot {:?}", last_included);
        self.refresh_role();
        input.callback.send(Ok(snapshot_reply(
            term,
            input.request_index,
            Some(last_included.index),
            InstallSnapshotOutcome::SnapshotInstalled,
        )));
    }

    // ------- Leader side -------

    pub(crate) fn handle_leader_timer(&mut self, input: LeaderTimerTick) {
        let current_term = self.current_term();
        if current_term != input.term {
            slog::warn!(
                self.logger,
                "Received leader heartbeat for outdated term {:?}, current term: {:?}",
                input.term,
                current_term
            );
            return;
        }

        match self.try_handle_leader_timer_for_peer(&input.peer_id, current_term) {
            Ok(_) => {}
            Err(HandleLeaderTimerError::NoLongerLeader) => {
                slog::info!(self.logger, "Received leader timer event but no longer leader.")
            }
            Err(HandleLeaderTimerError::LostMajority) => {
                slog::warn!(
                    self.logger,
                    "Haven't heard from a majority for a whole election timeout. Stepping down."
                );
                self.become_follower(None);
            }
            Err(HandleLeaderTimerError::PeerConcurrencyThrottle) => {
                slog::debug!(self.logger, "Too many outstanding requests to peer {:?}", input.peer_id)
            }
            Err(HandleLeaderTimerError::SnapshotUnavailable(index)) => {
                slog::error!(
                    self.logger,
                    "Peer {:?} needs entry {:?}, which is compacted, but we have no snapshot to send.",
                    input.peer_id,
                    index
                );
            }
            Err(HandleLeaderTimerError::DiskRead(index, ioe)) => {
                slog::error!(self.logger, "Failed to read log entry at index {:?}: {:?}", index, ioe);
            }
            Err(HandleLeaderTimerError::UnexpectedMissingLogEntry(index)) => {
                slog::error!(
                    self.logger,
                    "Wtf! LeaderStateTracker is tracking index {:?}, but entry is missing from log.",
                    index
                );
            }
            Err(HandleLeaderTimerError::LeaderStateMissingPeer {
                leader_state_tracker_peers,
            }) => {
                slog::info!(
                    self.logger,
                    "Peer {:?} is no longer tracked, probably removed by a membership change. Tracked peers: [{:?}]",
                    input.peer_id,
                    leader_state_tracker_peers,
                )
            }
        }
    }

    fn try_handle_leader_timer_for_peer(
        &mut self,
        peer_id: &ReplicaId,
        current_term: Term,
    ) -> Result<(), HandleLeaderTimerError> {
        let configuration = self.wal.current_configuration();
        let leader_state = self
            .election_state
            .leader_state_mut()
            .ok_or(HandleLeaderTimerError::NoLongerLeader)?;

        if leader_state.has_lost_majority(configuration, &self.my_replica_id, Instant::now()) {
            return Err(HandleLeaderTimerError::LostMajority);
        }

        let tracked_peers = leader_state.peer_ids();
        let peer_state = match leader_state.peer_state_mut(peer_id) {
            Some(ps) => ps,
            None => {
                return Err(HandleLeaderTimerError::LeaderStateMissingPeer {
                    leader_state_tracker_peers: tracked_peers,
                })
            }
        };

        // The entries this peer needs next were compacted away. Only a snapshot will do.
        let (next_index, _) = peer_state.next_and_previous_log_index();
        if peer_state.snapshot_in_progress().is_none() && next_index < self.wal.first_index() {
            let snapshot = self
                .state_machine_updater
                .latest_snapshot()
                .ok_or(HandleLeaderTimerError::SnapshotUnavailable(next_index))?;
            peer_state.start_snapshot(snapshot.last_included.index);

            let transfer = SnapshotTransfer {
                logger: self.logger.clone(),
                transport: self.transport.clone(),
                peer: peer_state.metadata().clone(),
                my_replica_id: self.my_replica_id.clone(),
                term: current_term,
                snapshot,
                chunk_size: self.snapshot_chunk_size,
                rpc_timeout: self.rpc_timeout,
                actor_client: self.actor_client.clone(),
            };
            tokio::task::spawn(transfer.run());
        }

        let (request, descriptor) = leader_timer_handler::new_append_entries_request(
            current_term,
            self.my_replica_id.clone(),
            peer_state,
            &self.wal,
            self.max_entries_per_request,
        )?;

        let logger = self
            .logger
            .new(slog::o!("Peer" => format!("{:?}", peer_id), "SeqNo" => descriptor.seq_no));
        tokio::task::spawn(call_peer_append_entries(
            logger,
            self.transport.clone(),
            peer_state.metadata().clone(),
            request,
            self.rpc_timeout,
            self.actor_client.clone(),
            descriptor,
        ));

        peer_state.reset_heartbeat_timer();

        Ok(())
    }

    pub(crate) fn handle_append_entries_reply_from_peer(&mut self, reply: AppendEntriesReplyFromPeer) {
        let descriptor = reply.descriptor;
        let logger = self
            .logger
            .new(slog::o!("Peer" => format!("{:?}", descriptor.peer_id), "SeqNo" => descriptor.seq_no));
        slog::debug!(logger, "AE reply from peer result: {:?}", reply.result);

        let current_term = self.current_term();
        if current_term != descriptor.term {
            slog::info!(
                logger,
                "Received AE reply for outdated term {:?}, but we're on term {:?}",
                descriptor.term,
                current_term
            );
            return;
        }

        // 1. Check for stale term rejection
        let (peer_log_update, acked) = match &reply.result {
            Err(err_msg) => {
                slog::warn!(logger, "AE failure: {}", err_msg);
                (PeerStateUpdate::OtherError, false)
            }
            Ok(ae_reply) if ae_reply.term > current_term => {
                slog::warn!(logger, "Rejected by peer because my term is stale.");
                match self.local_state.store_term_if_increased(ae_reply.term) {
                    Ok(true) => {
                        self.become_follower(None);
                        slog::info!(logger, "Transitioned to follower.");
                        return;
                    }
                    Ok(false) => (PeerStateUpdate::OtherError, false),
                    Err(e) => {
                        self.handle_fatal_io_error("storing a newer term", &e);
                        return;
                    }
                }
            }
            Ok(ae_reply) => match ae_reply.outcome {
                AppendEntriesOutcome::Success => {
                    let previous_index_u64 = descriptor.previous_log_entry.map_or(0, |e| e.index.as_u64());
                    let update = PeerStateUpdate::Success {
                        match_index: Index::from_u64_or_none(previous_index_u64 + descriptor.num_log_entries as u64),
                    };
                    (update, true)
                }
                AppendEntriesOutcome::Inconsistency => {
                    slog::info!(logger, "Peer is missing previous log entry");
                    let update = PeerStateUpdate::PeerLogBehind {
                        next_index_hint: ae_reply.next_index,
                    };
                    (update, true)
                }
                AppendEntriesOutcome::NotLeader => {
                    slog::warn!(logger, "This should not happen (unless peer has bug). Peer rejected our term without a newer one.");
                    (PeerStateUpdate::OtherError, false)
                }
            },
        };

        let my_latest_index = self.wal.latest_entry().map(|e| e.index);
        let configuration = self.wal.current_configuration();
        let leader_state = match self.election_state.leader_state_mut() {
            Some(leader_state) => leader_state,
            None => {
                slog::info!(logger, "No longer leader");
                return;
            }
        };

        // An answer in our term, successful or not, proves the peer still follows us.
        if acked {
            leader_state.pending_reads_mut().record_ack(
                &descriptor.peer_id,
                descriptor.sent_at,
                configuration,
                &self.my_replica_id,
            );
        }

        // 2. Update peer log tracker
        let peer_state = match leader_state.peer_state_mut(&descriptor.peer_id) {
            None => {
                slog::warn!(logger, "Peer {:?} not found while handling AE reply", descriptor.peer_id);
                return;
            }
            Some(peer_state) => peer_state,
        };
        if acked {
            peer_state.record_ack(descriptor.sent_at);
        }
        peer_state.handle_append_entries_result(&logger, descriptor.seq_no, peer_log_update);
        let (next_index, _) = peer_state.next_and_previous_log_index();

        // 4. (decided before committing, sent after) Enqueue next peer timer event.
        // > If last log index ≥ nextIndex for a follower: send
        // > AppendEntries RPC with log entries starting at nextIndex
        // Failures wait for the regular heartbeat instead, so an unreachable peer can't spin us.
        let do_immediate_call = acked
            && (my_latest_index.map_or(false, |latest| latest >= next_index)
                || leader_state
                    .pending_reads_mut()
                    .waiting_for_newer_than(descriptor.sent_at));

        // 3. Check for majority replication and apply new commits.
        self.try_advance_leader_commit();

        if do_immediate_call {
            let actor_client = self.actor_client.clone();
            let peer_heartbeat = LeaderTimerTick {
                peer_id: descriptor.peer_id,
                term: descriptor.term,
            };
            tokio::task::spawn(async move {
                let _ = actor_client.leader_timer(peer_heartbeat).await;
            });
        }

        self.maybe_yield_leadership();
    }

    pub(crate) fn handle_install_snapshot_reply_from_peer(&mut self, reply: InstallSnapshotReplyFromPeer) {
        let logger = self
            .logger
            .new(slog::o!("Peer" => format!("{:?}", reply.peer_id), "Snapshot" => format!("{:?}", reply.snapshot_index)));

        let current_term = self.current_term();
        if current_term != reply.term {
            slog::info!(logger, "Snapshot transfer finished after term moved on");
            return;
        }

        let installed = match &reply.result {
            Ok(is_reply) if is_reply.term > current_term => {
                match self.local_state.store_term_if_increased(is_reply.term) {
                    Ok(true) => {
                        self.become_follower(None);
                        slog::info!(logger, "Peer has a newer term. Transitioned to follower.");
                        return;
                    }
                    Ok(false) => None,
                    Err(e) => {
                        self.handle_fatal_io_error("storing a newer term", &e);
                        return;
                    }
                }
            }
            Ok(is_reply) => match &is_reply.outcome {
                InstallSnapshotOutcome::SnapshotInstalled | InstallSnapshotOutcome::AlreadyInstalled => {
                    slog::info!(logger, "Peer has the snapshot: {:?}", is_reply.outcome);
                    Some(is_reply.snapshot_index.unwrap_or(reply.snapshot_index))
                }
                other => {
                    slog::warn!(logger, "Snapshot transfer did not complete: {:?}", other);
                    None
                }
            },
            Err(message) => {
                slog::warn!(logger, "Snapshot transfer failed: {}", message);
                None
            }
        };

        match self
            .election_state
            .leader_state_mut()
            .and_then(|leader_state| leader_state.peer_state_mut(&reply.peer_id))
        {
            Some(peer_state) => peer_state.finish_snapshot(installed),
            None => {
                slog::info!(logger, "No longer replicating to peer");
                return;
            }
        }

        if installed.is_some() {
            self.try_advance_leader_commit();
            // Resume log replication right after the snapshot. Failures wait for the next
            // heartbeat instead.
            let actor_client = self.actor_client.clone();
            let tick = LeaderTimerTick {
                peer_id: reply.peer_id,
                term: reply.term,
            };
            tokio::task::spawn(async move {
                let _ = actor_client.leader_timer(tick).await;
            });
        }
    }

    /// Hands leadership to a caught-up voter with a higher priority than ours, if there is one.
    /// Tried at most once per term.
    fn maybe_yield_leadership(&mut self) {
        let configuration = self.wal.current_configuration();
        let my_priority = configuration
            .peer(&self.my_replica_id)
            .map_or(0, |me| me.priority());
        let my_latest_index = self.wal.latest_entry().map(|e| e.index);
        let commit_index = self.wal.commit_index();

        let leader_state = match self.election_state.leader_state_mut() {
            Some(leader_state) => leader_state,
            None => return,
        };
        if !leader_state.is_ready(commit_index) || leader_state.yielded_to().is_some() {
            return;
        }

        let target = leader_state
            .peers_iter()
            .filter(|p| configuration.is_voter(p.metadata().replica_id()))
            .filter(|p| p.metadata().priority() > my_priority)
            .filter(|p| p.matched() == my_latest_index)
            .max_by_key(|p| p.metadata().priority())
            .map(|p| p.metadata().clone());
        let target = match target {
            Some(target) => target,
            None => return,
        };

        slog::info!(
            self.logger,
            "Yielding leadership to {:?}, which has priority {} over our {}",
            target.replica_id(),
            target.priority(),
            my_priority
        );
        leader_state.set_yielded_to(target.replica_id().clone());

        let logger = self.logger.clone();
        let target_id = target.replica_id().clone();
        let call = self.start_leader_election_call(target);
        tokio::task::spawn(async move {
            match call.await {
                Ok(true) => slog::info!(logger, "{:?} is taking over leadership", target_id),
                Ok(false) => slog::info!(logger, "{:?} declined to take over leadership", target_id),
                Err(message) => slog::warn!(logger, "Failed to hand leadership to {:?}: {}", target_id, message),
            }
        });
    }
}

async fn call_peer_append_entries(
    logger: slog::Logger,
    transport: Arc<dyn RaftTransport>,
    peer: ReplicaMetadata,
    rpc_request: AppendEntriesRequest,
    rpc_timeout: Duration,
    callback: WeakActorClient,
    descriptor: AppendEntriesReplyFromPeerDescriptor,
) {
    slog::debug!(logger, "ClientWire - {:?}", rpc_request);
    let rpc_reply = tokio::time::timeout(rpc_timeout, transport.append_entries(&peer, rpc_request)).await;
    slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

    let result = match rpc_reply {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(e)) => Err(format!("Un-modeled failure from AppendEntries RPC call: {}", e)),
        Err(_timeout) => Err("Timed out calling AppendEntries".to_string()),
    };

    let callback_input = AppendEntriesReplyFromPeer { descriptor, result };

    let _ = callback
        .notify_append_entries_reply_from_peer(callback_input)
        .await;
}

pub(super) enum HandleLeaderTimerError {
    NoLongerLeader,
    LostMajority,
    PeerConcurrencyThrottle,
    SnapshotUnavailable(Index),
    DiskRead(Index, io::Error),
    UnexpectedMissingLogEntry(Index),
    LeaderStateMissingPeer {
        leader_state_tracker_peers: HashSet<ReplicaId>,
    },
}

mod leader_timer_handler {
    use crate::commitlog::Log;
    use crate::replica::election::PeerState;
    use crate::replica::replica_replication::HandleLeaderTimerError;
    use crate::replica::write_ahead_log::{WriteAheadLog, WriteAheadLogEntry};
    use crate::replica::{AppendEntriesReplyFromPeerDescriptor, AppendEntriesRequest, ReplicaId, Term, TermIndex};
    use tokio::time::Instant;

    pub(super) fn new_append_entries_request<L>(
        current_term: Term,
        my_id: ReplicaId,
        peer_state: &mut PeerState,
        wal: &WriteAheadLog<L>,
        max_entries_per_request: usize,
    ) -> Result<(AppendEntriesRequest, AppendEntriesReplyFromPeerDescriptor), HandleLeaderTimerError>
    where
        L: Log<WriteAheadLogEntry>,
    {
        // Simplicity vs throughput tradeoff. We're just going to allow 1 outstanding request per
        // peer; no pipelining. This should not limit throughput too badly however, as we still
        // batch log entries.
        if peer_state.has_outstanding_request() {
            return Err(HandleLeaderTimerError::PeerConcurrencyThrottle);
        }

        // While a snapshot is on its way, AppendEntries only serves as a heartbeat.
        let (previous_log_entry, new_entries) = if peer_state.snapshot_in_progress().is_some() {
            (None, Vec::new())
        } else {
            read_entries_for_peer(peer_state, wal, max_entries_per_request)?
        };

        let seq_no = peer_state.next_seq_no();
        let descriptor = AppendEntriesReplyFromPeerDescriptor {
            peer_id: peer_state.metadata().replica_id().clone(),
            term: current_term,
            seq_no,
            sent_at: Instant::now(),
            previous_log_entry,
            num_log_entries: new_entries.len(),
        };

        let request = AppendEntriesRequest {
            leader_id: my_id,
            leader_term: current_term,
            previous_log_entry,
            leader_commit_index: wal.commit_index(),
            is_heartbeat: new_entries.is_empty(),
            entries: new_entries,
            call_id: seq_no,
        };

        Ok((request, descriptor))
    }

    fn read_entries_for_peer<L>(
        peer_state: &PeerState,
        wal: &WriteAheadLog<L>,
        max_entries_per_request: usize,
    ) -> Result<(Option<TermIndex>, Vec<WriteAheadLogEntry>), HandleLeaderTimerError>
    where
        L: Log<WriteAheadLogEntry>,
    {
        let (next_index, opt_previous_index) = peer_state.next_and_previous_log_index();
        let previous_log_entry = match opt_previous_index {
            None => None,
            Some(previous_index) => match wal.term_at(previous_index) {
                Ok(Some(term)) => Some(TermIndex::new(term, previous_index)),
                Ok(None) => return Err(HandleLeaderTimerError::UnexpectedMissingLogEntry(previous_index)),
                Err(e) => return Err(HandleLeaderTimerError::DiskRead(previous_index, e)),
            },
        };

        let new_entries = wal
            .entries_from(next_index, max_entries_per_request)
            .map_err(|e| HandleLeaderTimerError::DiskRead(next_index, e))?;

        Ok((previous_log_entry, new_entries))
    }
}
