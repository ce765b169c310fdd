use crate::actor::WeakActorClient;
use crate::commitlog::Log;
use crate::replica::election::{CurrentLeader, ElectionPhase};
use crate::replica::local_state::Term;
use crate::replica::peers::ReplicaMetadata;
use crate::replica::replica::Replica;
use crate::replica::term_index::TermIndex;
use crate::replica::write_ahead_log::{EntryPayload, WriteAheadLogEntry};
use crate::replica::{
    RequestVoteReply, RequestVoteReplyFromPeer, RequestVoteRequest, RpcHandlerError, StartLeaderElectionReply,
    StartLeaderElectionRequest,
};
use crate::transport::RaftTransport;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry>,
{
    pub(crate) fn handle_follower_timeout(&mut self) {
        if self.election_state.is_leader() || self.election_state.is_listener() || self.is_shut_down() {
            return;
        }

        let configuration = self.wal.current_configuration();
        if !configuration.contains(&self.my_replica_id) {
            // The leader stops replicating to us once our removal commits, and the timeout is how we
            // find out.
            if self
                .wal
                .configurations()
                .was_removed(&self.my_replica_id, configuration.log_index())
            {
                self.shutdown("Removed from the configuration and no longer hearing from a leader");
            }
            return;
        }
        if !configuration.is_voter(&self.my_replica_id) {
            return;
        }

        if self.pre_vote {
            self.start_pre_vote();
        } else {
            self.start_election();
        }
    }

    /// Asks whether peers would vote for us in the next term, without bumping anyone's term. A
    /// replica that was partitioned away can't win this, so it can't disrupt a healthy leader when
    /// it comes back.
    fn start_pre_vote(&mut self) {
        let term = self.current_term().next();
        self.election_state
            .transition_to_candidate(ElectionPhase::PreVote, term);
        slog::info!(
            self.logger,
            "Timed out as follower. Starting pre-vote for term {:?}. Election state: {:?}",
            term,
            self.election_state,
        );

        self.request_votes(ElectionPhase::PreVote, term);
    }

    pub(super) fn start_election(&mut self) {
        // Write-ahead log style: Vote for self on local state before transitioning to candidate.
        let new_term = match self.local_state.increment_term_and_vote_for_self() {
            Ok(term) => term,
            Err(e) => {
                self.handle_fatal_io_error("voting for self", &e);
                return;
            }
        };
        self.election_state
            .transition_to_candidate(ElectionPhase::Vote, new_term);
        slog::info!(
            self.logger,
            "Changed to candidate for term {:?}. Election state: {:?}",
            new_term,
            self.election_state,
        );

        self.request_votes(ElectionPhase::Vote, new_term);
    }

    fn request_votes(&mut self, phase: ElectionPhase, term: Term) {
        let request = RequestVoteRequest {
            candidate_id: self.my_replica_id.clone(),
            candidate_term: term,
            candidate_last_entry: self.wal.latest_entry(),
            pre_vote: phase == ElectionPhase::PreVote,
        };

        let configuration = self.wal.current_configuration();
        let voters = configuration
            .other_peers(&self.my_replica_id)
            .into_iter()
            .filter(|peer| configuration.is_voter(peer.replica_id()));
        for peer in voters {
            let logger = self
                .logger
                .new(slog::o!("Peer" => format!("{:?}", peer.replica_id())));
            tokio::task::spawn(call_peer_request_vote(
                logger,
                self.transport.clone(),
                peer,
                request.clone(),
                self.rpc_timeout,
                self.actor_client.clone(),
            ));
        }

        // We might be the only voter.
        self.check_election_result();
    }

    pub(crate) fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        let logger = self
            .logger
            .new(slog::o!("Peer" => format!("{:?}", reply.peer_id), "Term" => format!("{:?}", reply.term)));

        let vote = match reply.result {
            Ok(vote) => vote,
            Err(message) => {
                // Not retried. If the election stalls, the candidate timer starts a new one.
                slog::info!(logger, "RequestVote failed: {}", message);
                return;
            }
        };

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        if !vote.vote_granted && vote.term > self.current_term() {
            match self.local_state.store_term_if_increased(vote.term) {
                Ok(true) => {
                    self.become_follower(None);
                    slog::info!(logger, "Observed term {:?} in vote reply. Transitioned to follower.", vote.term);
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    self.handle_fatal_io_error("storing a newer term", &e);
                    return;
                }
            }
        }

        if vote.should_shutdown {
            self.shutdown("Peer reports we're no longer part of the committed configuration");
            return;
        }

        let phase = if reply.pre_vote {
            ElectionPhase::PreVote
        } else {
            ElectionPhase::Vote
        };
        match self.election_state.candidate_state_mut() {
            Some(cs) if cs.term() == reply.term && cs.phase() == phase => {
                cs.add_vote(reply.peer_id, vote.vote_granted);
            }
            _ => {
                slog::info!(
                    logger,
                    "Received {:?} vote after moving on. Election state: {:?}",
                    phase,
                    self.election_state
                );
                return;
            }
        }

        self.check_election_result();
    }

    fn check_election_result(&mut self) {
        let configuration = self.wal.current_configuration();
        let (phase, term, won, lost) = match self.election_state.candidate_state_mut() {
            Some(cs) => (
                cs.phase(),
                cs.term(),
                configuration.has_majority(|id| cs.granted().contains(id)),
                configuration.has_rejecting_majority(|id| cs.rejected().contains(id)),
            ),
            None => return,
        };

        if won {
            match phase {
                ElectionPhase::PreVote => {
                    slog::info!(self.logger, "Won pre-vote for term {:?}", term);
                    self.start_election();
                }
                ElectionPhase::Vote => self.become_leader(term),
            }
        } else if lost {
            slog::info!(self.logger, "Lost {:?} for term {:?}", phase, term);
            self.election_state.transition_to_follower(None);
        }
    }

    fn become_leader(&mut self, term: Term) {
        let peers = self.replication_targets();
        let latest_index = self.wal.latest_entry().map(|e| e.index);
        self.election_state
            .transition_to_leader(term, peers, latest_index);
        slog::info!(self.logger, "Won election for term {:?}. Now leader.", term);

        // Entries from earlier terms can only commit along with one from our own term. The no-op
        // also tells us when we've caught up to the cluster's commit index.
        let no_op = WriteAheadLogEntry {
            term,
            payload: EntryPayload::NoOp,
        };
        let no_op_index = match self.append_and_flush(no_op) {
            Ok(index) => index,
            Err(e) => {
                self.handle_fatal_io_error("appending the leader no-op", &e);
                return;
            }
        };

        if let Some(leader_state) = self.election_state.leader_state_mut() {
            leader_state.set_startup_index(no_op_index);
            leader_state.trigger_replication();
        }
        self.try_advance_leader_commit();
    }

    pub(crate) fn server_handle_request_vote(
        &mut self,
        input: RequestVoteRequest,
    ) -> Result<RequestVoteReply, RpcHandlerError> {
        if self.is_shut_down() {
            return Err(RpcHandlerError::Shutdown);
        }

        let my_last_entry = self.wal.latest_entry();
        if self.should_candidate_shut_down(&input) {
            slog::info!(
                self.logger,
                "Candidate {:?} was removed from the configuration. Telling it to shut down.",
                input.candidate_id
            );
            return Ok(RequestVoteReply {
                term: self.current_term(),
                vote_granted: false,
                should_shutdown: true,
                last_entry: my_last_entry,
            });
        }

        // Read our local term/vote state as 1 atomic action.
        let (current_term, mut opt_voted_for) = self.local_state.voted_for_current_term();
        let reply = |term: Term, vote_granted: bool| RequestVoteReply {
            term,
            vote_granted,
            should_shutdown: false,
            last_entry: my_last_entry,
        };

        // 1. Reply false if term < currentTerm (§5.1)
        if input.candidate_term < current_term {
            slog::info!(self.logger, "Not granting vote. Client term is out of date.");
            return Ok(reply(current_term, false));
        }

        if input.pre_vote {
            let granted = self.should_grant_pre_vote(&input);
            return Ok(reply(current_term, granted));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = self
            .local_state
            .store_term_if_increased(input.candidate_term)
            .map_err(RpcHandlerError::LocalIoError)?;
        if increased {
            self.become_follower(None);
            slog::info!(
                self.logger,
                "Observed increased term in RequestVote call. Transitioning to follower. Election state: {:?}",
                self.election_state
            );
            // If we've increased the term, it means we haven't voted for anyone this term.
            opt_voted_for = None;
        }
        let current_term = self.current_term();

        if self.election_state.is_listener() {
            return Ok(reply(current_term, false));
        }

        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).

        // If votedFor is null or candidateId, and...
        if let Some(voted_for) = opt_voted_for {
            if *voted_for != input.candidate_id {
                slog::info!(self.logger, "Not granting vote. We already voted for {:?}.", voted_for);
                return Ok(reply(current_term, false));
            }
        }

        // ...and candidate’s log is at least as up-to-date as receiver’s log...
        if !TermIndex::is_at_least_as_up_to_date(input.candidate_last_entry, my_last_entry) {
            slog::info!(self.logger, "Not granting vote. Candidate log is out of date.");
            return Ok(reply(current_term, false));
        }

        // ...grant vote
        let cas_success = self
            .local_state
            .store_vote_for_term_if_unvoted(input.candidate_term, input.candidate_id.clone())
            .map_err(RpcHandlerError::LocalIoError)?;
        if cas_success {
            slog::info!(self.logger, "Voting for {:?}.", input.candidate_id);
            self.election_state.reset_timeout_if_follower();
            return Ok(reply(current_term, true));
        }

        // We lost CAS race. Re-read state and return success based on if previous winner
        // made the same vote as we would've.
        if let (reread_current_term, Some(reread_voted_for)) = self.local_state.voted_for_current_term() {
            if reread_current_term == input.candidate_term && reread_voted_for.as_ref() == &input.candidate_id {
                // Candidate retried and we already voted for it.
                return Ok(reply(current_term, true));
            }
        }

        // If current state doesn't exactly match this request, for whatever
        // reason, don't grant vote.
        slog::info!(self.logger, "Not granting vote because idk why.");
        Ok(reply(current_term, false))
    }

    // Pre-votes never touch our term or vote.
    fn should_grant_pre_vote(&self, input: &RequestVoteRequest) -> bool {
        if self
            .election_state
            .has_recent_leader_contact(Instant::now(), self.election_config.follower_min_timeout)
        {
            slog::info!(self.logger, "Not granting pre-vote. We've heard from a leader recently.");
            return false;
        }
        if !self.wal.current_configuration().is_voter(&input.candidate_id) {
            slog::info!(self.logger, "Not granting pre-vote. {:?} isn't a voter.", input.candidate_id);
            return false;
        }

        TermIndex::is_at_least_as_up_to_date(input.candidate_last_entry, self.wal.latest_entry())
    }

    /// A candidate that isn't part of our configuration, and whose log ends before the committed
    /// configuration entry, was removed and never found out.
    fn should_candidate_shut_down(&self, input: &RequestVoteRequest) -> bool {
        let committed = self.wal.configurations().committed(self.wal.commit_index());
        if self.wal.current_configuration().contains(&input.candidate_id) || committed.contains(&input.candidate_id) {
            return false;
        }

        match (committed.log_index(), input.candidate_last_entry) {
            (Some(configuration_index), Some(candidate_last)) => candidate_last.index < configuration_index,
            _ => false,
        }
    }

    pub(crate) fn server_handle_start_leader_election(
        &mut self,
        input: StartLeaderElectionRequest,
    ) -> Result<StartLeaderElectionReply, RpcHandlerError> {
        if self.is_shut_down() {
            return Err(RpcHandlerError::Shutdown);
        }

        let from_my_leader = matches!(
            self.election_state.current_leader(),
            CurrentLeader::Other(leader) if leader.replica_id == input.leader_id
        );
        let accepted = from_my_leader
            && self.election_state.is_follower()
            && self.wal.current_configuration().is_voter(&self.my_replica_id)
            && TermIndex::is_at_least_as_up_to_date(self.wal.latest_entry(), input.leader_last_entry);

        if accepted {
            slog::info!(self.logger, "Leader {:?} asked us to take over", input.leader_id);
            // Skip the pre-vote; the leader itself is about to vote for us.
            self.start_election();
        } else {
            slog::info!(
                self.logger,
                "Declining to start an election for {:?}. Election state: {:?}",
                input.leader_id,
                self.election_state
            );
        }

        Ok(StartLeaderElectionReply { accepted })
    }
}

async fn call_peer_request_vote(
    logger: slog::Logger,
    transport: Arc<dyn RaftTransport>,
    peer: ReplicaMetadata,
    request: RequestVoteRequest,
    rpc_timeout: Duration,
    callback: WeakActorClient,
) {
    let term = request.candidate_term;
    let pre_vote = request.pre_vote;

    slog::debug!(logger, "ClientWire - {:?}", request);
    let rpc_reply = tokio::time::timeout(rpc_timeout, transport.request_vote(&peer, request)).await;
    slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

    let result = match rpc_reply {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_timeout) => Err("Timed out calling RequestVote".to_string()),
    };

    let callback_input = RequestVoteReplyFromPeer {
        peer_id: peer.replica_id().clone(),
        term,
        pre_vote,
        result,
    };

    let _ = callback.notify_request_vote_reply_from_peer(callback_input).await;
}
