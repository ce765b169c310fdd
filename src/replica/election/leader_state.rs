use crate::actor::{Callback, WeakActorClient};
use crate::commitlog::Index;
use crate::replica::configuration::RaftConfiguration;
use crate::replica::election::lease::LeaderLease;
use crate::replica::election::read_index::PendingReads;
use crate::replica::election::timers::HeartbeatTimerHandle;
use crate::replica::pending_requests::PendingRequests;
use crate::replica::peers::ReplicaMetadata;
use crate::replica::{
    ClientWriteError, LeaderRedirectInfo, LeaderTimerTick, ReadIndexError, ReplicaId, SetConfigurationError, Term,
};
use std::cmp;
use std::collections::{HashMap, HashSet};
use tokio::time::{Duration, Instant};

/// LeaderStateTracker is everything a leader keeps for the duration of its term. It's dropped (and
/// all of its timers stopped) the moment we stop being leader.
pub(crate) struct LeaderStateTracker {
    term: Term,
    heartbeat_duration: Duration,
    actor_client: WeakActorClient,
    peer_state: HashMap<ReplicaId, PeerState>,
    lease: LeaderLease,
    pending_requests: PendingRequests,
    pending_reads: PendingReads,
    // Index of the no-op we appended on accession. Until it commits, we don't know the latest
    // commit index of the cluster and can't serve reads.
    startup_index: Option<Index>,
    pending_reconfiguration: Option<Callback<(), SetConfigurationError>>,
    yielded_to: Option<ReplicaId>,
}

impl LeaderStateTracker {
    pub(super) fn new(
        term: Term,
        peers: Vec<ReplicaMetadata>,
        previous_log_entry_index: Option<Index>,
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
        lease: LeaderLease,
    ) -> Self {
        let mut tracker = LeaderStateTracker {
            term,
            heartbeat_duration,
            actor_client,
            peer_state: HashMap::with_capacity(peers.len()),
            lease,
            pending_requests: PendingRequests::default(),
            pending_reads: PendingReads::default(),
            startup_index: None,
            pending_reconfiguration: None,
            yielded_to: None,
        };
        tracker.sync_peers(peers, previous_log_entry_index);

        tracker
    }

    /// Starts tracking (and sending heartbeats to) peers we don't know about yet, and stops
    /// tracking peers that are no longer in `peers`.
    pub(crate) fn sync_peers(&mut self, peers: Vec<ReplicaMetadata>, previous_log_entry_index: Option<Index>) {
        let wanted: HashSet<ReplicaId> = peers.iter().map(|p| p.replica_id().clone()).collect();
        self.peer_state.retain(|peer_id, _| wanted.contains(peer_id));

        for metadata in peers {
            match self.peer_state.get_mut(metadata.replica_id()) {
                Some(existing) => existing.metadata = metadata,
                None => {
                    let heartbeat_timer = HeartbeatTimerHandle::spawn(
                        self.heartbeat_duration,
                        self.actor_client.clone(),
                        metadata.replica_id().clone(),
                        self.term,
                    );
                    self.peer_state.insert(
                        metadata.replica_id().clone(),
                        PeerState::new(metadata, heartbeat_timer, previous_log_entry_index),
                    );
                }
            }
        }
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &ReplicaId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    pub(crate) fn peer_state(&self, peer_id: &ReplicaId) -> Option<&PeerState> {
        self.peer_state.get(peer_id)
    }

    pub(crate) fn peer_ids(&self) -> HashSet<ReplicaId> {
        self.peer_state.keys().cloned().collect()
    }

    pub(crate) fn peers_iter(&self) -> impl Iterator<Item = &PeerState> {
        self.peer_state.values()
    }

    /// Sends a timer tick for every peer right away, instead of waiting for the next heartbeat.
    pub(crate) fn trigger_replication(&self) {
        let ticks: Vec<LeaderTimerTick> = self
            .peer_state
            .keys()
            .map(|peer_id| LeaderTimerTick {
                peer_id: peer_id.clone(),
                term: self.term,
            })
            .collect();
        let actor_client = self.actor_client.clone();
        tokio::task::spawn(async move {
            for tick in ticks {
                let _ = actor_client.leader_timer(tick).await;
            }
        });
    }

    /// Match index of every peer, for commit index calculation. `me` is always fully matched.
    pub(crate) fn matched_index(&self, peer_id: &ReplicaId, me: &ReplicaId, my_latest: Option<Index>) -> Option<Index> {
        if peer_id == me {
            return my_latest;
        }
        self.peer_state.get(peer_id).and_then(|p| p.matched)
    }

    pub(crate) fn is_lease_valid(&self, configuration: &RaftConfiguration, me: &ReplicaId, now: Instant) -> bool {
        self.lease
            .is_valid(configuration, me, now, |id| self.peer_state.get(id).and_then(|p| p.last_ack_sent_at))
    }

    pub(crate) fn has_lost_majority(&self, configuration: &RaftConfiguration, me: &ReplicaId, now: Instant) -> bool {
        self.lease
            .has_lost_majority(configuration, me, now, |id| self.peer_state.get(id).and_then(|p| p.last_ack_sent_at))
    }

    pub(crate) fn pending_requests_mut(&mut self) -> &mut PendingRequests {
        &mut self.pending_requests
    }

    pub(crate) fn pending_reads_mut(&mut self) -> &mut PendingReads {
        &mut self.pending_reads
    }

    pub(crate) fn set_startup_index(&mut self, index: Index) {
        self.startup_index.replace(index);
    }

    /// True once the entry we appended on accession is committed.
    pub(crate) fn is_ready(&self, commit_index: Option<Index>) -> bool {
        match (self.startup_index, commit_index) {
            (Some(startup), Some(commit)) => startup <= commit,
            _ => false,
        }
    }

    pub(crate) fn has_pending_reconfiguration(&self) -> bool {
        self.pending_reconfiguration.is_some()
    }

    pub(crate) fn set_pending_reconfiguration(&mut self, callback: Callback<(), SetConfigurationError>) {
        self.pending_reconfiguration.replace(callback);
    }

    pub(crate) fn take_pending_reconfiguration(&mut self) -> Option<Callback<(), SetConfigurationError>> {
        self.pending_reconfiguration.take()
    }

    pub(crate) fn yielded_to(&self) -> Option<&ReplicaId> {
        self.yielded_to.as_ref()
    }

    pub(crate) fn set_yielded_to(&mut self, peer_id: ReplicaId) {
        self.yielded_to.replace(peer_id);
    }

    /// Fails everything that's waiting on this leader.
    pub(super) fn step_down(mut self, new_leader: Option<LeaderRedirectInfo>) {
        self.pending_requests.fail_all(|| match &new_leader {
            Some(leader) => ClientWriteError::LeaderRedirect(leader.clone()),
            None => ClientWriteError::NoLeader,
        });
        self.pending_reads.fail_all(|| ReadIndexError::LostLeadership);
        if let Some(callback) = self.pending_reconfiguration.take() {
            callback.send(Err(SetConfigurationError::LostLeadership));
        }
    }
}

pub(crate) struct PeerState {
    metadata: ReplicaMetadata,

    // Held to send heartbeats for this peer
    heartbeat_timer: HeartbeatTimerHandle,

    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    next: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    matched: Option<Index>,

    // SeqNo is a form of a logical clock that tracks a term leader's interactions with a peer. When
    // a replica becomes leader, it initializes last sent/received to 0. Each time leader sends a
    // request, it increments the last sent SeqNo and ensures the response will be associated with
    // that SeqNo. If a leader receives a SeqNo from earlier than a previously received SeqNo, it
    // discards it.
    last_sent_seq_no: u64,
    last_received_seq_no: u64,

    // Last included index of the snapshot we're streaming to this peer, if any. AppendEntries
    // turns into plain heartbeats while it's set.
    snapshot_in_progress: Option<Index>,

    // Send time of the latest request this peer answered in our term. Drives the lease.
    last_ack_sent_at: Option<Instant>,
}

impl PeerState {
    fn new(
        metadata: ReplicaMetadata,
        heartbeat_timer: HeartbeatTimerHandle,
        previous_log_entry_index: Option<Index>,
    ) -> Self {
        PeerState {
            metadata,
            heartbeat_timer,
            next: previous_log_entry_index
                .map(|i| i.plus(1))
                .unwrap_or_else(Index::start_index),
            matched: None,
            last_sent_seq_no: 0,
            last_received_seq_no: 0,
            snapshot_in_progress: None,
            last_ack_sent_at: None,
        }
    }

    pub(crate) fn metadata(&self) -> &ReplicaMetadata {
        &self.metadata
    }

    pub(crate) fn next_and_previous_log_index(&self) -> (Index, Option<Index>) {
        (self.next, self.next.checked_minus(1))
    }

    pub(crate) fn matched(&self) -> Option<Index> {
        self.matched
    }

    pub(crate) fn last_ack_sent_at(&self) -> Option<Instant> {
        self.last_ack_sent_at
    }

    /// Returns false if the reply was out of date and dropped.
    pub(crate) fn handle_append_entries_result(
        &mut self,
        logger: &slog::Logger,
        received_seq_no: u64,
        update: PeerStateUpdate,
    ) -> bool {
        if !self.ratchet_fwd_received_seq_no(received_seq_no) {
            slog::warn!(
                logger,
                "Dropping out of date seq-no({:?}): {:?}",
                received_seq_no,
                update
            );
            return false;
        }

        match update {
            PeerStateUpdate::OtherError => { /* No action */ }
            PeerStateUpdate::Success { match_index } => {
                if let Some(match_index) = match_index {
                    self.update_matched(match_index);
                }
            }
            PeerStateUpdate::PeerLogBehind { next_index_hint } => {
                self.rewind_log(logger, next_index_hint);
            }
        }

        true
    }

    fn update_matched(&mut self, new_matched: Index) {
        // Replies can race with a snapshot install that already moved us further along.
        if self.matched.map_or(true, |matched| new_matched > matched) {
            self.matched.replace(new_matched);
        }
        self.next = cmp::max(self.next, new_matched.plus(1));
    }

    fn rewind_log(&mut self, logger: &slog::Logger, next_index_hint: Index) {
        let one_back = self.next.checked_minus(1).unwrap_or_else(Index::start_index);
        let floor = self.matched.map(|m| m.plus(1)).unwrap_or_else(Index::start_index);

        // Don't trust the hint blindly, peer could return garbage data.
        let new_next = cmp::max(cmp::min(next_index_hint, one_back), floor);
        if new_next == self.next {
            slog::warn!(
                logger,
                "Can't rewind peer log past {:?} (matched={:?}, hint={:?})",
                self.next,
                self.matched,
                next_index_hint
            );
        }
        self.next = new_next;
    }

    pub(crate) fn record_ack(&mut self, sent_at: Instant) {
        if self.last_ack_sent_at.map_or(true, |prev| sent_at > prev) {
            self.last_ack_sent_at.replace(sent_at);
        }
    }

    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.last_received_seq_no < self.last_sent_seq_no
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    /// returns true if the state was mutated.
    fn ratchet_fwd_received_seq_no(&mut self, received_seq_no: u64) -> bool {
        if self.last_received_seq_no < received_seq_no && received_seq_no <= self.last_sent_seq_no {
            self.last_received_seq_no = received_seq_no;
            true
        } else {
            false
        }
    }

    pub(crate) fn snapshot_in_progress(&self) -> Option<Index> {
        self.snapshot_in_progress
    }

    pub(crate) fn start_snapshot(&mut self, snapshot_index: Index) {
        self.snapshot_in_progress.replace(snapshot_index);
    }

    /// Ends the transfer. If the peer installed it, replication resumes right after it.
    pub(crate) fn finish_snapshot(&mut self, installed: Option<Index>) {
        self.snapshot_in_progress = None;
        if let Some(installed) = installed {
            self.update_matched(installed);
        }
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        self.heartbeat_timer.reset_heartbeat_timer();
    }
}

#[derive(Debug)]
pub(crate) enum PeerStateUpdate {
    Success { match_index: Option<Index> },
    PeerLogBehind { next_index_hint: Index },
    OtherError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::peers::{PeerRole, ReplicaInfoBlob};
    use std::net::Ipv4Addr;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn peer_state(latest: Option<u64>) -> (PeerState, ActorClient) {
        let (actor_client, _rx) = ActorClient::new(10);
        let metadata = ReplicaMetadata::new(
            ReplicaId::new("peer"),
            Ipv4Addr::LOCALHOST,
            1,
            ReplicaInfoBlob::new(0),
            0,
            PeerRole::Voter,
        );
        let handle = HeartbeatTimerHandle::spawn(
            Duration::from_secs(60),
            actor_client.weak(),
            ReplicaId::new("peer"),
            Term::new(1),
        );
        (PeerState::new(metadata, handle, latest.map(Index::new)), actor_client)
    }

    #[tokio::test]
    async fn success_ratchets_forward() {
        let (mut ps, _client) = peer_state(Some(10));
        assert_eq!(ps.next_and_previous_log_index(), (Index::new(11), Some(Index::new(10))));

        let seq_no = ps.next_seq_no();
        assert!(ps.has_outstanding_request());
        assert!(ps.handle_append_entries_result(
            &logger(),
            seq_no,
            PeerStateUpdate::Success {
                match_index: Some(Index::new(12))
            }
        ));
        assert!(!ps.has_outstanding_request());
        assert_eq!(ps.matched(), Some(Index::new(12)));
        assert_eq!(ps.next_and_previous_log_index().0, Index::new(13));

        // Replaying the same seq-no is dropped.
        assert!(!ps.handle_append_entries_result(
            &logger(),
            seq_no,
            PeerStateUpdate::Success {
                match_index: Some(Index::new(20))
            }
        ));
        assert_eq!(ps.matched(), Some(Index::new(12)));
    }

    #[tokio::test]
    async fn rewind_uses_hint_but_never_past_matched() {
        let (mut ps, _client) = peer_state(Some(10));

        let seq_no = ps.next_seq_no();
        ps.handle_append_entries_result(
            &logger(),
            seq_no,
            PeerStateUpdate::PeerLogBehind {
                next_index_hint: Index::new(4),
            },
        );
        assert_eq!(ps.next_and_previous_log_index().0, Index::new(4));

        // A hint that doesn't move us back still steps back one entry.
        let seq_no = ps.next_seq_no();
        ps.handle_append_entries_result(
            &logger(),
            seq_no,
            PeerStateUpdate::PeerLogBehind {
                next_index_hint: Index::new(9),
            },
        );
        assert_eq!(ps.next_and_previous_log_index().0, Index::new(3));

        let seq_no = ps.next_seq_no();
        ps.handle_append_entries_result(
            &logger(),
            seq_no,
            PeerStateUpdate::Success {
                match_index: Some(Index::new(2)),
            },
        );
        let seq_no = ps.next_seq_no();
        ps.handle_append_entries_result(
            &logger(),
            seq_no,
            PeerStateUpdate::PeerLogBehind {
                next_index_hint: Index::new(1),
            },
        );
        assert_eq!(ps.next_and_previous_log_index().0, Index::new(3));
    }

    #[tokio::test]
    async fn snapshot_install_moves_peer_forward() {
        let (mut ps, _client) = peer_state(Some(100));

        // Peer has nothing, so next falls behind our compacted prefix.
        let seq_no = ps.next_seq_no();
        ps.handle_append_entries_result(
            &logger(),
            seq_no,
            PeerStateUpdate::PeerLogBehind {
                next_index_hint: Index::new(1),
            },
        );
        assert_eq!(ps.next_and_previous_log_index().0, Index::new(1));

        ps.start_snapshot(Index::new(50));
        assert_eq!(ps.snapshot_in_progress(), Some(Index::new(50)));

        ps.finish_snapshot(Some(Index::new(50)));
        assert_eq!(ps.snapshot_in_progress(), None);
        assert_eq!(ps.matched(), Some(Index::new(50)));
        assert_eq!(ps.next_and_previous_log_index(), (Index::new(51), Some(Index::new(50))));
    }

    #[tokio::test]
    async fn failed_snapshot_leaves_peer_where_it_was() {
        let (mut ps, _client) = peer_state(Some(100));
        let seq_no = ps.next_seq_no();
        ps.handle_append_entries_result(
            &logger(),
            seq_no,
            PeerStateUpdate::PeerLogBehind {
                next_index_hint: Index::new(1),
            },
        );

        ps.start_snapshot(Index::new(50));
        ps.finish_snapshot(None);
        assert_eq!(ps.snapshot_in_progress(), None);
        assert_eq!(ps.matched(), None);
        assert_eq!(ps.next_and_previous_log_index().0, Index::new(1));
    }
}
