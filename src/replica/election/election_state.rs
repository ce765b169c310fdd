use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::replica::election::lease::LeaderLease;
use crate::replica::election::state_change_listener::ElectionStateChangeNotifier;
use crate::replica::election::timers::ElectionTimerHandle;
use crate::replica::election::{state_change_listener, LeaderStateTracker};
use crate::replica::peers::ReplicaMetadata;
use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot, LeaderRedirectInfo, ReplicaId, Term};
use std::collections::HashSet;
use std::fmt;
use tokio::time::{Duration, Instant};

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_replica_id: ReplicaId,
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub leader_lease_duration: Duration,
}

pub(crate) enum CurrentLeader {
    Me,
    Other(LeaderRedirectInfo),
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ElectionPhase {
    /// Asking whether peers would vote for us, without touching anyone's term.
    PreVote,
    Vote,
}

/// ElectionState is responsible for holding state specific to the stage in an election. Its
/// methods are responsible for "what" to do. It is NOT responsible for validating anything
/// specific to logs, terms, peers, etc. or knowing "when" to do something.
pub(crate) struct ElectionState {
    state: State,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    state_change_notifier: ElectionStateChangeNotifier,
}

impl ElectionState {
    /// `new()` creates a new ElectionState instance that starts out as a follower, or as a listener
    /// if we're not a voting member.
    pub(crate) fn new(
        config: ElectionConfig,
        actor_client: WeakActorClient,
        as_listener: bool,
    ) -> (Self, ElectionStateChangeListener) {
        let initial_state = if as_listener {
            State::Listener(ListenerState::new(None))
        } else {
            State::Follower(FollowerState::new(
                None,
                config.follower_min_timeout,
                config.follower_max_timeout,
                actor_client.clone(),
            ))
        };
        let (notifier, listener) = state_change_listener::new(Self::current_state_impl(&initial_state));

        let election_state = Self {
            state: initial_state,
            config,
            actor_client,
            state_change_notifier: notifier,
        };

        (election_state, listener)
    }

    pub(crate) fn transition_to_follower(&mut self, new_leader: Option<LeaderRedirectInfo>) {
        let state = State::Follower(FollowerState::new(
            new_leader.clone(),
            self.config.follower_min_timeout,
            self.config.follower_max_timeout,
            self.actor_client.clone(),
        ));
        self.replace_state(state, new_leader);
    }

    pub(crate) fn transition_to_listener(&mut self, leader: Option<LeaderRedirectInfo>) {
        self.replace_state(State::Listener(ListenerState::new(leader.clone())), leader);
    }

    /// The candidate votes for itself in both phases.
    pub(crate) fn transition_to_candidate(&mut self, phase: ElectionPhase, term: Term) {
        let mut cs = CandidateState::new(
            phase,
            term,
            self.config.follower_min_timeout,
            self.config.follower_max_timeout,
            self.actor_client.clone(),
        );

        // Vote for self
        cs.add_vote(self.config.my_replica_id.clone(), true);

        self.replace_state(State::Candidate(cs), None);
    }

    pub(crate) fn transition_to_leader(
        &mut self,
        term: Term,
        peers: Vec<ReplicaMetadata>,
        previous_log_entry_index: Option<Index>,
    ) {
        let lease = LeaderLease::new(
            Instant::now(),
            self.config.leader_lease_duration,
            self.config.follower_min_timeout,
        );
        let tracker = LeaderStateTracker::new(
            term,
            peers,
            previous_log_entry_index,
            self.config.leader_heartbeat_duration,
            self.actor_client.clone(),
            lease,
        );
        self.replace_state(State::Leader(LeaderState { tracker }), None);
    }

    pub(crate) fn transition_to_shutdown(&mut self) {
        self.replace_state(State::Shutdown, None);
    }

    fn replace_state(&mut self, new_state: State, new_leader: Option<LeaderRedirectInfo>) {
        let old_state = std::mem::replace(&mut self.state, new_state);
        if let State::Leader(ls) = old_state {
            ls.tracker.step_down(new_leader);
        }
        self.notify_new_state();
    }

    pub(crate) fn current_state(&self) -> ElectionStateSnapshot {
        Self::current_state_impl(&self.state)
    }

    fn current_state_impl(state: &State) -> ElectionStateSnapshot {
        match state {
            State::Leader(_) => ElectionStateSnapshot::Leader,
            State::Candidate(_) => ElectionStateSnapshot::Candidate,
            State::Follower(FollowerState { leader: None, .. }) => ElectionStateSnapshot::FollowerNoLeader,
            State::Follower(FollowerState {
                leader: Some(leader_info),
                ..
            }) => ElectionStateSnapshot::Follower(leader_info.clone()),
            State::Listener(ls) => ElectionStateSnapshot::Listener(ls.leader.clone()),
            State::Shutdown => ElectionStateSnapshot::Shutdown,
        }
    }

    fn notify_new_state(&self) {
        self.state_change_notifier
            .notify_new_state(Self::current_state_impl(&self.state));
    }

    pub(crate) fn current_leader(&self) -> CurrentLeader {
        match &self.state {
            State::Leader(_) => CurrentLeader::Me,
            State::Follower(FollowerState {
                leader: Some(leader), ..
            })
            | State::Listener(ListenerState {
                leader: Some(leader), ..
            }) => CurrentLeader::Other(leader.clone()),
            _ => CurrentLeader::Unknown,
        }
    }

    pub(crate) fn reset_timeout_if_follower(&self) {
        if let State::Follower(fs) = &self.state {
            fs.reset_timeout();
        }
    }

    /// Records that `leader` contacted us, learning who it is if we didn't know yet.
    pub(crate) fn record_leader_contact(&mut self, leader: &LeaderRedirectInfo, now: Instant) {
        let (known_leader, last_contact) = match &mut self.state {
            State::Follower(fs) => (&mut fs.leader, &mut fs.last_leader_contact),
            State::Listener(ls) => (&mut ls.leader, &mut ls.last_leader_contact),
            _ => return,
        };

        last_contact.replace(now);
        if known_leader.as_ref() != Some(leader) {
            known_leader.replace(leader.clone());
            self.notify_new_state();
        }
    }

    /// True if a leader contacted us within `window`. Pre-votes are refused while this holds so a
    /// partitioned replica can't disrupt a healthy leader.
    pub(crate) fn has_recent_leader_contact(&self, now: Instant, window: Duration) -> bool {
        let last_contact = match &self.state {
            State::Leader(_) => return true,
            State::Follower(fs) => fs.last_leader_contact,
            State::Listener(ls) => ls.last_leader_contact,
            State::Candidate(_) | State::Shutdown => None,
        };

        matches!(last_contact, Some(contact) if now.saturating_duration_since(contact) < window)
    }

    pub(crate) fn candidate_state_mut(&mut self) -> Option<&mut CandidateState> {
        if let State::Candidate(cs) = &mut self.state {
            Some(cs)
        } else {
            None
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        if let State::Leader(ls) = &mut self.state {
            Some(&mut ls.tracker)
        } else {
            None
        }
    }

    pub(crate) fn leader_state(&self) -> Option<&LeaderStateTracker> {
        if let State::Leader(ls) = &self.state {
            Some(&ls.tracker)
        } else {
            None
        }
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.state, State::Leader(_))
    }

    pub(crate) fn is_candidate(&self) -> bool {
        matches!(self.state, State::Candidate(_))
    }

    pub(crate) fn is_follower(&self) -> bool {
        matches!(self.state, State::Follower(_))
    }

    pub(crate) fn is_listener(&self) -> bool {
        matches!(self.state, State::Listener(_))
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        matches!(self.state, State::Shutdown)
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Leader(_) => write!(f, "Leader"),
            State::Candidate(cs) => write!(f, "Candidate({:?}, Term={:?})", cs.phase, cs.term),
            State::Follower(FollowerState {
                leader: Some(leader_info),
                ..
            }) => write!(f, "Follower(Leader={:?})", leader_info.replica_id),
            State::Follower(FollowerState { leader: None, .. }) => write!(f, "Follower(Leader=None)"),
            State::Listener(_) => write!(f, "Listener"),
            State::Shutdown => write!(f, "Shutdown"),
        }
    }
}

enum State {
    Leader(LeaderState),
    Candidate(CandidateState),
    Follower(FollowerState),
    Listener(ListenerState),
    Shutdown,
}

struct LeaderState {
    tracker: LeaderStateTracker,
}

pub(crate) struct CandidateState {
    phase: ElectionPhase,
    // The term we're asking votes for. During pre-vote that's one past our persisted term.
    term: Term,
    granted: HashSet<ReplicaId>,
    rejected: HashSet<ReplicaId>,
    _election_timer: ElectionTimerHandle,
}

struct FollowerState {
    leader: Option<LeaderRedirectInfo>,
    last_leader_contact: Option<Instant>,
    election_timer: ElectionTimerHandle,
}

// Listeners replicate but never time out into an election.
struct ListenerState {
    leader: Option<LeaderRedirectInfo>,
    last_leader_contact: Option<Instant>,
}

impl CandidateState {
    fn new(
        phase: ElectionPhase,
        term: Term,
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
    ) -> Self {
        Self {
            phase,
            term,
            granted: HashSet::with_capacity(3),
            rejected: HashSet::new(),
            _election_timer: ElectionTimerHandle::spawn(min_timeout, max_timeout, actor_client),
        }
    }

    pub(crate) fn phase(&self) -> ElectionPhase {
        self.phase
    }

    pub(crate) fn term(&self) -> Term {
        self.term
    }

    /// A peer can't change its answer within a round; the first one wins.
    pub(crate) fn add_vote(&mut self, vote_from: ReplicaId, granted: bool) {
        if self.granted.contains(&vote_from) || self.rejected.contains(&vote_from) {
            return;
        }

        if granted {
            self.granted.insert(vote_from);
        } else {
            self.rejected.insert(vote_from);
        }
    }

    pub(crate) fn granted(&self) -> &HashSet<ReplicaId> {
        &self.granted
    }

    pub(crate) fn rejected(&self) -> &HashSet<ReplicaId> {
        &self.rejected
    }
}

impl FollowerState {
    fn new(
        leader: Option<LeaderRedirectInfo>,
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
    ) -> Self {
        Self {
            last_leader_contact: leader.as_ref().map(|_| Instant::now()),
            leader,
            election_timer: ElectionTimerHandle::spawn(min_timeout, max_timeout, actor_client),
        }
    }

    fn reset_timeout(&self) {
        self.election_timer.reset();
    }
}

impl ListenerState {
    fn new(leader: Option<LeaderRedirectInfo>) -> Self {
        Self {
            last_leader_contact: leader.as_ref().map(|_| Instant::now()),
            leader,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorClient, Callback};
    use crate::replica::peers::{PeerRole, ReplicaInfoBlob};
    use crate::replica::{ClientWriteError, TermIndex};
    use std::net::Ipv4Addr;
    use tokio::sync::oneshot;

    fn config() -> ElectionConfig {
        ElectionConfig {
            my_replica_id: ReplicaId::new("me"),
            leader_heartbeat_duration: Duration::from_secs(10),
            follower_min_timeout: Duration::from_secs(30),
            follower_max_timeout: Duration::from_secs(40),
            leader_lease_duration: Duration::from_secs(15),
        }
    }

    fn leader_info(id: &str) -> LeaderRedirectInfo {
        let metadata = ReplicaMetadata::new(
            ReplicaId::new(id),
            Ipv4Addr::LOCALHOST,
            1,
            ReplicaInfoBlob::new(7),
            0,
            PeerRole::Voter,
        );
        LeaderRedirectInfo::from(&metadata)
    }

    #[tokio::test]
    async fn transitions_are_published() {
        let (actor_client, _rx) = ActorClient::new(10);
        let (mut state, mut listener) = ElectionState::new(config(), actor_client.weak(), false);
        assert_eq!(listener.current(), ElectionStateSnapshot::FollowerNoLeader);

        state.transition_to_candidate(ElectionPhase::PreVote, Term::new(1));
        assert_eq!(listener.next().await, Some(ElectionStateSnapshot::Candidate));
        let cs = state.candidate_state_mut().unwrap();
        assert_eq!(cs.phase(), ElectionPhase::PreVote);
        assert!(cs.granted().contains(&ReplicaId::new("me")));

        state.transition_to_follower(Some(leader_info("a")));
        assert_eq!(
            listener.next().await,
            Some(ElectionStateSnapshot::Follower(leader_info("a")))
        );
        assert!(state.has_recent_leader_contact(Instant::now(), Duration::from_secs(1)));

        state.transition_to_shutdown();
        assert!(state.is_shutdown());
        assert_eq!(listener.next().await, Some(ElectionStateSnapshot::Shutdown));
    }

    #[tokio::test]
    async fn votes_are_counted_once() {
        let (actor_client, _rx) = ActorClient::new(10);
        let (mut state, _listener) = ElectionState::new(config(), actor_client.weak(), false);
        state.transition_to_candidate(ElectionPhase::Vote, Term::new(4));

        let cs = state.candidate_state_mut().unwrap();
        cs.add_vote(ReplicaId::new("a"), false);
        cs.add_vote(ReplicaId::new("a"), true);
        cs.add_vote(ReplicaId::new("b"), true);
        assert_eq!(cs.granted().len(), 2);
        assert_eq!(cs.rejected().len(), 1);
        assert_eq!(cs.term(), Term::new(4));
    }

    #[tokio::test]
    async fn step_down_fails_pending_writes_with_redirect() {
        let (actor_client, _rx) = ActorClient::new(10);
        let (mut state, _listener) = ElectionState::new(config(), actor_client.weak(), false);
        state.transition_to_leader(Term::new(2), Vec::new(), None);
        assert!(matches!(state.current_leader(), CurrentLeader::Me));

        let (tx, rx) = oneshot::channel();
        state
            .leader_state_mut()
            .unwrap()
            .pending_requests_mut()
            .insert(TermIndex::new(Term::new(2), Index::new(1)), Callback::new(tx));

        state.transition_to_follower(Some(leader_info("b")));
        match rx.await.unwrap() {
            Err(ClientWriteError::LeaderRedirect(info)) => assert_eq!(info.replica_id, ReplicaId::new("b")),
            other => panic!("Unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn listener_learns_leader() {
        let (actor_client, _rx) = ActorClient::new(10);
        let (mut state, listener) = ElectionState::new(config(), actor_client.weak(), true);
        assert!(state.is_listener());
        assert_eq!(listener.current(), ElectionStateSnapshot::Listener(None));

        state.record_leader_contact(&leader_info("a"), Instant::now());
        assert_eq!(listener.current(), ElectionStateSnapshot::Listener(Some(leader_info("a"))));
        assert!(matches!(state.current_leader(), CurrentLeader::Other(_)));
    }
}
