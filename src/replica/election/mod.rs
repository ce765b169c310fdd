mod election_state;
mod leader_state;
mod lease;
mod read_index;
mod state_change_listener;
mod timers;

pub(crate) use election_state::CurrentLeader;
pub(crate) use election_state::ElectionConfig;
pub(crate) use election_state::ElectionPhase;
pub(crate) use election_state::ElectionState;
pub(crate) use leader_state::LeaderStateTracker;
pub(crate) use leader_state::PeerState;
pub(crate) use leader_state::PeerStateUpdate;
pub(crate) use state_change_listener::ElectionStateChangeListener;
pub(crate) use state_change_listener::ElectionStateSnapshot;
pub(crate) use timers::{Clock, RealClock};

#[cfg(test)]
pub(crate) use timers::mocked_clock;
