use crate::replica::configuration::RaftConfiguration;
use crate::replica::ReplicaId;
use tokio::time::{Duration, Instant};

/// LeaderLease tracks how long a leader may keep trusting that no other leader exists.
///
/// Acknowledgements are timestamped with when the acknowledged AppendEntries was *sent*, not when
/// the reply arrived. A follower that accepted a request sent at T won't vote for anyone else until
/// T + its election timeout, so the lease counts from T.
pub(crate) struct LeaderLease {
    became_leader_at: Instant,
    lease_duration: Duration,
    step_down_timeout: Duration,
}

impl LeaderLease {
    pub(crate) fn new(became_leader_at: Instant, lease_duration: Duration, step_down_timeout: Duration) -> Self {
        LeaderLease {
            became_leader_at,
            lease_duration,
            step_down_timeout,
        }
    }

    /// Reads can be served without a heartbeat round while this holds.
    pub(crate) fn is_valid(
        &self,
        configuration: &RaftConfiguration,
        me: &ReplicaId,
        now: Instant,
        acked_at: impl Fn(&ReplicaId) -> Option<Instant>,
    ) -> bool {
        match now.checked_sub(self.lease_duration) {
            Some(since) => Self::has_majority_since(configuration, me, since, acked_at),
            None => false,
        }
    }

    /// True if we haven't heard from a majority for a whole election timeout, so some other
    /// replica may already be leader.
    pub(crate) fn has_lost_majority(
        &self,
        configuration: &RaftConfiguration,
        me: &ReplicaId,
        now: Instant,
        acked_at: impl Fn(&ReplicaId) -> Option<Instant>,
    ) -> bool {
        if now.saturating_duration_since(self.became_leader_at) < self.step_down_timeout {
            return false;
        }

        match now.checked_sub(self.step_down_timeout) {
            Some(since) => !Self::has_majority_since(configuration, me, since, acked_at),
            None => false,
        }
    }

    fn has_majority_since(
        configuration: &RaftConfiguration,
        me: &ReplicaId,
        since: Instant,
        acked_at: impl Fn(&ReplicaId) -> Option<Instant>,
    ) -> bool {
        configuration.has_majority(|id| id == me || matches!(acked_at(id), Some(acked) if acked >= since))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::configuration::PeerConfiguration;
    use crate::replica::peers::{PeerRole, ReplicaInfoBlob, ReplicaMetadata};
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    fn configuration(ids: &[&str]) -> RaftConfiguration {
        let peers = ids.iter().map(|id| {
            ReplicaMetadata::new(
                ReplicaId::new(*id),
                Ipv4Addr::LOCALHOST,
                9000,
                ReplicaInfoBlob::new(0),
                0,
                PeerRole::Voter,
            )
        });
        RaftConfiguration::new_stable(None, PeerConfiguration::new(peers))
    }

    #[test]
    fn lease_needs_majority_of_recent_acks() {
        let start = Instant::now();
        let lease = LeaderLease::new(start, Duration::from_millis(400), Duration::from_millis(500));
        let conf = configuration(&["me", "a", "b", "c", "d"]);
        let me = ReplicaId::new("me");
        let now = start + Duration::from_secs(1);

        let mut acks = HashMap::new();
        acks.insert(ReplicaId::new("a"), now - Duration::from_millis(100));
        // Too old to count.
        acks.insert(ReplicaId::new("b"), now - Duration::from_millis(450));
        assert!(!lease.is_valid(&conf, &me, now, |id| acks.get(id).copied()));

        acks.insert(ReplicaId::new("c"), now - Duration::from_millis(399));
        assert!(lease.is_valid(&conf, &me, now, |id| acks.get(id).copied()));
    }

    #[test]
    fn step_down_after_losing_majority() {
        let start = Instant::now();
        let timeout = Duration::from_millis(500);
        let lease = LeaderLease::new(start, timeout / 2, timeout);
        let conf = configuration(&["me", "a", "b"]);
        let me = ReplicaId::new("me");
        let no_acks = |_: &ReplicaId| None;

        // Grace period right after being elected.
        assert!(!lease.has_lost_majority(&conf, &me, start + timeout / 2, no_acks));
        assert!(lease.has_lost_majority(&conf, &me, start + timeout, no_acks));

        let acked = start + timeout;
        assert!(!lease.has_lost_majority(&conf, &me, start + timeout * 3 / 2, |id| {
            if id.as_str() == "a" {
                Some(acked)
            } else {
                None
            }
        }));
    }

    #[test]
    fn single_voter_always_has_majority() {
        let start = Instant::now();
        let lease = LeaderLease::new(start, Duration::from_millis(10), Duration::from_millis(20));
        let conf = configuration(&["me"]);
        let me = ReplicaId::new("me");

        let later = start + Duration::from_secs(10);
        assert!(lease.is_valid(&conf, &me, later, |_| None));
        assert!(!lease.has_lost_majority(&conf, &me, later, |_| None));
    }
}
