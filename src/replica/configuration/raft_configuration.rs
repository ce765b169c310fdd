use crate::commitlog::Index;
use crate::replica::peers::{ReplicaId, ReplicaMetadata};
use std::collections::BTreeMap;

/// PeerConfiguration is one set of cluster members. Only voters count towards a majority.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct PeerConfiguration {
    peers: BTreeMap<ReplicaId, ReplicaMetadata>,
}

impl PeerConfiguration {
    pub(crate) fn new(peers: impl IntoIterator<Item = ReplicaMetadata>) -> Self {
        PeerConfiguration {
            peers: peers
                .into_iter()
                .map(|peer| (peer.replica_id().clone(), peer))
                .collect(),
        }
    }

    pub(crate) fn peers(&self) -> impl Iterator<Item = &ReplicaMetadata> {
        self.peers.values()
    }

    pub(crate) fn get(&self, replica_id: &ReplicaId) -> Option<&ReplicaMetadata> {
        self.peers.get(replica_id)
    }

    pub(crate) fn contains(&self, replica_id: &ReplicaId) -> bool {
        self.peers.contains_key(replica_id)
    }

    pub(crate) fn is_voter(&self, replica_id: &ReplicaId) -> bool {
        matches!(self.peers.get(replica_id), Some(peer) if peer.is_voter())
    }

    pub(crate) fn voters(&self) -> impl Iterator<Item = &ReplicaId> {
        self.peers.values().filter(|p| p.is_voter()).map(|p| p.replica_id())
    }

    pub(crate) fn num_voters(&self) -> usize {
        self.voters().count()
    }

    fn majority(&self) -> usize {
        (self.num_voters() / 2) + 1
    }

    /// True if more than half of the voters satisfy `predicate`. A set with no voters never has a
    /// majority.
    fn has_majority(&self, predicate: impl Fn(&ReplicaId) -> bool) -> bool {
        let num_voters = self.num_voters();
        num_voters > 0 && self.voters().filter(|id| predicate(id)).count() >= self.majority()
    }

    /// True if enough voters satisfy `predicate` that a majority is no longer reachable.
    fn has_rejecting_majority(&self, predicate: impl Fn(&ReplicaId) -> bool) -> bool {
        let num_voters = self.num_voters();
        let rejections = self.voters().filter(|id| predicate(id)).count();
        num_voters - rejections < self.majority()
    }

    /// Highest index N such that a majority of voters have matched N or more.
    fn quorum_index(&self, matched: impl Fn(&ReplicaId) -> Option<Index>) -> Option<Index> {
        let mut matched_indexes: Vec<Option<Index>> = self.voters().map(|id| matched(id)).collect();
        if matched_indexes.is_empty() {
            return None;
        }

        // Descending; `None` sorts lowest. The majority-th highest value is replicated on at least
        // a majority of voters.
        matched_indexes.sort_by(|a, b| b.cmp(a));
        matched_indexes[self.majority() - 1]
    }
}

/// RaftConfiguration is an immutable view of cluster membership. During a membership change it's
/// a joint configuration (`old` present), and every decision needs a majority of both halves.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct RaftConfiguration {
    // Log index of the entry that introduced this configuration. None for the bootstrap
    // configuration that every member is started with.
    log_index: Option<Index>,
    current: PeerConfiguration,
    old: Option<PeerConfiguration>,
}

impl RaftConfiguration {
    pub(crate) fn new(log_index: Option<Index>, current: PeerConfiguration, old: Option<PeerConfiguration>) -> Self {
        RaftConfiguration {
            log_index,
            current,
            old,
        }
    }

    pub(crate) fn new_stable(log_index: Option<Index>, current: PeerConfiguration) -> Self {
        Self::new(log_index, current, None)
    }

    pub(crate) fn with_log_index(mut self, log_index: Index) -> Self {
        self.log_index = Some(log_index);
        self
    }

    pub(crate) fn log_index(&self) -> Option<Index> {
        self.log_index
    }

    pub(crate) fn current(&self) -> &PeerConfiguration {
        &self.current
    }

    pub(crate) fn old(&self) -> Option<&PeerConfiguration> {
        self.old.as_ref()
    }

    pub(crate) fn is_joint(&self) -> bool {
        self.old.is_some()
    }

    /// The configuration that finishes a membership change started by this joint configuration.
    pub(crate) fn to_new_only(&self) -> RaftConfiguration {
        Self::new(None, self.current.clone(), None)
    }

    pub(crate) fn contains(&self, replica_id: &ReplicaId) -> bool {
        self.current.contains(replica_id) || self.old.as_ref().map_or(false, |old| old.contains(replica_id))
    }

    pub(crate) fn is_voter(&self, replica_id: &ReplicaId) -> bool {
        self.current.is_voter(replica_id) || self.old.as_ref().map_or(false, |old| old.is_voter(replica_id))
    }

    pub(crate) fn peer(&self, replica_id: &ReplicaId) -> Option<&ReplicaMetadata> {
        self.current
            .get(replica_id)
            .or_else(|| self.old.as_ref().and_then(|old| old.get(replica_id)))
    }

    /// Every member of either half, without duplicates. `current` wins if a member is in both.
    pub(crate) fn all_peers(&self) -> Vec<&ReplicaMetadata> {
        let mut all: BTreeMap<&ReplicaId, &ReplicaMetadata> = BTreeMap::new();
        if let Some(old) = &self.old {
            for peer in old.peers() {
                all.insert(peer.replica_id(), peer);
            }
        }
        for peer in self.current.peers() {
            all.insert(peer.replica_id(), peer);
        }

        all.into_iter().map(|(_, peer)| peer).collect()
    }

    /// Every member except `me`.
    pub(crate) fn other_peers(&self, me: &ReplicaId) -> Vec<ReplicaMetadata> {
        self.all_peers()
            .into_iter()
            .filter(|peer| peer.replica_id() != me)
            .cloned()
            .collect()
    }

    pub(crate) fn has_majority(&self, predicate: impl Fn(&ReplicaId) -> bool) -> bool {
        self.current.has_majority(&predicate) && self.old.as_ref().map_or(true, |old| old.has_majority(&predicate))
    }

    /// True once either half can no longer reach a majority of non-rejecting voters.
    pub(crate) fn has_rejecting_majority(&self, predicate: impl Fn(&ReplicaId) -> bool) -> bool {
        self.current.has_rejecting_majority(&predicate)
            || self.old.as_ref().map_or(false, |old| old.has_rejecting_majority(&predicate))
    }

    /// Highest index replicated on a majority of each half.
    pub(crate) fn quorum_index(&self, matched: impl Fn(&ReplicaId) -> Option<Index>) -> Option<Index> {
        let current = self.current.quorum_index(&matched);
        match &self.old {
            None => current,
            Some(old) => std::cmp::min(current, old.quorum_index(&matched)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::peers::{PeerRole, ReplicaInfoBlob};
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    fn peer(id: &str, role: PeerRole) -> ReplicaMetadata {
        ReplicaMetadata::new(
            ReplicaId::new(id),
            Ipv4Addr::LOCALHOST,
            9000,
            ReplicaInfoBlob::new(0),
            0,
            role,
        )
    }

    fn voters(ids: &[&str]) -> PeerConfiguration {
        PeerConfiguration::new(ids.iter().map(|id| peer(id, PeerRole::Voter)))
    }

    fn opt_index(v: u64) -> Option<Index> {
        Index::from_u64_or_none(v)
    }

    #[test]
    fn test_commit_checker_logic() {
        // Leader is "L" and is always at least as far along as every peer.
        fn run(expected: u64, matches: Vec<u64>) {
            let mut ids = vec!["L".to_string()];
            let mut matched = HashMap::new();
            matched.insert(ReplicaId::new("L"), opt_index(10));
            for (i, m) in matches.into_iter().enumerate() {
                let id = format!("p{}", i);
                matched.insert(ReplicaId::new(id.clone()), opt_index(m));
                ids.push(id);
            }
            let config = RaftConfiguration::new_stable(
                None,
                PeerConfiguration::new(ids.iter().map(|id| peer(id, PeerRole::Voter))),
            );

            let actual = config.quorum_index(|id| matched.get(id).cloned().flatten());
            assert_eq!(opt_index(expected), actual);
        }

        // 3-cluster
        run(0, vec![0, 0]);
        run(9, vec![0, 9]);
        run(9, vec![8, 9]);

        // 4-cluster
        run(0, vec![0, 0, 0]);
        run(0, vec![0, 0, 9]);
        run(8, vec![0, 8, 9]);
        run(8, vec![7, 8, 9]);

        // 5-cluster
        run(0, vec![0, 0, 0, 0]);
        run(0, vec![0, 0, 0, 9]);
        run(8, vec![0, 0, 8, 9]);
        run(8, vec![0, 7, 8, 9]);
        run(8, vec![6, 7, 8, 9]);

        // 6-cluster
        run(0, vec![0, 0, 0, 0, 0]);
        run(0, vec![0, 0, 0, 0, 9]);
        run(0, vec![0, 0, 0, 8, 9]);
        run(7, vec![0, 0, 7, 8, 9]);
        run(7, vec![0, 6, 7, 8, 9]);
        run(7, vec![5, 6, 7, 8, 9]);

        // 7-cluster
        run(0, vec![0, 0, 0, 0, 0, 0]);
        run(0, vec![0, 0, 0, 0, 0, 9]);
        run(0, vec![0, 0, 0, 0, 8, 9]);
        run(7, vec![0, 0, 0, 7, 8, 9]);
        run(7, vec![0, 0, 6, 7, 8, 9]);
        run(7, vec![0, 5, 6, 7, 8, 9]);
        run(7, vec![4, 5, 6, 7, 8, 9]);

        // Ordering doesn't matter
        run(9, vec![9, 8]);
        run(8, vec![7, 9, 8]);
        run(8, vec![6, 0, 8, 9]);
        run(7, vec![9, 8, 0, 0, 7]);
    }

    #[test]
    fn joint_quorum_needs_both_halves() {
        let joint = RaftConfiguration::new(Some(Index::new(4)), voters(&["a", "d", "e"]), Some(voters(&["a", "b", "c"])));

        let matched = |id: &ReplicaId| match id.as_str() {
            "a" => opt_index(9),
            "b" => opt_index(9),
            "c" => opt_index(9),
            "d" => opt_index(3),
            "e" => None,
            _ => None,
        };

        // Old half alone would commit 9, new half only reaches 3.
        assert_eq!(joint.quorum_index(matched), opt_index(3));

        let granted = |id: &ReplicaId| ["a", "b"].contains(&id.as_str());
        assert!(!joint.has_majority(granted));
        let granted = |id: &ReplicaId| ["a", "b", "d"].contains(&id.as_str());
        assert!(joint.has_majority(granted));
    }

    #[test]
    fn listeners_are_not_counted() {
        let config = RaftConfiguration::new_stable(
            None,
            PeerConfiguration::new(vec![
                peer("a", PeerRole::Voter),
                peer("b", PeerRole::Voter),
                peer("c", PeerRole::Voter),
                peer("l1", PeerRole::Listener),
                peer("l2", PeerRole::Listener),
            ]),
        );

        assert!(config.has_majority(|id| ["a", "b"].contains(&id.as_str())));
        assert!(!config.has_majority(|id| ["a", "l1", "l2"].contains(&id.as_str())));
        assert!(config.contains(&ReplicaId::new("l1")));
        assert!(!config.is_voter(&ReplicaId::new("l1")));
    }

    #[test]
    fn rejecting_majority() {
        let config = RaftConfiguration::new_stable(None, voters(&["a", "b", "c", "d", "e"]));
        assert!(!config.has_rejecting_majority(|id| ["a", "b"].contains(&id.as_str())));
        assert!(config.has_rejecting_majority(|id| ["a", "b", "c"].contains(&id.as_str())));

        let joint = RaftConfiguration::new(None, voters(&["a", "d", "e"]), Some(voters(&["a", "b", "c"])));
        // Losing the new half is enough.
        assert!(joint.has_rejecting_majority(|id| ["d", "e"].contains(&id.as_str())));
    }

    #[test]
    fn all_peers_deduplicates_halves() {
        let joint = RaftConfiguration::new(None, voters(&["a", "d"]), Some(voters(&["a", "b"])));
        let ids: Vec<_> = joint.all_peers().into_iter().map(|p| p.replica_id().as_str().to_string()).collect();
        assert_eq!(ids, vec!["a", "b", "d"]);
        assert_eq!(joint.other_peers(&ReplicaId::new("a")).len(), 2);
    }
}
