use crate::commitlog::Index;
use crate::replica::configuration::RaftConfiguration;
use crate::replica::peers::ReplicaId;
use std::collections::BTreeMap;

/// ConfigurationManager is the history of configurations this replica knows about, keyed by the
/// log index that introduced each one. A configuration takes effect as soon as its entry is in the
/// local log, so the latest one is always the one in use; older ones are kept so that truncating a
/// configuration entry can fall back to whatever was in effect before it.
pub(crate) struct ConfigurationManager {
    initial: RaftConfiguration,
    configurations: BTreeMap<Index, RaftConfiguration>,
}

impl ConfigurationManager {
    pub(crate) fn new(initial: RaftConfiguration) -> Self {
        ConfigurationManager {
            initial,
            configurations: BTreeMap::new(),
        }
    }

    /// Records a configuration appended to the log at `log_index`.
    pub(crate) fn add_configuration(&mut self, log_index: Index, configuration: RaftConfiguration) {
        self.configurations
            .insert(log_index, configuration.with_log_index(log_index));
    }

    /// The latest configuration, which is the one in effect.
    pub(crate) fn current(&self) -> &RaftConfiguration {
        self.configurations
            .values()
            .next_back()
            .unwrap_or(&self.initial)
    }

    /// The configuration in effect when the entry at `index` was the last one in the log.
    pub(crate) fn configuration_at(&self, index: Option<Index>) -> &RaftConfiguration {
        match index {
            None => &self.initial,
            Some(index) => self
                .configurations
                .range(..=index)
                .next_back()
                .map(|(_, conf)| conf)
                .unwrap_or(&self.initial),
        }
    }

    /// The latest configuration whose entry is committed.
    pub(crate) fn committed(&self, commit_index: Option<Index>) -> &RaftConfiguration {
        self.configuration_at(commit_index)
    }

    /// A membership change is in flight if the latest configuration is joint or hasn't committed.
    pub(crate) fn is_transitioning(&self, commit_index: Option<Index>) -> bool {
        let current = self.current();
        current.is_joint() || current.log_index() > commit_index
    }

    /// True once a committed configuration no longer includes `me`, after an earlier one did. A
    /// replica that never belonged (e.g. still catching up to join) is not considered removed.
    pub(crate) fn was_removed(&self, me: &ReplicaId, commit_index: Option<Index>) -> bool {
        let committed = self.committed(commit_index);
        if committed.log_index().is_none() || committed.contains(me) {
            return false;
        }

        self.initial.contains(me)
            || self
                .configurations
                .range(..committed.log_index().unwrap_or_else(Index::start_index))
                .any(|(_, conf)| conf.contains(me))
    }

    /// Forgets configurations at `index` or later, used when the log suffix is truncated.
    pub(crate) fn remove_configurations_from(&mut self, index: Index) {
        self.configurations.split_off(&index);
    }

    /// Forgets history older than the configuration in effect at `index`, used after the log has
    /// been compacted through `index`.
    pub(crate) fn compact_through(&mut self, index: Index) {
        let in_effect = self.configuration_at(Some(index)).clone();
        self.configurations = self.configurations.split_off(&index.plus(1));
        self.initial = in_effect;
    }

    /// Replaces all history with the configuration carried by an installed snapshot.
    pub(crate) fn reset(&mut self, configuration: RaftConfiguration) {
        self.configurations.clear();
        match configuration.log_index() {
            Some(log_index) => {
                self.configurations.insert(log_index, configuration);
            }
            None => self.initial = configuration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::configuration::PeerConfiguration;
    use crate::replica::peers::{PeerRole, ReplicaId, ReplicaInfoBlob, ReplicaMetadata};
    use std::net::Ipv4Addr;

    fn conf(ids: &[&str]) -> RaftConfiguration {
        RaftConfiguration::new_stable(
            None,
            PeerConfiguration::new(ids.iter().map(|id| {
                ReplicaMetadata::new(
                    ReplicaId::new(*id),
                    Ipv4Addr::LOCALHOST,
                    1,
                    ReplicaInfoBlob::new(0),
                    0,
                    PeerRole::Voter,
                )
            })),
        )
    }

    fn members(c: &RaftConfiguration) -> Vec<String> {
        c.all_peers().iter().map(|p| p.replica_id().as_str().to_string()).collect()
    }

    #[test]
    fn lookup_by_index() {
        let mut manager = ConfigurationManager::new(conf(&["a", "b", "c"]));
        manager.add_configuration(Index::new(5), conf(&["a", "b", "c", "d"]));
        manager.add_configuration(Index::new(9), conf(&["a", "b", "d"]));

        assert_eq!(members(manager.current()), vec!["a", "b", "d"]);
        assert_eq!(manager.current().log_index(), Some(Index::new(9)));
        assert_eq!(members(manager.configuration_at(Some(Index::new(4)))), vec!["a", "b", "c"]);
        assert_eq!(members(manager.configuration_at(Some(Index::new(5)))), vec!["a", "b", "c", "d"]);
        assert_eq!(members(manager.configuration_at(Some(Index::new(8)))), vec!["a", "b", "c", "d"]);
        assert_eq!(members(manager.committed(None)), vec!["a", "b", "c"]);

        assert!(manager.is_transitioning(Some(Index::new(8))));
        assert!(!manager.is_transitioning(Some(Index::new(9))));
    }

    #[test]
    fn truncation_reverts_configuration() {
        let mut manager = ConfigurationManager::new(conf(&["a", "b", "c"]));
        manager.add_configuration(Index::new(5), conf(&["a", "b", "c", "d"]));
        manager.add_configuration(Index::new(9), conf(&["a", "b", "d"]));

        manager.remove_configurations_from(Index::new(9));
        assert_eq!(members(manager.current()), vec!["a", "b", "c", "d"]);

        manager.remove_configurations_from(Index::new(2));
        assert_eq!(members(manager.current()), vec!["a", "b", "c"]);
    }

    #[test]
    fn compaction_keeps_configuration_in_effect() {
        let mut manager = ConfigurationManager::new(conf(&["a"]));
        manager.add_configuration(Index::new(3), conf(&["a", "b"]));
        manager.add_configuration(Index::new(7), conf(&["a", "b", "c"]));

        manager.compact_through(Index::new(5));
        assert_eq!(members(manager.configuration_at(Some(Index::new(6)))), vec!["a", "b"]);
        assert_eq!(members(manager.current()), vec!["a", "b", "c"]);
    }

    #[test]
    fn removal_only_counts_once_committed() {
        let me = ReplicaId::new("c");
        let mut manager = ConfigurationManager::new(conf(&["a", "b", "c"]));
        manager.add_configuration(Index::new(4), conf(&["a", "b"]));

        assert!(!manager.was_removed(&me, Some(Index::new(3))));
        assert!(manager.was_removed(&me, Some(Index::new(4))));
        assert!(!manager.was_removed(&ReplicaId::new("a"), Some(Index::new(4))));

        // Never a member, so never removed.
        let mut joining = ConfigurationManager::new(conf(&["a", "b"]));
        joining.add_configuration(Index::new(2), conf(&["a", "b"]));
        assert!(!joining.was_removed(&me, Some(Index::new(2))));
    }

    #[test]
    fn reset_from_snapshot() {
        let mut manager = ConfigurationManager::new(conf(&["a"]));
        manager.add_configuration(Index::new(3), conf(&["a", "b"]));

        manager.reset(conf(&["x", "y"]).with_log_index(Index::new(20)));
        assert_eq!(members(manager.current()), vec!["x", "y"]);
        assert_eq!(manager.current().log_index(), Some(Index::new(20)));
    }
}
