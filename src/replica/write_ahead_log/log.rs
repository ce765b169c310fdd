use crate::commitlog;
use crate::commitlog::Index;
use crate::replica::configuration::{ConfigurationManager, RaftConfiguration};
use crate::replica::snapshot::Snapshot;
use crate::replica::{Term, TermIndex, WriteAheadLogEntry};
use std::io;

/// A committed entry on its way to the state machine.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct CommittedEntry {
    pub(crate) index: Index,
    pub(crate) entry: WriteAheadLogEntry,
}

/// WriteAheadLog is the raft-specific log facade.
///
/// Note: A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - written to disk, not yet replicated to majority
/// 2. Committed - written to disk, replicated to majority
/// 3. Applied - a committed entry that has also been applied to the state machine
///
/// A log entry's state has no global truth. Each replica will have their own local view of what
/// state the log entry is in.
///
/// Entries before `first_index()` have been compacted into a snapshot. The snapshot's last
/// included entry still answers `term_at()`, so consistency checks work across the boundary.
pub(crate) struct WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    // Application's info/debug log.
    logger: slog::Logger,

    // This is the log that we're replicating.
    log: L,
    // Highest entry that we've locally written. Updated only after the underlying log succeeds.
    latest_entry: Option<TermIndex>,
    // Last entry covered by the most recent snapshot, if the log has been compacted.
    snapshot_last_included: Option<TermIndex>,

    // Every configuration found in the retained log, plus whatever was in effect before it.
    configurations: ConfigurationManager,

    // Index of highest log entry known to be committed. None if nothing is committed.
    commit_index: Option<Index>,
    // Index of highest committed entry handed to the state machine updater.
    last_published_index: Option<Index>,
}

impl<L> WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    /// Wraps a log that may already contain entries (from before a restart). Configuration
    /// entries found in it are replayed so the latest one is in effect immediately.
    pub(crate) fn new(logger: slog::Logger, log: L, initial_configuration: RaftConfiguration) -> io::Result<Self> {
        if log.first_index() != Index::start_index() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Log starts at {:?} but no snapshot is available to cover the earlier entries",
                    log.first_index()
                ),
            ));
        }

        let mut configurations = ConfigurationManager::new(initial_configuration);
        let mut latest_entry = None;
        let mut index = log.first_index();
        while index < log.next_index() {
            let entry = Self::read_required_from(&log, index)?;
            if let Some(configuration) = entry.configuration() {
                configurations.add_configuration(index, configuration.clone());
            }
            latest_entry = Some(TermIndex::new(entry.term, index));
            index = index.plus(1);
        }

        if let Some(latest) = latest_entry {
            slog::info!(logger, "Recovered log through {:?}", latest);
        }

        Ok(WriteAheadLog {
            logger,
            log,
            latest_entry,
            snapshot_last_included: None,
            configurations,
            commit_index: None,
            last_published_index: None,
        })
    }

    pub(crate) fn latest_entry(&self) -> Option<TermIndex> {
        self.latest_entry.or(self.snapshot_last_included)
    }

    pub(crate) fn first_index(&self) -> Index {
        self.log.first_index()
    }

    pub(crate) fn next_index(&self) -> Index {
        self.log.next_index()
    }

    pub(crate) fn snapshot_last_included(&self) -> Option<TermIndex> {
        self.snapshot_last_included
    }

    pub(crate) fn configurations(&self) -> &ConfigurationManager {
        &self.configurations
    }

    /// The configuration in effect: the latest one in the log, committed or not.
    pub(crate) fn current_configuration(&self) -> &RaftConfiguration {
        self.configurations.current()
    }

    pub(crate) fn read(&self, index: Index) -> Result<Option<WriteAheadLogEntry>, io::Error> {
        self.log.read(index)
    }

    fn read_required_from(log: &L, index: Index) -> Result<WriteAheadLogEntry, io::Error> {
        log.read(index)?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("No log entry at index {:?}", index),
            )
        })
    }

    /// Term of the entry at `index`. `None` if we don't have that entry (never written, or
    /// compacted away and not the snapshot boundary).
    pub(crate) fn term_at(&self, index: Index) -> Result<Option<Term>, io::Error> {
        if let Some(snapshot) = self.snapshot_last_included {
            if snapshot.index == index {
                return Ok(Some(snapshot.term));
            }
        }

        Ok(self.log.read(index)?.map(|entry| entry.term))
    }

    /// Up to `max_entries` entries starting at `start`. Stops early at the end of the log.
    pub(crate) fn entries_from(&self, start: Index, max_entries: usize) -> Result<Vec<WriteAheadLogEntry>, io::Error> {
        let mut entries = Vec::new();
        let mut index = start;
        while entries.len() < max_entries && index < self.log.next_index() {
            entries.push(Self::read_required_from(&self.log, index)?);
            index = index.plus(1);
        }

        Ok(entries)
    }

    /// Remove anything starting at `index` and later. Committed entries are never removed.
    pub(crate) fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        if matches!(self.commit_index, Some(ci) if index <= ci) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Refusing to truncate at {:?}, at or below commit index {:?}",
                    index, self.commit_index
                ),
            ));
        }

        let mut new_latest_entry = None;
        if let Some(new_latest_index) = index.checked_minus(1) {
            new_latest_entry = self
                .read(new_latest_index)?
                .map(|latest_entry| TermIndex::new(latest_entry.term, new_latest_index));
        }

        // Only update state after we've successfully read what the new state will be.
        self.log.truncate(index)?;
        slog::info!(self.logger, "Truncated log from {:?}", index);

        self.latest_entry = new_latest_entry;
        self.configurations.remove_configurations_from(index);
        Ok(())
    }

    pub(crate) fn append(&mut self, entry: WriteAheadLogEntry) -> Result<Index, io::Error> {
        let appended_term = entry.term;
        let configuration = entry.configuration().cloned();
        let appended_index = self.log.append(entry)?;

        // Only update state after log action completes.
        self.latest_entry = Some(TermIndex::new(appended_term, appended_index));
        if let Some(configuration) = configuration {
            slog::info!(self.logger, "Configuration {:?} in effect from {:?}", configuration, appended_index);
            self.configurations.add_configuration(appended_index, configuration);
        }

        Ok(appended_index)
    }

    pub(crate) fn flush(&mut self) -> Result<(), io::Error> {
        self.log.flush()
    }

    pub(crate) fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }

    /// Leader-side commit. Returns true if the commit index moved.
    pub(crate) fn ratchet_fwd_commit_index_if_valid(
        &mut self,
        tentative_new_commit_index: Index,
        current_term: Term,
    ) -> Result<bool, io::Error> {
        if matches!(self.commit_index, Some(ci) if tentative_new_commit_index <= ci) {
            return Ok(false);
        }

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        match self.term_at(tentative_new_commit_index)? {
            Some(term) if term == current_term => Ok(self.ratchet_fwd_commit_index_if_changed(tentative_new_commit_index)),
            _ => Ok(false),
        }
    }

    /// Follower-side commit. The index is clamped to our latest entry, and never moves backwards.
    /// Returns true if the commit index moved.
    pub(crate) fn ratchet_fwd_commit_index_if_changed(&mut self, new_commit_index: Index) -> bool {
        let new_commit_index = match self.latest_entry() {
            Some(latest) => new_commit_index.min(latest.index),
            None => return false,
        };

        if matches!(self.commit_index, Some(ci) if new_commit_index <= ci) {
            return false;
        }

        self.commit_index.replace(new_commit_index);
        true
    }

    /// Every committed entry not yet published, in order.
    pub(crate) fn publish_committed_entries(&mut self) -> Result<Vec<CommittedEntry>, io::Error> {
        let commit_index = match self.commit_index {
            Some(ci) => ci,
            None => return Ok(Vec::new()),
        };

        let mut index = match self.last_published_index {
            Some(published) => published.plus(1),
            None => Index::start_index(),
        }
        .max(self.first_index());

        let mut committed = Vec::new();
        while index <= commit_index {
            committed.push(CommittedEntry {
                index,
                entry: Self::read_required_from(&self.log, index)?,
            });
            index = index.plus(1);
        }

        if !committed.is_empty() {
            self.last_published_index.replace(commit_index);
        }

        Ok(committed)
    }

    /// Drops every entry up to and including `through`, which a snapshot now covers.
    pub(crate) fn compact(&mut self, through: TermIndex) -> Result<(), io::Error> {
        if self.snapshot_last_included.map_or(false, |s| s.index >= through.index) {
            return Ok(());
        }
        if !matches!(self.last_published_index, Some(p) if p >= through.index) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Can't compact through {:?}, it hasn't been applied", through),
            ));
        }

        self.log.purge(through.index)?;
        self.snapshot_last_included.replace(through);
        self.configurations.compact_through(through.index);
        slog::info!(self.logger, "Compacted log through {:?}", through);

        Ok(())
    }

    /// Adopts a snapshot received from the leader. If our log already has the snapshot's last
    /// entry, the entries after it are kept; otherwise the whole log is discarded.
    pub(crate) fn reset_to_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), io::Error> {
        let last = snapshot.last_included;
        let matching_suffix = self.term_at(last.index)? == Some(last.term)
            && self.latest_entry.map_or(false, |latest| latest.index > last.index);

        if matching_suffix {
            self.log.purge(last.index)?;
            self.configurations.compact_through(last.index);
        } else {
            self.log.reset(last.index.plus(1))?;
            self.latest_entry = None;
            self.configurations.reset(snapshot.configuration.clone());
        }

        self.snapshot_last_included.replace(last);
        if !matches!(self.commit_index, Some(ci) if ci >= last.index) {
            self.commit_index.replace(last.index);
        }
        if !matches!(self.last_published_index, Some(p) if p >= last.index) {
            self.last_published_index.replace(last.index);
        }

        slog::info!(
            self.logger,
            "Installed snapshot through {:?}, kept suffix: {}",
            last,
            matching_suffix
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::InMemoryLog;
    use crate::replica::configuration::PeerConfiguration;
    use crate::replica::AppliedInvocations;
    use crate::replica::peers::{PeerRole, ReplicaId, ReplicaInfoBlob, ReplicaMetadata};
    use crate::replica::write_ahead_log::EntryPayload;
    use bytes::Bytes;
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

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn wal() -> WriteAheadLog<InMemoryLog<WriteAheadLogEntry>> {
        let log = InMemoryLog::create(logger()).unwrap();
        WriteAheadLog::new(logger(), log, conf(&["a", "b", "c"])).unwrap()
    }

    fn noop(term: u64) -> WriteAheadLogEntry {
        WriteAheadLogEntry {
            term: Term::new(term),
            payload: EntryPayload::NoOp,
        }
    }

    fn ti(term: u64, index: u64) -> TermIndex {
        TermIndex::new(Term::new(term), Index::new(index))
    }

    #[test]
    fn commit_only_in_current_term() {
        let mut wal = wal();
        wal.append(noop(1)).unwrap();
        wal.append(noop(2)).unwrap();

        assert!(!wal.ratchet_fwd_commit_index_if_valid(Index::new(1), Term::new(2)).unwrap());
        assert_eq!(wal.commit_index(), None);

        assert!(wal.ratchet_fwd_commit_index_if_valid(Index::new(2), Term::new(2)).unwrap());
        assert_eq!(wal.commit_index(), Some(Index::new(2)));

        // Never backwards.
        assert!(!wal.ratchet_fwd_commit_index_if_changed(Index::new(1)));
        assert_eq!(wal.commit_index(), Some(Index::new(2)));
    }

    #[test]
    fn follower_commit_is_clamped_to_log() {
        let mut wal = wal();
        assert!(!wal.ratchet_fwd_commit_index_if_changed(Index::new(5)));
        wal.append(noop(1)).unwrap();
        assert!(wal.ratchet_fwd_commit_index_if_changed(Index::new(5)));
        assert_eq!(wal.commit_index(), Some(Index::new(1)));
    }

    #[test]
    fn truncate_reverts_configuration_and_protects_commits() {
        let mut wal = wal();
        wal.append(noop(1)).unwrap();
        wal.append(WriteAheadLogEntry {
            term: Term::new(1),
            payload: EntryPayload::Configuration(conf(&["a", "b"])),
        })
        .unwrap();
        assert_eq!(wal.current_configuration().log_index(), Some(Index::new(2)));

        wal.ratchet_fwd_commit_index_if_changed(Index::new(1));
        assert!(wal.truncate(Index::new(1)).is_err());

        wal.truncate(Index::new(2)).unwrap();
        assert_eq!(wal.latest_entry(), Some(ti(1, 1)));
        assert_eq!(wal.current_configuration().log_index(), None);
    }

    #[test]
    fn publish_each_committed_entry_once() {
        let mut wal = wal();
        for _ in 0..3 {
            wal.append(noop(1)).unwrap();
        }
        wal.ratchet_fwd_commit_index_if_changed(Index::new(2));
        let published: Vec<Index> = wal.publish_committed_entries().unwrap().iter().map(|c| c.index).collect();
        assert_eq!(published, vec![Index::new(1), Index::new(2)]);
        assert!(wal.publish_committed_entries().unwrap().is_empty());

        wal.ratchet_fwd_commit_index_if_changed(Index::new(3));
        let published: Vec<Index> = wal.publish_committed_entries().unwrap().iter().map(|c| c.index).collect();
        assert_eq!(published, vec![Index::new(3)]);
    }

    #[test]
    fn compaction_keeps_boundary_term() {
        let mut wal = wal();
        for term in &[1, 1, 2, 2] {
            wal.append(noop(*term)).unwrap();
        }
        // Can't compact what hasn't been applied.
        assert!(wal.compact(ti(1, 2)).is_err());

        wal.ratchet_fwd_commit_index_if_changed(Index::new(3));
        wal.publish_committed_entries().unwrap();
        wal.compact(ti(2, 3)).unwrap();

        assert_eq!(wal.first_index(), Index::new(4));
        assert_eq!(wal.term_at(Index::new(3)).unwrap(), Some(Term::new(2)));
        assert_eq!(wal.term_at(Index::new(2)).unwrap(), None);
        assert_eq!(wal.latest_entry(), Some(ti(2, 4)));
    }

    #[test]
    fn install_snapshot_discards_conflicting_log() {
        let mut wal = wal();
        wal.append(noop(1)).unwrap();
        wal.append(noop(1)).unwrap();

        let snapshot = Snapshot {
            last_included: ti(3, 10),
            configuration: conf(&["x", "y", "z"]).with_log_index(Index::new(8)),
            applied_invocations: AppliedInvocations::default(),
            data: Bytes::from_static(b"state"),
        };
        wal.reset_to_snapshot(&snapshot).unwrap();

        assert_eq!(wal.latest_entry(), Some(ti(3, 10)));
        assert_eq!(wal.next_index(), Index::new(11));
        assert_eq!(wal.commit_index(), Some(Index::new(10)));
        assert!(wal.publish_committed_entries().unwrap().is_empty());
        assert!(wal.current_configuration().contains(&ReplicaId::new("x")));
    }

    #[test]
    fn install_snapshot_keeps_matching_suffix() {
        let mut wal = wal();
        for _ in 0..4 {
            wal.append(noop(1)).unwrap();
        }

        let snapshot = Snapshot {
            last_included: ti(1, 2),
            configuration: conf(&["a", "b", "c"]),
            applied_invocations: AppliedInvocations::default(),
            data: Bytes::new(),
        };
        wal.reset_to_snapshot(&snapshot).unwrap();

        assert_eq!(wal.first_index(), Index::new(3));
        assert_eq!(wal.latest_entry(), Some(ti(1, 4)));
        assert_eq!(wal.commit_index(), Some(Index::new(2)));
    }

    #[test]
    fn restart_replays_configurations() {
        let mut log = InMemoryLog::create(logger()).unwrap();
        commitlog::Log::append(&mut log, noop(1)).unwrap();
        commitlog::Log::append(
            &mut log,
            WriteAheadLogEntry {
                term: Term::new(2),
                payload: EntryPayload::Configuration(conf(&["a", "d"])),
            },
        )
        .unwrap();

        let wal = WriteAheadLog::new(logger(), log, conf(&["a", "b", "c"])).unwrap();
        assert_eq!(wal.latest_entry(), Some(ti(2, 2)));
        assert!(wal.current_configuration().contains(&ReplicaId::new("d")));
        assert_eq!(wal.commit_index(), None);
    }
}
