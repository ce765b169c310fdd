use crate::actor::{Callback, WeakActorClient};
use crate::api::{AppliedEntry, RaftEntryId, StateMachine, StateMachineError, StateMachineOutput};
use crate::commitlog::Index;
use crate::replica::applied_invocations::AppliedInvocations;
use crate::replica::configuration::RaftConfiguration;
use crate::replica::retry_cache::RetryCache;
use crate::replica::snapshot::Snapshot;
use crate::replica::write_ahead_log::{CommittedEntry, EntryPayload};
use crate::replica::{
    ClientWriteOutput, EntryApplied, InstallSnapshotReply, RpcHandlerError, SnapshotInstalledLocally, Term, TermIndex,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

enum UpdaterCommand {
    Apply(Vec<CommittedEntry>),
    InstallSnapshot {
        snapshot: Arc<Snapshot>,
        leader_term: Term,
        request_index: u32,
        callback: Callback<InstallSnapshotReply, RpcHandlerError>,
    },
    Query {
        request: bytes::Bytes,
        reply: oneshot::Sender<Result<bytes::Bytes, StateMachineError>>,
    },
}

/// StateMachineUpdaterHandle feeds committed entries to the application's state machine, on a
/// task of its own so that a slow `apply()` never blocks the replica's event loop.
///
/// The updater owns the state machine. Everything that touches it (applying, snapshots, queries)
/// goes through the same queue, so it all happens in log order.
///
/// An entry that repeats an already applied client invocation is not applied again. That decision
/// only looks at the applied invocations table, which is a function of the log (and the snapshot
/// it started from), so every replica makes the same one.
#[derive(Clone)]
pub(crate) struct StateMachineUpdaterHandle {
    sender: mpsc::UnboundedSender<UpdaterCommand>,
    applied_index: watch::Receiver<Option<Index>>,
    latest_snapshot: watch::Receiver<Option<Arc<Snapshot>>>,
}

impl StateMachineUpdaterHandle {
    pub(crate) fn spawn<M: StateMachine>(
        logger: slog::Logger,
        state_machine: M,
        initial_configuration: RaftConfiguration,
        snapshot_threshold: Option<u64>,
        retry_cache: Arc<RetryCache>,
        actor_client: WeakActorClient,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (applied_tx, applied_rx) = watch::channel(None);
        let (snapshot_tx, snapshot_rx) = watch::channel(None);

        let updater = StateMachineUpdater {
            logger,
            state_machine,
            receiver,
            last_applied: None,
            applied_configuration: initial_configuration,
            applied_invocations: AppliedInvocations::default(),
            applied_since_snapshot: 0,
            snapshot_threshold,
            retry_cache,
            actor_client,
            applied_tx,
            snapshot_tx,
        };
        tokio::task::spawn(updater.run());

        StateMachineUpdaterHandle {
            sender,
            applied_index: applied_rx,
            latest_snapshot: snapshot_rx,
        }
    }

    pub(crate) fn apply(&self, entries: Vec<CommittedEntry>) {
        if !entries.is_empty() {
            let _ = self.sender.send(UpdaterCommand::Apply(entries));
        }
    }

    pub(crate) fn install_snapshot(
        &self,
        snapshot: Arc<Snapshot>,
        leader_term: Term,
        request_index: u32,
        callback: Callback<InstallSnapshotReply, RpcHandlerError>,
    ) {
        let command = UpdaterCommand::InstallSnapshot {
            snapshot,
            leader_term,
            request_index,
            callback,
        };
        if let Err(mpsc::error::SendError(command)) = self.sender.send(command) {
            if let UpdaterCommand::InstallSnapshot { callback, .. } = command {
                callback.send(Err(RpcHandlerError::Shutdown));
            }
        }
    }

    /// Waits until everything through `read_index` is applied, then runs `request` against the
    /// state machine.
    pub(crate) async fn query(
        &self,
        read_index: Option<Index>,
        request: bytes::Bytes,
    ) -> Result<bytes::Bytes, StateMachineError> {
        if let Some(read_index) = read_index {
            self.wait_for_applied(read_index).await?;
        }

        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(UpdaterCommand::Query { request, reply })
            .map_err(|_| updater_stopped())?;
        receiver.await.map_err(|_| updater_stopped())?
    }

    pub(crate) async fn wait_for_applied(&self, index: Index) -> Result<(), StateMachineError> {
        let mut applied = self.applied_index.clone();
        loop {
            if matches!(*applied.borrow(), Some(applied) if applied >= index) {
                return Ok(());
            }

            applied.changed().await.map_err(|_| updater_stopped())?;
        }
    }

    pub(crate) fn applied_index(&self) -> Option<Index> {
        *self.applied_index.borrow()
    }

    pub(crate) fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.latest_snapshot.borrow().clone()
    }
}

fn updater_stopped() -> StateMachineError {
    StateMachineError::new("State machine updater has stopped")
}

struct StateMachineUpdater<M: StateMachine> {
    logger: slog::Logger,
    state_machine: M,
    receiver: mpsc::UnboundedReceiver<UpdaterCommand>,

    last_applied: Option<TermIndex>,
    // The latest configuration among applied entries, which is what a snapshot carries.
    applied_configuration: RaftConfiguration,
    applied_invocations: AppliedInvocations,
    applied_since_snapshot: u64,
    snapshot_threshold: Option<u64>,

    retry_cache: Arc<RetryCache>,
    actor_client: WeakActorClient,
    applied_tx: watch::Sender<Option<Index>>,
    snapshot_tx: watch::Sender<Option<Arc<Snapshot>>>,
}

impl<M: StateMachine> StateMachineUpdater<M> {
    async fn run(mut self) {
        while let Some(command) = self.receiver.recv().await {
            let keep_running = match command {
                UpdaterCommand::Apply(entries) => self.apply_all(entries).await,
                UpdaterCommand::InstallSnapshot {
                    snapshot,
                    leader_term,
                    request_index,
                    callback,
                } => {
                    self.install_snapshot(snapshot, leader_term, request_index, callback).await;
                    true
                }
                UpdaterCommand::Query { request, reply } => {
                    let _ = reply.send(self.state_machine.query(request));
                    true
                }
            };

            if !keep_running {
                break;
            }
        }

        slog::info!(self.logger, "State machine updater exiting");
    }

    // Returns false if the state machine failed and we must stop.
    async fn apply_all(&mut self, entries: Vec<CommittedEntry>) -> bool {
        for committed in entries {
            if matches!(self.last_applied, Some(last) if committed.index <= last.index) {
                continue;
            }

            if let Err(e) = self.apply_one(committed).await {
                slog::error!(self.logger, "State machine failed to apply: {:?}", e);
                let _ = self.actor_client.notify_state_machine_failed(e.to_string()).await;
                return false;
            }

            if self.should_take_snapshot() {
                if let Err(e) = self.take_snapshot().await {
                    // Not fatal. We'll try again after the next entry.
                    slog::warn!(self.logger, "Failed to take snapshot: {:?}", e);
                }
            }
        }

        true
    }

    async fn apply_one(&mut self, committed: CommittedEntry) -> Result<(), StateMachineError> {
        let entry = TermIndex::new(committed.entry.term, committed.index);

        match committed.entry.payload {
            EntryPayload::NoOp => {}
            EntryPayload::Configuration(configuration) => {
                self.applied_configuration = configuration.with_log_index(committed.index);
            }
            EntryPayload::Application { invocation, data } => {
                let outcome = match self.applied_invocations.get(&invocation) {
                    Some(previous) => {
                        slog::info!(
                            self.logger,
                            "Skipping duplicate of {:?} at {:?}, already applied at {:?}",
                            invocation,
                            entry,
                            previous.entry
                        );
                        previous.clone()
                    }
                    None => {
                        let output = self.state_machine.apply(AppliedEntry {
                            entry_id: RaftEntryId {
                                term: entry.term,
                                entry_index: entry.index,
                            },
                            data,
                        })?;
                        let outcome = ClientWriteOutput { entry, output };
                        self.applied_invocations.record(invocation.clone(), outcome.clone());
                        outcome
                    }
                };

                // Lets a retry that reaches this replica once it leads attach without appending.
                self.retry_cache.record_applied(&invocation, outcome.clone());
                let _ = self
                    .actor_client
                    .notify_entry_applied(EntryApplied { entry, outcome })
                    .await;
            }
        }

        self.last_applied.replace(entry);
        self.applied_since_snapshot += 1;
        let _ = self.applied_tx.send(Some(entry.index));
        Ok(())
    }

    fn should_take_snapshot(&self) -> bool {
        match self.snapshot_threshold {
            Some(threshold) => self.applied_since_snapshot >= threshold,
            None => false,
        }
    }

    async fn take_snapshot(&mut self) -> Result<(), StateMachineError> {
        let last_included = match self.last_applied {
            Some(last) => last,
            None => return Ok(()),
        };

        let data = self.state_machine.take_snapshot()?;
        let snapshot = Snapshot {
            last_included,
            configuration: self.applied_configuration.clone(),
            applied_invocations: self.applied_invocations.clone(),
            data,
        };
        slog::info!(
            self.logger,
            "Took snapshot through {:?} ({} bytes, {} applied invocations)",
            last_included,
            snapshot.data.len(),
            snapshot.applied_invocations.len()
        );

        self.applied_since_snapshot = 0;
        let _ = self.snapshot_tx.send(Some(Arc::new(snapshot)));
        let _ = self.actor_client.notify_snapshot_taken(last_included).await;
        Ok(())
    }

    async fn install_snapshot(
        &mut self,
        snapshot: Arc<Snapshot>,
        leader_term: Term,
        request_index: u32,
        callback: Callback<InstallSnapshotReply, RpcHandlerError>,
    ) {
        let result = self
            .state_machine
            .install_snapshot(snapshot.data.clone())
            .map_err(|e| e.to_string());

        if result.is_ok() {
            slog::info!(self.logger, "Installed snapshot through {:?}", snapshot.last_included);
            self.last_applied.replace(snapshot.last_included);
            self.applied_configuration = snapshot.configuration.clone();
            self.applied_invocations = snapshot.applied_invocations.clone();
            self.applied_since_snapshot = 0;
            let _ = self.applied_tx.send(Some(snapshot.last_included.index));
            let _ = self.snapshot_tx.send(Some(snapshot.clone()));
        }

        let _ = self
            .actor_client
            .notify_snapshot_installed(SnapshotInstalledLocally {
                leader_term,
                request_index,
                snapshot,
                result,
                callback,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorClient, Event};
    use crate::replica::configuration::PeerConfiguration;
    use crate::replica::retry_cache::ClientInvocationId;
    use crate::replica::WriteAheadLogEntry;
    use bytes::Bytes;
    use tokio::time::Duration;

    /// Appends every entry's data to a single buffer.
    #[derive(Default)]
    struct Concat {
        state: Vec<u8>,
    }

    impl StateMachine for Concat {
        fn apply(&mut self, entry: AppliedEntry) -> Result<StateMachineOutput, StateMachineError> {
            if entry.data.as_ref() == b"poison" {
                return Err(StateMachineError::new("poisoned"));
            }
            self.state.extend_from_slice(&entry.data);
            Ok(StateMachineOutput::Data(Bytes::from(self.state.clone())))
        }

        fn query(&self, _request: Bytes) -> Result<Bytes, StateMachineError> {
            Ok(Bytes::from(self.state.clone()))
        }

        fn take_snapshot(&mut self) -> Result<Bytes, StateMachineError> {
            Ok(Bytes::from(self.state.clone()))
        }

        fn install_snapshot(&mut self, snapshot: Bytes) -> Result<(), StateMachineError> {
            self.state = snapshot.to_vec();
            Ok(())
        }
    }

    fn committed(index: u64, call_id: u64, data: &'static [u8]) -> CommittedEntry {
        CommittedEntry {
            index: Index::new(index),
            entry: WriteAheadLogEntry {
                term: Term::new(1),
                payload: EntryPayload::Application {
                    invocation: ClientInvocationId::new("client".into(), call_id),
                    data: Bytes::from_static(data),
                },
            },
        }
    }

    fn spawn(threshold: Option<u64>) -> (StateMachineUpdaterHandle, ActorClient, mpsc::Receiver<Event>) {
        spawn_with_expiry(threshold, Duration::from_secs(60))
    }

    fn spawn_with_expiry(
        threshold: Option<u64>,
        retry_cache_expiry: Duration,
    ) -> (StateMachineUpdaterHandle, ActorClient, mpsc::Receiver<Event>) {
        let (actor, events) = ActorClient::new(16);
        let handle = StateMachineUpdaterHandle::spawn(
            slog::Logger::root(slog::Discard, slog::o!()),
            Concat::default(),
            RaftConfiguration::new_stable(None, PeerConfiguration::new(Vec::new())),
            threshold,
            Arc::new(RetryCache::new(retry_cache_expiry)),
            actor.weak(),
        );
        (handle, actor, events)
    }

    async fn next_snapshot_taken(events: &mut mpsc::Receiver<Event>) -> TermIndex {
        loop {
            match events.recv().await {
                Some(Event::SnapshotTaken(through)) => return through,
                Some(_) => continue,
                None => panic!("Actor channel closed"),
            }
        }
    }

    async fn next_entry_applied(events: &mut mpsc::Receiver<Event>) -> EntryApplied {
        loop {
            match events.recv().await {
                Some(Event::EntryApplied(applied)) => return applied,
                Some(_) => continue,
                None => panic!("Actor channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn applies_in_order_and_skips_duplicates() {
        let (handle, _actor, mut events) = spawn(None);

        handle.apply(vec![committed(1, 1, b"a"), committed(2, 2, b"b")]);
        // Same invocation again, at a later index.
        handle.apply(vec![committed(3, 1, b"a")]);
        // Already-applied index is ignored.
        handle.apply(vec![committed(2, 2, b"b")]);

        let state = handle.query(Some(Index::new(3)), Bytes::new()).await.unwrap();
        assert_eq!(state.as_ref(), b"ab");

        let mut applied = Vec::new();
        for _ in 0..3 {
            applied.push(next_entry_applied(&mut events).await);
        }
        assert_eq!(applied[2].entry.index, Index::new(3));
        assert_eq!(applied[2].outcome.entry.index, Index::new(1));
        assert_eq!(applied[2].outcome.output, StateMachineOutput::Data(Bytes::from_static(b"a")));
    }

    #[tokio::test]
    async fn apply_pace_does_not_change_dedup() {
        let expiry = Duration::from_millis(50);
        let (slow, _slow_actor, _slow_events) = spawn_with_expiry(None, expiry);
        let (fast, _fast_actor, _fast_events) = spawn_with_expiry(None, expiry);
        let log = vec![committed(1, 1, b"a"), committed(2, 1, b"a"), committed(3, 2, b"b")];

        // Slow replica sees the duplicate well after the retry cache forgot the first one.
        slow.apply(log[..1].to_vec());
        slow.wait_for_applied(Index::new(1)).await.unwrap();
        tokio::time::sleep(expiry * 2).await;
        slow.apply(log[1..].to_vec());

        fast.apply(log);

        let slow_state = slow.query(Some(Index::new(3)), Bytes::new()).await.unwrap();
        let fast_state = fast.query(Some(Index::new(3)), Bytes::new()).await.unwrap();
        assert_eq!(slow_state.as_ref(), b"ab");
        assert_eq!(fast_state, slow_state);
    }

    #[tokio::test]
    async fn installed_snapshot_keeps_dedup_state() {
        let (source, _source_actor, mut source_events) = spawn(Some(1));
        source.apply(vec![committed(1, 1, b"a")]);
        assert_eq!(next_snapshot_taken(&mut source_events).await.index, Index::new(1));
        let snapshot = source.latest_snapshot().unwrap();
        assert_eq!(snapshot.applied_invocations.len(), 1);

        let (follower, _follower_actor, mut follower_events) = spawn_with_expiry(None, Duration::from_millis(1));
        let (callback, _reply) = oneshot::channel();
        follower.install_snapshot(snapshot, Term::new(1), 0, Callback::new(callback));
        follower.wait_for_applied(Index::new(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let rest = vec![committed(2, 1, b"a"), committed(3, 2, b"b")];
        follower.apply(rest.clone());
        source.apply(rest);

        let follower_state = follower.query(Some(Index::new(3)), Bytes::new()).await.unwrap();
        let source_state = source.query(Some(Index::new(3)), Bytes::new()).await.unwrap();
        assert_eq!(follower_state.as_ref(), b"ab");
        assert_eq!(follower_state, source_state);

        let duplicate = next_entry_applied(&mut follower_events).await;
        assert_eq!(duplicate.entry.index, Index::new(2));
        assert_eq!(duplicate.outcome.entry.index, Index::new(1));
    }

    #[tokio::test]
    async fn snapshot_after_threshold() {
        let (handle, _actor, mut events) = spawn(Some(2));

        handle.apply(vec![committed(1, 1, b"x"), committed(2, 2, b"y")]);
        handle.wait_for_applied(Index::new(2)).await.unwrap();

        assert_eq!(next_snapshot_taken(&mut events).await.index, Index::new(2));

        let snapshot = handle.latest_snapshot().unwrap();
        assert_eq!(snapshot.data.as_ref(), b"xy");
    }

    #[tokio::test]
    async fn failed_apply_stops_updater() {
        let (handle, _actor, mut events) = spawn(None);
        handle.apply(vec![committed(1, 1, b"poison")]);

        loop {
            match events.recv().await {
                Some(Event::StateMachineFailed(message)) => {
                    assert!(message.contains("poisoned"));
                    break;
                }
                Some(_) => continue,
                None => panic!("Actor channel closed"),
            }
        }

        assert!(handle.query(None, Bytes::new()).await.is_err());
    }
}
