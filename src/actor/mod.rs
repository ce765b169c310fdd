use crate::commitlog::Log;
use crate::replica::{
    AppendEntriesReply, AppendEntriesReplyFromPeer, AppendEntriesRequest, ClientWriteError, ClientWriteInput,
    ClientWriteOutput, EntryApplied, InstallSnapshotReply, InstallSnapshotReplyFromPeer, InstallSnapshotRequest,
    LeaderTimerTick, ReadIndexError, ReadIndexInput, ReadIndexOutput, Replica, ReplicaStatus, RequestVoteReply,
    RequestVoteReplyFromPeer, RequestVoteRequest, RpcHandlerError, SetConfigurationError, SetConfigurationInput,
    SnapshotInstalledLocally, StartLeaderElectionReply, StartLeaderElectionRequest, TermIndex,
    TransferLeadershipError, TransferLeadershipInput, WriteAheadLogEntry,
};
use std::error::Error;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};

// v1 Design choice: Disk interaction will be synchronous. Future improvement: There should be a
//                   Disk Actor.
#[derive(Debug)]
pub(crate) enum Event {
    // Leader: Write to disk, replicate, and hold the callback until the entry is applied.
    // Candidate: No leader.
    // Follower: Redirect.
    ClientWrite(ClientWriteInput, Callback<ClientWriteOutput, ClientWriteError>),

    // Leader: Confirm leadership (lease or heartbeat round), reply with commit index.
    // Follower: Ask the leader, or redirect.
    ReadIndex(ReadIndexInput, Callback<ReadIndexOutput, ReadIndexError>),

    // Leader: Append joint configuration, hold callback until the new-only configuration commits.
    SetConfiguration(SetConfigurationInput, Callback<(), SetConfigurationError>),

    // Leader: Ask an up-to-date peer to start an election right away.
    TransferLeadership(TransferLeadershipInput, Callback<(), TransferLeadershipError>),

    Status(Callback<ReplicaStatus, RpcHandlerError>),

    // Any: Grant vote if applicable (includes write to disk). Higher term means transition to
    // follower.
    RequestVote(RequestVoteRequest, Callback<RequestVoteReply, RpcHandlerError>),

    // Leader/Candidate: Transition to follower if applicable.
    // Follower: Write to disk then respond. Reset timeout.
    AppendEntries(AppendEntriesRequest, Callback<AppendEntriesReply, RpcHandlerError>),

    // Follower: Buffer chunk. The final chunk is installed by the state machine updater, and the
    // callback is completed once that finishes.
    InstallSnapshot(InstallSnapshotRequest, Callback<InstallSnapshotReply, RpcHandlerError>),

    // Follower: Start an election now if the caller is my leader and my log caught up to theirs.
    StartLeaderElection(StartLeaderElectionRequest, Callback<StartLeaderElectionReply, RpcHandlerError>),

    // Candidate: Count the vote. Transition to leader (or out of pre-vote) if quorum vote.
    RequestVoteReplyFromPeer(RequestVoteReplyFromPeer),

    // Leader: Update peer progress. Commit and apply if majority replication.
    AppendEntriesReplyFromPeer(AppendEntriesReplyFromPeer),

    // Leader: A snapshot transfer to a peer finished (or failed).
    InstallSnapshotReplyFromPeer(InstallSnapshotReplyFromPeer),

    // Leader: Send AppendEntries (or a heartbeat) to one peer.
    LeaderTimer(LeaderTimerTick),

    // Follower/Candidate: Start a new election.
    FollowerTimeout,

    // From the state machine updater.
    EntryApplied(EntryApplied),
    SnapshotTaken(TermIndex),
    SnapshotInstalledLocally(SnapshotInstalledLocally),
    StateMachineFailed(String),

    Shutdown(Callback<(), RpcHandlerError>),
}

#[derive(Debug)]
pub(crate) struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Callback<O, E> {
    pub(crate) fn new(sender: oneshot::Sender<Result<O, E>>) -> Self {
        Callback(sender)
    }

    pub(crate) fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Replica actor has exited")]
pub(crate) struct ActorExited;

/// ActorClient is the strong handle to a replica actor. The actor keeps running as long as one of
/// these is alive. It's owned by the application-facing API.
#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

/// WeakActorClient doesn't keep the actor alive. It's held by everything the actor owns or spawns
/// (timers, RPC tasks, the gRPC server), so dropping the last `ActorClient` stops the replica.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ActorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn client_write(&self, input: ClientWriteInput) -> Result<ClientWriteOutput, ClientWriteError> {
        call(&self.sender, |cb| Event::ClientWrite(input, cb)).await
    }

    pub(crate) async fn read_index(&self, input: ReadIndexInput) -> Result<ReadIndexOutput, ReadIndexError> {
        call(&self.sender, |cb| Event::ReadIndex(input, cb)).await
    }

    pub(crate) async fn set_configuration(&self, input: SetConfigurationInput) -> Result<(), SetConfigurationError> {
        call(&self.sender, |cb| Event::SetConfiguration(input, cb)).await
    }

    pub(crate) async fn transfer_leadership(
        &self,
        input: TransferLeadershipInput,
    ) -> Result<(), TransferLeadershipError> {
        call(&self.sender, |cb| Event::TransferLeadership(input, cb)).await
    }

    pub(crate) async fn status(&self) -> Result<ReplicaStatus, RpcHandlerError> {
        call(&self.sender, Event::Status).await
    }

    pub(crate) async fn shutdown(&self) -> Result<(), RpcHandlerError> {
        call(&self.sender, Event::Shutdown).await
    }
}

impl WeakActorClient {
    pub(crate) async fn request_vote(&self, input: RequestVoteRequest) -> Result<RequestVoteReply, RpcHandlerError> {
        let sender = self.upgrade()?;
        call(&sender, |cb| Event::RequestVote(input, cb)).await
    }

    pub(crate) async fn append_entries(
        &self,
        input: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, RpcHandlerError> {
        let sender = self.upgrade()?;
        call(&sender, |cb| Event::AppendEntries(input, cb)).await
    }

    pub(crate) async fn install_snapshot(
        &self,
        input: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotReply, RpcHandlerError> {
        let sender = self.upgrade()?;
        call(&sender, |cb| Event::InstallSnapshot(input, cb)).await
    }

    pub(crate) async fn start_leader_election(
        &self,
        input: StartLeaderElectionRequest,
    ) -> Result<StartLeaderElectionReply, RpcHandlerError> {
        let sender = self.upgrade()?;
        call(&sender, |cb| Event::StartLeaderElection(input, cb)).await
    }

    /// Read index on behalf of a follower. Never forwarded again.
    pub(crate) async fn read_index(&self) -> Result<ReadIndexOutput, ReadIndexError> {
        let sender = self.upgrade()?;
        let input = ReadIndexInput {
            forward_to_leader: false,
        };
        call(&sender, |cb| Event::ReadIndex(input, cb)).await
    }

    pub(crate) async fn notify_request_vote_reply_from_peer(
        &self,
        input: RequestVoteReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::RequestVoteReplyFromPeer(input)).await
    }

    pub(crate) async fn notify_append_entries_reply_from_peer(
        &self,
        input: AppendEntriesReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::AppendEntriesReplyFromPeer(input)).await
    }

    pub(crate) async fn notify_install_snapshot_reply_from_peer(
        &self,
        input: InstallSnapshotReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::InstallSnapshotReplyFromPeer(input)).await
    }

    pub(crate) async fn leader_timer(&self, input: LeaderTimerTick) -> Result<(), ActorExited> {
        self.send(Event::LeaderTimer(input)).await
    }

    pub(crate) async fn follower_timeout(&self) -> Result<(), ActorExited> {
        self.send(Event::FollowerTimeout).await
    }

    pub(crate) async fn notify_entry_applied(&self, input: EntryApplied) -> Result<(), ActorExited> {
        self.send(Event::EntryApplied(input)).await
    }

    pub(crate) async fn notify_snapshot_taken(&self, snapshot_index: TermIndex) -> Result<(), ActorExited> {
        self.send(Event::SnapshotTaken(snapshot_index)).await
    }

    pub(crate) async fn notify_snapshot_installed(&self, input: SnapshotInstalledLocally) -> Result<(), ActorExited> {
        self.send(Event::SnapshotInstalledLocally(input)).await
    }

    pub(crate) async fn notify_state_machine_failed(&self, message: String) -> Result<(), ActorExited> {
        self.send(Event::StateMachineFailed(message)).await
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        self.upgrade()?.send(event).await.map_err(|_| ActorExited)
    }

    fn upgrade(&self) -> Result<mpsc::Sender<Event>, ActorExited> {
        self.sender.upgrade().ok_or(ActorExited)
    }
}

async fn call<O, E>(sender: &mpsc::Sender<Event>, event_fn: impl FnOnce(Callback<O, E>) -> Event) -> Result<O, E>
where
    O: Debug,
    E: Error + From<ActorExited>,
{
    let (tx, rx) = oneshot::channel();
    sender
        .send(event_fn(Callback(tx)))
        .await
        .map_err(|_| E::from(ActorExited))?;

    match rx.await {
        Ok(result) => result,
        // Actor dropped our callback without replying, which only happens while it's exiting.
        Err(_) => Err(E::from(ActorExited)),
    }
}

/// ReplicaActor is replica logic in actor model.
pub(crate) struct ReplicaActor<L>
where
    L: Log<WriteAheadLogEntry>,
{
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: Replica<L>,
}

impl<L> ReplicaActor<L>
where
    L: Log<WriteAheadLogEntry>,
{
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: Replica<L>) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);

            if self.replica.is_shut_down() {
                slog::info!(self.logger, "Replica has shut down. Exiting event loop.");
                break;
            }
        }

        slog::info!(self.logger, "Replica event loop has exited.");
    }

    // This must NOT be async. Any long running work must be spawned on another task
    // and/or come as a callback to this actor.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::ClientWrite(input, callback) => {
                // Callback is completed later, once the entry is applied.
                self.replica.handle_client_write(input, callback);
            }
            Event::ReadIndex(input, callback) => {
                self.replica.handle_read_index(input, callback);
            }
            Event::SetConfiguration(input, callback) => {
                self.replica.handle_set_configuration(input, callback);
            }
            Event::TransferLeadership(input, callback) => {
                self.replica.handle_transfer_leadership(input, callback);
            }
            Event::Status(callback) => {
                callback.send(self.replica.status());
            }
            Event::RequestVote(input, callback) => {
                let result = self.replica.server_handle_request_vote(input);
                callback.send(result);
            }
            Event::AppendEntries(input, callback) => {
                let result = self.replica.server_handle_append_entries(input);
                callback.send(result);
            }
            Event::InstallSnapshot(input, callback) => {
                self.replica.server_handle_install_snapshot(input, callback);
            }
            Event::StartLeaderElection(input, callback) => {
                let result = self.replica.server_handle_start_leader_election(input);
                callback.send(result);
            }
            Event::RequestVoteReplyFromPeer(input) => {
                self.replica.handle_request_vote_reply_from_peer(input);
            }
            Event::AppendEntriesReplyFromPeer(input) => {
                self.replica.handle_append_entries_reply_from_peer(input);
            }
            Event::InstallSnapshotReplyFromPeer(input) => {
                self.replica.handle_install_snapshot_reply_from_peer(input);
            }
            Event::LeaderTimer(input) => {
                self.replica.handle_leader_timer(input);
            }
            Event::FollowerTimeout => {
                self.replica.handle_follower_timeout();
            }
            Event::EntryApplied(input) => {
                self.replica.handle_entry_applied(input);
            }
            Event::SnapshotTaken(snapshot_index) => {
                self.replica.handle_snapshot_taken(snapshot_index);
            }
            Event::SnapshotInstalledLocally(input) => {
                self.replica.handle_snapshot_installed_locally(input);
            }
            Event::StateMachineFailed(message) => {
                self.replica.handle_state_machine_failed(message);
            }
            Event::Shutdown(callback) => {
                self.replica.shutdown("Requested by application");
                callback.send(Ok(()));
            }
        }
    }
}
