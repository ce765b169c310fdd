use crate::actor::{ActorExited, Callback};
use crate::api::StateMachineOutput;
use crate::commitlog::Index;
use crate::replica::applied_invocations::AppliedInvocations;
use crate::replica::configuration::RaftConfiguration;
use crate::replica::election::ElectionStateSnapshot;
use crate::replica::local_state::Term;
use crate::replica::peers::{ReplicaId, ReplicaInfoBlob, ReplicaMetadata};
use crate::replica::retry_cache::ClientInvocationId;
use crate::replica::snapshot::Snapshot;
use crate::replica::term_index::TermIndex;
use crate::replica::write_ahead_log::WriteAheadLogEntry;
use bytes::Bytes;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::time::Instant;

// ------- Client requests -------

#[derive(Debug)]
pub(crate) struct ClientWriteInput {
    pub(crate) invocation: ClientInvocationId,
    pub(crate) data: Bytes,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ClientWriteOutput {
    pub(crate) entry: TermIndex,
    pub(crate) output: StateMachineOutput,
}

#[derive(Clone, Debug, thiserror::Error)]
pub(crate) enum ClientWriteError {
    #[error("I'm not leader")]
    LeaderRedirect(LeaderRedirectInfo),

    // Can be retried with exponential backoff with recommended initial delay of 200ms. Likely an
    // election is in progress.
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,

    #[error("Failed to persist log: {0}")]
    LocalIoError(Arc<io::Error>),

    #[error("State machine failed: {0}")]
    StateMachineFailed(String),

    #[error("Replica has shut down")]
    Shutdown,

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

impl From<ActorExited> for ClientWriteError {
    fn from(_: ActorExited) -> Self {
        ClientWriteError::ActorExited
    }
}

#[derive(Debug)]
pub(crate) struct ReadIndexInput {
    // Followers ask the leader for a read index. A request that was itself forwarded from a
    // follower is never forwarded again.
    pub(crate) forward_to_leader: bool,
}

#[derive(Debug)]
pub(crate) struct ReadIndexOutput {
    pub(crate) read_index: Option<Index>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ReadIndexError {
    #[error("I'm not leader")]
    LeaderRedirect(LeaderRedirectInfo),
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,
    #[error("Leader hasn't committed an entry in its term yet")]
    LeaderNotReady,
    #[error("Lost leadership before the read index was confirmed")]
    LostLeadership,
    #[error("Failed to reach leader: {0}")]
    LeaderUnreachable(String),
    #[error("Replica has shut down")]
    Shutdown,
    #[error("Replica actor is dead RIP")]
    ActorExited,
}

impl From<ActorExited> for ReadIndexError {
    fn from(_: ActorExited) -> Self {
        ReadIndexError::ActorExited
    }
}

#[derive(Debug)]
pub(crate) struct SetConfigurationInput {
    pub(crate) members: Vec<ReplicaMetadata>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SetConfigurationError {
    #[error("I'm not leader")]
    LeaderRedirect(LeaderRedirectInfo),
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,
    #[error("Another membership change is in progress")]
    InProgress,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Failed to persist log: {0}")]
    LocalIoError(io::Error),
    #[error("Lost leadership before the membership change completed")]
    LostLeadership,
    #[error("Replica has shut down")]
    Shutdown,
    #[error("Replica actor is dead RIP")]
    ActorExited,
}

impl From<ActorExited> for SetConfigurationError {
    fn from(_: ActorExited) -> Self {
        SetConfigurationError::ActorExited
    }
}

#[derive(Debug)]
pub(crate) struct TransferLeadershipInput {
    pub(crate) target: ReplicaId,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum TransferLeadershipError {
    #[error("I'm not leader")]
    NotLeader,
    #[error("Target is not a voting member")]
    InvalidTarget,
    #[error("Target's log is behind mine")]
    TargetNotUpToDate,
    #[error("Target declined to start an election")]
    Rejected,
    #[error("Failed to reach target: {0}")]
    TargetUnreachable(String),
    #[error("Replica actor is dead RIP")]
    ActorExited,
}

impl From<ActorExited> for TransferLeadershipError {
    fn from(_: ActorExited) -> Self {
        TransferLeadershipError::ActorExited
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ReplicaStatus {
    pub(crate) my_replica_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) election_state: ElectionStateSnapshot,
    pub(crate) commit_index: Option<Index>,
    pub(crate) applied_index: Option<Index>,
    pub(crate) latest_entry: Option<TermIndex>,
    pub(crate) first_log_index: Index,
    pub(crate) configuration: RaftConfiguration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LeaderRedirectInfo {
    pub(crate) replica_id: ReplicaId,
    pub(crate) ip_addr: Ipv4Addr,
    pub(crate) port: u16,
    pub(crate) replica_blob: ReplicaInfoBlob,
}

impl From<&ReplicaMetadata> for LeaderRedirectInfo {
    fn from(metadata: &ReplicaMetadata) -> Self {
        LeaderRedirectInfo {
            replica_id: metadata.replica_id().clone(),
            ip_addr: metadata.ip_addr(),
            port: metadata.port(),
            replica_blob: metadata.info_blob(),
        }
    }
}

// ------- Peer RPCs -------

#[derive(Debug, thiserror::Error)]
pub(crate) enum RpcHandlerError {
    #[error("We (server) had an IO failure: {0:?}")]
    LocalIoError(io::Error),
    #[error("We (server) have shut down")]
    Shutdown,
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

impl From<ActorExited> for RpcHandlerError {
    fn from(_: ActorExited) -> Self {
        RpcHandlerError::ActorExited
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RequestVoteRequest {
    pub(crate) candidate_id: ReplicaId,
    pub(crate) candidate_term: Term,
    pub(crate) candidate_last_entry: Option<TermIndex>,
    pub(crate) pre_vote: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct RequestVoteReply {
    pub(crate) term: Term,
    pub(crate) vote_granted: bool,
    // The candidate isn't part of our committed configuration and should stop.
    pub(crate) should_shutdown: bool,
    pub(crate) last_entry: Option<TermIndex>,
}

#[derive(Debug, Clone)]
pub(crate) struct AppendEntriesRequest {
    pub(crate) leader_id: ReplicaId,
    pub(crate) leader_term: Term,
    // "Previous log entry" is the log entry immediately preceding the new ones in the request.
    pub(crate) previous_log_entry: Option<TermIndex>,
    pub(crate) leader_commit_index: Option<Index>,
    pub(crate) entries: Vec<WriteAheadLogEntry>,
    pub(crate) call_id: u64,
    pub(crate) is_heartbeat: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AppendEntriesOutcome {
    Success,
    NotLeader,
    Inconsistency,
}

#[derive(Debug, Clone)]
pub(crate) struct AppendEntriesReply {
    pub(crate) term: Term,
    pub(crate) next_index: Index,
    pub(crate) match_index: Option<Index>,
    pub(crate) follower_commit: Option<Index>,
    pub(crate) call_id: u64,
    pub(crate) is_heartbeat: bool,
    pub(crate) outcome: AppendEntriesOutcome,
}

#[derive(Debug, Clone)]
pub(crate) struct InstallSnapshotRequest {
    pub(crate) leader_id: ReplicaId,
    pub(crate) leader_term: Term,
    pub(crate) last_included: TermIndex,
    pub(crate) configuration: RaftConfiguration,
    // Only set on the first chunk.
    pub(crate) applied_invocations: AppliedInvocations,
    pub(crate) request_index: u32,
    pub(crate) data: Bytes,
    pub(crate) done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InstallSnapshotOutcome {
    /// Chunk accepted, send the next one.
    ChunkAccepted,
    SnapshotInstalled,
    AlreadyInstalled,
    NotLeader,
    Rejected(String),
}

#[derive(Debug, Clone)]
pub(crate) struct InstallSnapshotReply {
    pub(crate) term: Term,
    pub(crate) request_index: u32,
    pub(crate) snapshot_index: Option<Index>,
    pub(crate) outcome: InstallSnapshotOutcome,
}

#[derive(Debug, Clone)]
pub(crate) struct StartLeaderElectionRequest {
    pub(crate) leader_id: ReplicaId,
    pub(crate) leader_last_entry: Option<TermIndex>,
}

#[derive(Debug, Clone)]
pub(crate) struct StartLeaderElectionReply {
    pub(crate) accepted: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ReadIndexRequest {
    pub(crate) requestor_id: ReplicaId,
}

#[derive(Debug, Clone)]
pub(crate) struct ReadIndexReply {
    pub(crate) success: bool,
    pub(crate) read_index: Option<Index>,
}

impl From<Result<ReadIndexOutput, ReadIndexError>> for ReadIndexReply {
    fn from(result: Result<ReadIndexOutput, ReadIndexError>) -> Self {
        match result {
            Ok(output) => ReadIndexReply {
                success: true,
                read_index: output.read_index,
            },
            Err(_) => ReadIndexReply {
                success: false,
                read_index: None,
            },
        }
    }
}

// ------- Internal events -------

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    // The term we asked for votes in. For a pre-vote, that's one past our current term.
    pub(crate) term: Term,
    pub(crate) pre_vote: bool,
    pub(crate) result: Result<RequestVoteReply, String>,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) descriptor: AppendEntriesReplyFromPeerDescriptor,
    pub(crate) result: Result<AppendEntriesReply, String>,
}

// This is basically info about the original request
#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeerDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) sent_at: Instant,
    pub(crate) previous_log_entry: Option<TermIndex>,
    pub(crate) num_log_entries: usize,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) snapshot_index: Index,
    pub(crate) result: Result<InstallSnapshotReply, String>,
}

/// LeaderTimerTick contains info for a single tick of a leader's per-peer timer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeaderTimerTick {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
}

/// The state machine updater applied a committed entry. Only sent for entries a client may be
/// waiting on.
///
/// If the entry repeated an invocation that was already applied, `outcome` is that earlier
/// application's, and its `entry` points there instead of at this entry.
#[derive(Debug)]
pub(crate) struct EntryApplied {
    pub(crate) entry: TermIndex,
    pub(crate) outcome: ClientWriteOutput,
}

/// The final chunk of a snapshot from the leader finished installing into the state machine.
#[derive(Debug)]
pub(crate) struct SnapshotInstalledLocally {
    pub(crate) leader_term: Term,
    // Of the final chunk, echoed back to the leader.
    pub(crate) request_index: u32,
    pub(crate) snapshot: Arc<Snapshot>,
    pub(crate) result: Result<(), String>,
    pub(crate) callback: Callback<InstallSnapshotReply, RpcHandlerError>,
}
