use crate::actor::ActorClient;
use crate::api::state_machine::{StateMachineError, StateMachineOutput};
use crate::api::types::{RaftEntryId, RaftLeaderInfo, RaftMemberInfo};
use crate::replica;
use crate::replica::{CacheQueryResult, ClientInvocationId, RetryCache, StateMachineUpdaterHandle};
use bytes::Bytes;
use std::io;
use std::sync::Arc;

/// ReplicatedLog is the replicated log for external application to write to and read from.
#[derive(Clone)]
pub struct ReplicatedLog {
    actor_client: ActorClient,
    retry_cache: Arc<RetryCache>,
    state_machine_updater: StateMachineUpdaterHandle,
}

impl ReplicatedLog {
    pub(crate) fn new(
        actor_client: ActorClient,
        retry_cache: Arc<RetryCache>,
        state_machine_updater: StateMachineUpdaterHandle,
    ) -> Self {
        ReplicatedLog {
            actor_client,
            retry_cache,
            state_machine_updater,
        }
    }

    /// Appends `data` to the log and waits for it to be applied to the state machine.
    ///
    /// Retrying with the same `client_id` and `call_id` is safe. The command is applied at most once,
    /// and every attempt gets the same outcome.
    pub async fn write(&self, input: WriteInput) -> Result<WriteOutput, WriteError> {
        let invocation = ClientInvocationId::new(input.client_id, input.call_id);

        let entry = match self.retry_cache.get_or_create(&invocation) {
            CacheQueryResult::Existing(entry) => return entry.wait().await.map(|o| o.into()).map_err(|e| e.into()),
            CacheQueryResult::New(entry) => entry,
        };

        let replica_input = replica::ClientWriteInput {
            invocation: invocation.clone(),
            data: input.data,
        };
        let result = self.actor_client.client_write(replica_input).await;
        self.retry_cache.resolve(&invocation, &entry, result);

        // The updater may have resolved the entry first, if this was a retry of a command that's
        // already in the log.
        entry.wait().await.map(|o| o.into()).map_err(|e| e.into())
    }

    /// Linearizable read. Runs `request` against the state machine once it reflects every write
    /// that completed before this call.
    pub async fn read(&self, request: Bytes) -> Result<Bytes, ReadError> {
        let read_index = self
            .actor_client
            .read_index(replica::ReadIndexInput {
                forward_to_leader: true,
            })
            .await?
            .read_index;

        self.state_machine_updater
            .query(read_index, request)
            .await
            .map_err(ReadError::StateMachine)
    }

    /// Changes cluster membership to exactly `members`. Returns once the new membership is
    /// committed.
    pub async fn set_configuration(&self, members: Vec<RaftMemberInfo>) -> Result<(), ReconfigurationError> {
        let replica_input = replica::SetConfigurationInput {
            members: members.into_iter().map(replica::ReplicaMetadata::from).collect(),
        };

        self.actor_client
            .set_configuration(replica_input)
            .await
            .map_err(|e| e.into())
    }

    /// Asks the leader to hand leadership to `target`. Returns once `target` agreed to start an
    /// election, which it will most likely win.
    pub async fn transfer_leadership(&self, target: String) -> Result<(), TransferLeadershipError> {
        let replica_input = replica::TransferLeadershipInput {
            target: replica::ReplicaId::new(target),
        };

        self.actor_client
            .transfer_leadership(replica_input)
            .await
            .map_err(|e| e.into())
    }
}

#[derive(Debug)]
pub struct WriteInput {
    /// Together with `call_id`, identifies the call across retries.
    pub client_id: String,
    pub call_id: u64,
    pub data: Bytes,
}

#[derive(Debug)]
pub struct WriteOutput {
    pub entry_id: RaftEntryId,
    pub output: StateMachineOutput,
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("I'm not leader")]
    LeaderRedirect(RaftLeaderInfo),

    // Can be retried with exponential backoff with recommended initial delay of 200ms. Likely an
    // election is in progress.
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,

    #[error("Failed to persist log: {0}")]
    LocalIoError(Arc<io::Error>),

    #[error("State machine failed: {0}")]
    StateMachineFailed(String),

    // Replica logic runs on a background task. This error is returned if it has stopped.
    #[error("Replica has shut down")]
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("I'm not leader")]
    LeaderRedirect(RaftLeaderInfo),
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,
    // Retryable. A new leader only serves reads once it has committed an entry in its term.
    #[error("Leader isn't ready to serve reads yet")]
    LeaderNotReady,
    #[error("Leader lost leadership before confirming the read")]
    LostLeadership,
    #[error("Failed to reach leader: {0}")]
    LeaderUnreachable(String),
    #[error(transparent)]
    StateMachine(StateMachineError),
    #[error("Replica has shut down")]
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconfigurationError {
    #[error("I'm not leader")]
    LeaderRedirect(RaftLeaderInfo),
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,
    #[error("Another membership change is in progress")]
    InProgress,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Failed to persist log: {0}")]
    LocalIoError(io::Error),
    // The change may or may not take effect. Check the new leader's status.
    #[error("Lost leadership before the membership change completed")]
    LostLeadership,
    #[error("Replica has shut down")]
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferLeadershipError {
    #[error("I'm not leader")]
    NotLeader,
    #[error("Target is not a voting member")]
    InvalidTarget,
    #[error("Target's log is behind the leader's")]
    TargetNotUpToDate,
    #[error("Target declined to start an election")]
    Rejected,
    #[error("Failed to reach target: {0}")]
    TargetUnreachable(String),
    #[error("Replica has shut down")]
    Shutdown,
}

// ------- Conversions --------

impl From<replica::ClientWriteOutput> for WriteOutput {
    fn from(internal_output: replica::ClientWriteOutput) -> Self {
        WriteOutput {
            entry_id: RaftEntryId::from(internal_output.entry),
            output: internal_output.output,
        }
    }
}

impl From<replica::ClientWriteError> for WriteError {
    fn from(internal_error: replica::ClientWriteError) -> Self {
        match internal_error {
            replica::ClientWriteError::LeaderRedirect(leader_info) => {
                WriteError::LeaderRedirect(RaftLeaderInfo::from(leader_info))
            }
            replica::ClientWriteError::NoLeader => WriteError::NoLeader,
            replica::ClientWriteError::LocalIoError(e) => WriteError::LocalIoError(e),
            replica::ClientWriteError::StateMachineFailed(message) => WriteError::StateMachineFailed(message),
            replica::ClientWriteError::Shutdown | replica::ClientWriteError::ActorExited => WriteError::Shutdown,
        }
    }
}

impl From<replica::ReadIndexError> for ReadError {
    fn from(internal_error: replica::ReadIndexError) -> Self {
        match internal_error {
            replica::ReadIndexError::LeaderRedirect(leader_info) => {
                ReadError::LeaderRedirect(RaftLeaderInfo::from(leader_info))
            }
            replica::ReadIndexError::NoLeader => ReadError::NoLeader,
            replica::ReadIndexError::LeaderNotReady => ReadError::LeaderNotReady,
            replica::ReadIndexError::LostLeadership => ReadError::LostLeadership,
            replica::ReadIndexError::LeaderUnreachable(message) => ReadError::LeaderUnreachable(message),
            replica::ReadIndexError::Shutdown | replica::ReadIndexError::ActorExited => ReadError::Shutdown,
        }
    }
}

impl From<replica::SetConfigurationError> for ReconfigurationError {
    fn from(internal_error: replica::SetConfigurationError) -> Self {
        match internal_error {
            replica::SetConfigurationError::LeaderRedirect(leader_info) => {
                ReconfigurationError::LeaderRedirect(RaftLeaderInfo::from(leader_info))
            }
            replica::SetConfigurationError::NoLeader => ReconfigurationError::NoLeader,
            replica::SetConfigurationError::InProgress => ReconfigurationError::InProgress,
            replica::SetConfigurationError::InvalidConfiguration(message) => {
                ReconfigurationError::InvalidConfiguration(message)
            }
            replica::SetConfigurationError::LocalIoError(e) => ReconfigurationError::LocalIoError(e),
            replica::SetConfigurationError::LostLeadership => ReconfigurationError::LostLeadership,
            replica::SetConfigurationError::Shutdown | replica::SetConfigurationError::ActorExited => {
                ReconfigurationError::Shutdown
            }
        }
    }
}

impl From<replica::TransferLeadershipError> for TransferLeadershipError {
    fn from(internal_error: replica::TransferLeadershipError) -> Self {
        match internal_error {
            replica::TransferLeadershipError::NotLeader => TransferLeadershipError::NotLeader,
            replica::TransferLeadershipError::InvalidTarget => TransferLeadershipError::InvalidTarget,
            replica::TransferLeadershipError::TargetNotUpToDate => TransferLeadershipError::TargetNotUpToDate,
            replica::TransferLeadershipError::Rejected => TransferLeadershipError::Rejected,
            replica::TransferLeadershipError::TargetUnreachable(message) => {
                TransferLeadershipError::TargetUnreachable(message)
            }
            replica::TransferLeadershipError::ActorExited => TransferLeadershipError::Shutdown,
        }
    }
}
