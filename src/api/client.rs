use crate::actor::ActorClient;
use crate::api::event_bus::{RaftElectionState, RaftEventListener};
use crate::api::replicated_log::ReplicatedLog;
use crate::api::types::{RaftEntryId, RaftMemberInfo};
use crate::replica;

/// RaftClient is the application's handle to one local raft division. Dropping every clone of the
/// client (and of its `ReplicatedLog`) stops the division.
#[derive(Clone)]
pub struct RaftClient {
    pub replicated_log: ReplicatedLog,
    pub event_listener: RaftEventListener,
    pub(crate) actor_client: ActorClient,
}

impl RaftClient {
    pub async fn status(&self) -> Result<RaftStatus, RaftClientError> {
        self.actor_client
            .status()
            .await
            .map(RaftStatus::from)
            .map_err(|_| RaftClientError::Shutdown)
    }

    /// Stops the division. Pending writes and reads fail with a shutdown error.
    pub async fn shutdown(&self) -> Result<(), RaftClientError> {
        self.actor_client.shutdown().await.map_err(|_| RaftClientError::Shutdown)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RaftClientError {
    #[error("Replica has shut down")]
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct RaftStatus {
    pub replica_id: String,
    pub term: u64,
    pub election_state: RaftElectionState,
    /// 0 means nothing is committed yet. Same for `applied_index`.
    pub commit_index: u64,
    pub applied_index: u64,
    pub last_entry: Option<RaftEntryId>,
    /// Entries before this were compacted into a snapshot.
    pub first_log_index: u64,
    pub members: Vec<RaftMemberInfo>,
    /// Only set while a membership change is in progress.
    pub old_members: Option<Vec<RaftMemberInfo>>,
}

impl From<replica::ReplicaStatus> for RaftStatus {
    fn from(status: replica::ReplicaStatus) -> Self {
        RaftStatus {
            replica_id: status.my_replica_id.into_inner(),
            term: status.term.as_u64(),
            election_state: RaftElectionState::from(status.election_state),
            commit_index: status.commit_index.map_or(0, |i| i.as_u64()),
            applied_index: status.applied_index.map_or(0, |i| i.as_u64()),
            last_entry: status.latest_entry.map(RaftEntryId::from),
            first_log_index: status.first_log_index.as_u64(),
            members: status
                .configuration
                .current()
                .peers()
                .map(RaftMemberInfo::from)
                .collect(),
            old_members: status
                .configuration
                .old()
                .map(|old| old.peers().map(RaftMemberInfo::from).collect()),
        }
    }
}
