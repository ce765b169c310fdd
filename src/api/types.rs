use crate::commitlog::Index;
use crate::replica;
use crate::replica::{PeerRole, ReplicaInfoBlob, Term, TermIndex};
use std::net::Ipv4Addr;

/// Opaque type for application to match applied entries with writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RaftEntryId {
    pub(crate) term: Term,
    pub(crate) entry_index: Index,
}

impl RaftEntryId {
    pub fn term(&self) -> u64 {
        self.term.as_u64()
    }

    pub fn index(&self) -> u64 {
        self.entry_index.as_u64()
    }
}

impl From<TermIndex> for RaftEntryId {
    fn from(term_index: TermIndex) -> Self {
        RaftEntryId {
            term: term_index.term,
            entry_index: term_index.index,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RaftMemberRole {
    Voter,
    /// Receives the log, but never votes and isn't counted towards a majority.
    Listener,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RaftMemberInfo {
    pub replica_id: String,
    pub ip_addr: Ipv4Addr,
    pub raft_internal_rpc_port: u16,
    pub peer_redirect_info_blob: RaftMemberInfoBlob,
    /// A leader hands leadership over to an up-to-date voter with a higher priority.
    pub priority: u32,
    pub role: RaftMemberRole,
}

impl From<RaftMemberInfo> for replica::ReplicaMetadata {
    fn from(member_info: RaftMemberInfo) -> Self {
        Self::new(
            replica::ReplicaId::new(member_info.replica_id),
            member_info.ip_addr,
            member_info.raft_internal_rpc_port,
            replica::ReplicaInfoBlob::from(member_info.peer_redirect_info_blob),
            member_info.priority,
            match member_info.role {
                RaftMemberRole::Voter => PeerRole::Voter,
                RaftMemberRole::Listener => PeerRole::Listener,
            },
        )
    }
}

impl From<&replica::ReplicaMetadata> for RaftMemberInfo {
    fn from(metadata: &replica::ReplicaMetadata) -> Self {
        RaftMemberInfo {
            replica_id: metadata.replica_id().as_str().to_string(),
            ip_addr: metadata.ip_addr(),
            raft_internal_rpc_port: metadata.port(),
            peer_redirect_info_blob: RaftMemberInfoBlob::from(metadata.info_blob()),
            priority: metadata.priority(),
            role: match metadata.role() {
                PeerRole::Voter => RaftMemberRole::Voter,
                PeerRole::Listener => RaftMemberRole::Listener,
            },
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftLeaderInfo {
    pub replica_id: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub info_blob: RaftMemberInfoBlob,
}

impl From<replica::LeaderRedirectInfo> for RaftLeaderInfo {
    fn from(internal_leader: replica::LeaderRedirectInfo) -> Self {
        Self {
            replica_id: internal_leader.replica_id.into_inner(),
            ip: internal_leader.ip_addr,
            port: internal_leader.port,
            info_blob: RaftMemberInfoBlob::from(internal_leader.replica_blob),
        }
    }
}

/// We allow application layer to provide an arbitrary blob of info about each member
/// that will be returned back to the application layer if we leader-redirect the
/// application to that member.
#[derive(Copy, Clone, Debug, Eq, PartialOrd, PartialEq)]
pub struct RaftMemberInfoBlob(u128);

impl RaftMemberInfoBlob {
    pub fn new(blob: u128) -> Self {
        RaftMemberInfoBlob(blob)
    }

    pub fn into_inner(self) -> u128 {
        self.0
    }
}

impl From<RaftMemberInfoBlob> for replica::ReplicaInfoBlob {
    fn from(external_info_blob: RaftMemberInfoBlob) -> Self {
        Self::new(external_info_blob.0)
    }
}

impl From<replica::ReplicaInfoBlob> for RaftMemberInfoBlob {
    fn from(internal_info_blob: ReplicaInfoBlob) -> Self {
        Self::new(internal_info_blob.into_inner())
    }
}
