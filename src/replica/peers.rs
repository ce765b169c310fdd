use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// ReplicaId...or maybe it should be NodeId or ServerId. Idk.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct ReplicaId(String);

impl ReplicaId {
    pub(crate) fn new(replica_id: impl Into<String>) -> Self {
        ReplicaId(replica_id.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque application blob returned to callers that get redirected to this replica.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct ReplicaInfoBlob(u128);

impl ReplicaInfoBlob {
    pub(crate) fn new(blob: u128) -> Self {
        ReplicaInfoBlob(blob)
    }

    pub(crate) fn into_inner(self) -> u128 {
        self.0
    }
}

/// Listeners receive the log but never vote and are never counted towards a quorum.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) enum PeerRole {
    Voter,
    Listener,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ReplicaMetadata {
    replica_id: ReplicaId,
    ip_addr: Ipv4Addr,
    port: u16,
    info_blob: ReplicaInfoBlob,
    priority: u32,
    role: PeerRole,
}

impl ReplicaMetadata {
    pub(crate) fn new(
        replica_id: ReplicaId,
        ip_addr: Ipv4Addr,
        port: u16,
        info_blob: ReplicaInfoBlob,
        priority: u32,
        role: PeerRole,
    ) -> Self {
        ReplicaMetadata {
            replica_id,
            ip_addr,
            port,
            info_blob,
            priority,
            role,
        }
    }

    pub(crate) fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    pub(crate) fn ip_addr(&self) -> Ipv4Addr {
        self.ip_addr
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn info_blob(&self) -> ReplicaInfoBlob {
        self.info_blob
    }

    pub(crate) fn priority(&self) -> u32 {
        self.priority
    }

    pub(crate) fn role(&self) -> PeerRole {
        self.role
    }

    pub(crate) fn is_voter(&self) -> bool {
        self.role == PeerRole::Voter
    }

    pub(crate) fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip_addr, self.port))
    }
}
