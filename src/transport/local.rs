use crate::actor::WeakActorClient;
use crate::replica::{
    AppendEntriesReply, AppendEntriesRequest, InstallSnapshotReply, InstallSnapshotRequest, ReadIndexReply,
    ReadIndexRequest, ReplicaId, ReplicaMetadata, RequestVoteReply, RequestVoteRequest, RpcHandlerError,
    StartLeaderElectionReply, StartLeaderElectionRequest,
};
use crate::transport::{RaftTransport, TransportError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// LocalNetwork connects replicas running in the same process, without sockets. Links between
/// replicas can be cut and restored, which makes it the tool of choice for partition tests.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<ReplicaId, WeakActorClient>,
    // Undirected. Stored with the smaller id first.
    cut_links: HashSet<(ReplicaId, ReplicaId)>,
}

impl NetworkState {
    fn link(a: &ReplicaId, b: &ReplicaId) -> (ReplicaId, ReplicaId) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    fn is_reachable(&self, from: &ReplicaId, to: &ReplicaId) -> bool {
        !self.cut_links.contains(&Self::link(from, to))
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cuts every link to and from `replica_id`.
    pub fn isolate(&self, replica_id: &str) {
        let replica_id = ReplicaId::new(replica_id);
        let mut state = self.lock();
        let others: Vec<ReplicaId> = state.nodes.keys().filter(|id| **id != replica_id).cloned().collect();
        for other in others {
            let link = NetworkState::link(&replica_id, &other);
            state.cut_links.insert(link);
        }
    }

    /// Splits the network so that replicas can only talk within their own group.
    pub fn partition(&self, groups: &[&[&str]]) {
        let mut state = self.lock();
        for (i, group_a) in groups.iter().enumerate() {
            for group_b in groups.iter().skip(i + 1) {
                for a in group_a.iter() {
                    for b in group_b.iter() {
                        let link = NetworkState::link(&ReplicaId::new(*a), &ReplicaId::new(*b));
                        state.cut_links.insert(link);
                    }
                }
            }
        }
    }

    /// Restores every cut link.
    pub fn heal(&self) {
        self.lock().cut_links.clear();
    }

    /// Removes a replica from the network entirely, as if its process died.
    pub fn disconnect(&self, replica_id: &str) {
        self.lock().nodes.remove(&ReplicaId::new(replica_id));
    }

    pub(crate) fn register(&self, replica_id: ReplicaId, actor_client: WeakActorClient) {
        self.lock().nodes.insert(replica_id, actor_client);
    }

    pub(crate) fn transport_for(&self, replica_id: ReplicaId) -> LocalTransport {
        LocalTransport {
            me: replica_id,
            network: self.clone(),
        }
    }

    fn route(&self, from: &ReplicaId, to: &ReplicaId) -> Result<WeakActorClient, TransportError> {
        let state = self.lock();
        if !state.is_reachable(from, to) {
            return Err(TransportError::Unreachable(format!("Link {:?} <-> {:?} is cut", from, to)));
        }

        state
            .nodes
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(format!("{:?} is not on the network", to)))
    }

    // A reply is lost if the link was cut while the request was in flight.
    fn deliver<T>(&self, from: &ReplicaId, to: &ReplicaId, reply: T) -> Result<T, TransportError> {
        self.route(from, to).map(|_| reply)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.inner.lock().expect("LocalNetwork mutex guard poison")
    }
}

fn handler_error(error: RpcHandlerError) -> TransportError {
    match error {
        RpcHandlerError::ActorExited => TransportError::Unreachable(error.to_string()),
        _ => TransportError::ServerFault(error.to_string()),
    }
}

pub(crate) struct LocalTransport {
    me: ReplicaId,
    network: LocalNetwork,
}

#[async_trait::async_trait]
impl RaftTransport for LocalTransport {
    async fn request_vote(
        &self,
        peer: &ReplicaMetadata,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteReply, TransportError> {
        let target = self.network.route(&self.me, peer.replica_id())?;
        let reply = target.request_vote(request).await.map_err(handler_error)?;
        self.network.deliver(&self.me, peer.replica_id(), reply)
    }

    async fn append_entries(
        &self,
        peer: &ReplicaMetadata,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, TransportError> {
        let target = self.network.route(&self.me, peer.replica_id())?;
        let reply = target.append_entries(request).await.map_err(handler_error)?;
        self.network.deliver(&self.me, peer.replica_id(), reply)
    }

    async fn install_snapshot(
        &self,
        peer: &ReplicaMetadata,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotReply, TransportError> {
        let target = self.network.route(&self.me, peer.replica_id())?;
        let reply = target.install_snapshot(request).await.map_err(handler_error)?;
        self.network.deliver(&self.me, peer.replica_id(), reply)
    }

    async fn start_leader_election(
        &self,
        peer: &ReplicaMetadata,
        request: StartLeaderElectionRequest,
    ) -> Result<StartLeaderElectionReply, TransportError> {
        let target = self.network.route(&self.me, peer.replica_id())?;
        let reply = target.start_leader_election(request).await.map_err(handler_error)?;
        self.network.deliver(&self.me, peer.replica_id(), reply)
    }

    async fn read_index(
        &self,
        peer: &ReplicaMetadata,
        _request: ReadIndexRequest,
    ) -> Result<ReadIndexReply, TransportError> {
        let target = self.network.route(&self.me, peer.replica_id())?;
        let reply = ReadIndexReply::from(target.read_index().await);
        self.network.deliver(&self.me, peer.replica_id(), reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ReplicaId {
        ReplicaId::new(s)
    }

    #[test]
    fn partition_and_heal() {
        let network = LocalNetwork::new();
        network.partition(&[&["a", "b", "c"], &["d", "e"]]);

        let state = network.lock();
        assert!(state.is_reachable(&id("a"), &id("c")));
        assert!(state.is_reachable(&id("e"), &id("d")));
        assert!(!state.is_reachable(&id("a"), &id("d")));
        assert!(!state.is_reachable(&id("e"), &id("b")));
        drop(state);

        network.heal();
        assert!(network.lock().is_reachable(&id("a"), &id("d")));
    }

    #[tokio::test]
    async fn isolate_cuts_registered_peers() {
        let network = LocalNetwork::new();
        let (a, _rx_a) = crate::actor::ActorClient::new(1);
        let (b, _rx_b) = crate::actor::ActorClient::new(1);
        network.register(id("a"), a.weak());
        network.register(id("b"), b.weak());

        network.isolate("a");
        assert!(matches!(network.route(&id("b"), &id("a")), Err(TransportError::Unreachable(_))));

        network.heal();
        assert!(network.route(&id("b"), &id("a")).is_ok());

        network.disconnect("a");
        assert!(network.route(&id("b"), &id("a")).is_err());
    }
}
