use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::replica::applied_invocations::AppliedInvocations;
use crate::replica::configuration::RaftConfiguration;
use crate::replica::peers::ReplicaMetadata;
use crate::replica::{
    InstallSnapshotOutcome, InstallSnapshotReply, InstallSnapshotReplyFromPeer, InstallSnapshotRequest, ReplicaId,
    Term, TermIndex,
};
use crate::transport::RaftTransport;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::time::Duration;

/// Snapshot is the state machine's state after applying every entry through `last_included`,
/// along with the configuration in effect at that point and the client invocations applied so
/// far.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Snapshot {
    pub(crate) last_included: TermIndex,
    pub(crate) configuration: RaftConfiguration,
    pub(crate) applied_invocations: AppliedInvocations,
    pub(crate) data: Bytes,
}

impl Snapshot {
    /// Splits the snapshot into InstallSnapshot requests. There's always at least one request,
    /// even for an empty snapshot, and only the last one is marked `done`. Applied invocations
    /// ride on the first request only.
    pub(crate) fn to_requests(&self, leader_id: &ReplicaId, leader_term: Term, chunk_size: usize) -> Vec<InstallSnapshotRequest> {
        let chunk_size = chunk_size.max(1);
        let num_chunks = ((self.data.len() + chunk_size - 1) / chunk_size).max(1);

        (0..num_chunks)
            .map(|i| {
                let start = i * chunk_size;
                let end = (start + chunk_size).min(self.data.len());
                InstallSnapshotRequest {
                    leader_id: leader_id.clone(),
                    leader_term,
                    last_included: self.last_included,
                    configuration: self.configuration.clone(),
                    applied_invocations: if i == 0 {
                        self.applied_invocations.clone()
                    } else {
                        AppliedInvocations::default()
                    },
                    request_index: i as u32,
                    data: self.data.slice(start..end),
                    done: i + 1 == num_chunks,
                }
            })
            .collect()
    }
}

/// SnapshotReceiver reassembles a snapshot on the follower, one chunk at a time.
#[derive(Default)]
pub(crate) struct SnapshotReceiver {
    in_progress: Option<PartialSnapshot>,
}

struct PartialSnapshot {
    leader_term: Term,
    last_included: TermIndex,
    configuration: RaftConfiguration,
    applied_invocations: AppliedInvocations,
    next_request_index: u32,
    data: BytesMut,
}

#[derive(Debug, PartialEq)]
pub(crate) enum ReceiveOutcome {
    Accepted,
    Complete(Snapshot),
    /// The chunk doesn't continue the transfer we're tracking. Leader has to start over.
    OutOfOrder { expected: u32 },
}

impl SnapshotReceiver {
    pub(crate) fn receive(&mut self, request: InstallSnapshotRequest) -> ReceiveOutcome {
        if request.request_index == 0 {
            // A new transfer replaces whatever was in progress.
            self.in_progress.replace(PartialSnapshot {
                leader_term: request.leader_term,
                last_included: request.last_included,
                configuration: request.configuration,
                applied_invocations: request.applied_invocations,
                next_request_index: 0,
                data: BytesMut::new(),
            });
        }

        let partial = match &mut self.in_progress {
            Some(p)
                if p.leader_term == request.leader_term
                    && p.last_included == request.last_included
                    && p.next_request_index == request.request_index =>
            {
                p
            }
            Some(p) => {
                return ReceiveOutcome::OutOfOrder {
                    expected: p.next_request_index,
                }
            }
            None => return ReceiveOutcome::OutOfOrder { expected: 0 },
        };

        partial.data.extend_from_slice(&request.data);
        partial.next_request_index += 1;

        if !request.done {
            return ReceiveOutcome::Accepted;
        }

        match self.in_progress.take() {
            Some(p) => ReceiveOutcome::Complete(Snapshot {
                last_included: p.last_included,
                configuration: p.configuration,
                applied_invocations: p.applied_invocations,
                data: p.data.freeze(),
            }),
            None => ReceiveOutcome::OutOfOrder { expected: 0 },
        }
    }

    pub(crate) fn abort(&mut self) {
        self.in_progress = None;
    }
}

pub(crate) struct SnapshotTransfer {
    pub(crate) logger: slog::Logger,
    pub(crate) transport: Arc<dyn RaftTransport>,
    pub(crate) peer: ReplicaMetadata,
    pub(crate) my_replica_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) snapshot: Arc<Snapshot>,
    pub(crate) chunk_size: usize,
    pub(crate) rpc_timeout: Duration,
    pub(crate) actor_client: WeakActorClient,
}

impl SnapshotTransfer {
    /// Streams the snapshot to the peer one chunk at a time, then reports how it went back to the
    /// actor. Runs on its own task so a big transfer never delays heartbeats.
    pub(crate) async fn run(self) {
        let logger = self
            .logger
            .new(slog::o!("Peer" => format!("{:?}", self.peer.replica_id()), "Snapshot" => format!("{:?}", self.snapshot.last_included)));
        let snapshot_index = self.snapshot.last_included.index;

        let mut result = Err("Snapshot has no chunks".to_string());
        for request in self.snapshot.to_requests(&self.my_replica_id, self.term, self.chunk_size) {
            let request_index = request.request_index;
            slog::debug!(logger, "ClientWire - InstallSnapshot chunk {}", request_index);
            result = match tokio::time::timeout(self.rpc_timeout, self.transport.install_snapshot(&self.peer, request)).await {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(e)) => Err(format!("{}", e)),
                Err(_timeout) => Err("Timed out calling InstallSnapshot".to_string()),
            };
            slog::debug!(logger, "ClientWire - {:?}", result);

            if !Self::should_send_next_chunk(&result, self.term, request_index) {
                break;
            }
        }

        let _ = self
            .actor_client
            .notify_install_snapshot_reply_from_peer(InstallSnapshotReplyFromPeer {
                peer_id: self.peer.replica_id().clone(),
                term: self.term,
                snapshot_index,
                result,
            })
            .await;
    }

    fn should_send_next_chunk(result: &Result<InstallSnapshotReply, String>, term: Term, request_index: u32) -> bool {
        match result {
            Ok(reply) => {
                reply.term <= term
                    && reply.request_index == request_index
                    && reply.outcome == InstallSnapshotOutcome::ChunkAccepted
            }
            Err(_) => false,
        }
    }
}

/// The reply a follower sends when it doesn't need the snapshot (or has just finished installing
/// it).
pub(crate) fn snapshot_reply(
    term: Term,
    request_index: u32,
    snapshot_index: Option<Index>,
    outcome: InstallSnapshotOutcome,
) -> InstallSnapshotReply {
    InstallSnapshotReply {
        term,
        request_index,
        snapshot_index,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::StateMachineOutput;
    use crate::replica::configuration::PeerConfiguration;
    use crate::replica::{ClientInvocationId, ClientWriteOutput};
    use std::iter::FromIterator;

    fn snapshot(data: &'static [u8]) -> Snapshot {
        let applied = AppliedInvocations::from_iter(vec![(
            ClientInvocationId::new("client".into(), 4),
            ClientWriteOutput {
                entry: TermIndex::new(Term::new(2), Index::new(12)),
                output: StateMachineOutput::NoData,
            },
        )]);
        Snapshot {
            last_included: TermIndex::new(Term::new(2), Index::new(30)),
            configuration: RaftConfiguration::new_stable(None, PeerConfiguration::new(Vec::new())),
            applied_invocations: applied,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn chunking() {
        let leader = ReplicaId::new("leader");
        let requests = snapshot(b"abcdefg").to_requests(&leader, Term::new(3), 3);
        let chunks: Vec<&[u8]> = requests.iter().map(|r| r.data.as_ref()).collect();
        assert_eq!(chunks, vec![&b"abc"[..], &b"def"[..], &b"g"[..]]);
        assert_eq!(requests.iter().filter(|r| r.done).count(), 1);
        assert!(requests[2].done);
        assert_eq!(requests[0].applied_invocations.len(), 1);
        assert_eq!(requests[1].applied_invocations.len(), 0);

        let empty = snapshot(b"").to_requests(&leader, Term::new(3), 3);
        assert_eq!(empty.len(), 1);
        assert!(empty[0].done);
    }

    #[test]
    fn reassembles_in_order() {
        let original = snapshot(b"abcdefg");
        let mut receiver = SnapshotReceiver::default();
        let mut requests = original.to_requests(&ReplicaId::new("leader"), Term::new(3), 3).into_iter();

        assert_eq!(receiver.receive(requests.next().unwrap()), ReceiveOutcome::Accepted);
        assert_eq!(receiver.receive(requests.next().unwrap()), ReceiveOutcome::Accepted);
        assert_eq!(receiver.receive(requests.next().unwrap()), ReceiveOutcome::Complete(original));
    }

    #[test]
    fn out_of_order_chunk_is_rejected_until_restart() {
        let original = snapshot(b"abcdefg");
        let requests = original.to_requests(&ReplicaId::new("leader"), Term::new(3), 3);
        let mut receiver = SnapshotReceiver::default();

        assert_eq!(
            receiver.receive(requests[1].clone()),
            ReceiveOutcome::OutOfOrder { expected: 0 }
        );
        assert_eq!(receiver.receive(requests[0].clone()), ReceiveOutcome::Accepted);
        assert_eq!(
            receiver.receive(requests[2].clone()),
            ReceiveOutcome::OutOfOrder { expected: 1 }
        );

        // Restarting from chunk 0 works.
        for request in requests.iter().take(2) {
            assert_eq!(receiver.receive(request.clone()), ReceiveOutcome::Accepted);
        }
        assert_eq!(receiver.receive(requests[2].clone()), ReceiveOutcome::Complete(original));
    }
}
