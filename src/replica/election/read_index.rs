use crate::actor::Callback;
use crate::commitlog::Index;
use crate::replica::configuration::RaftConfiguration;
use crate::replica::{ReadIndexError, ReadIndexOutput, ReplicaId};
use std::collections::HashSet;
use tokio::time::Instant;

/// PendingReads holds read-index requests waiting for a leader to confirm it's still leader.
///
/// A read is confirmed once a majority acknowledged an AppendEntries that was sent after the read
/// was registered. Acks of older requests prove nothing about leadership at the time of the read.
#[derive(Default)]
pub(crate) struct PendingReads {
    reads: Vec<PendingRead>,
}

struct PendingRead {
    read_index: Option<Index>,
    registered_at: Instant,
    acked_by: HashSet<ReplicaId>,
    callback: Callback<ReadIndexOutput, ReadIndexError>,
}

impl PendingReads {
    pub(crate) fn register(
        &mut self,
        read_index: Option<Index>,
        registered_at: Instant,
        callback: Callback<ReadIndexOutput, ReadIndexError>,
    ) {
        self.reads.push(PendingRead {
            read_index,
            registered_at,
            acked_by: HashSet::new(),
            callback,
        });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }

    /// True if some read is still waiting on a request sent after `sent_at`, meaning this peer
    /// should get another heartbeat right away.
    pub(crate) fn waiting_for_newer_than(&self, sent_at: Instant) -> bool {
        self.reads.iter().any(|read| read.registered_at > sent_at)
    }

    /// Records that `peer_id` acknowledged a request sent at `sent_at`, then completes every read
    /// that has a quorum.
    pub(crate) fn record_ack(
        &mut self,
        peer_id: &ReplicaId,
        sent_at: Instant,
        configuration: &RaftConfiguration,
        me: &ReplicaId,
    ) {
        for read in self.reads.iter_mut() {
            if sent_at >= read.registered_at {
                read.acked_by.insert(peer_id.clone());
            }
        }

        self.complete_confirmed(configuration, me);
    }

    pub(crate) fn complete_confirmed(&mut self, configuration: &RaftConfiguration, me: &ReplicaId) {
        let (confirmed, waiting) = std::mem::take(&mut self.reads)
            .into_iter()
            .partition::<Vec<_>, _>(|read| configuration.has_majority(|id| id == me || read.acked_by.contains(id)));

        self.reads = waiting;
        for read in confirmed {
            read.callback.send(Ok(ReadIndexOutput {
                read_index: read.read_index,
            }));
        }
    }

    pub(crate) fn fail_all(&mut self, error: impl Fn() -> ReadIndexError) {
        for read in self.reads.drain(..) {
            read.callback.send(Err(error()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::configuration::PeerConfiguration;
    use crate::replica::peers::{PeerRole, ReplicaInfoBlob, ReplicaMetadata};
    use std::net::Ipv4Addr;
    use tokio::sync::oneshot;
    use tokio::time::Duration;

    fn configuration(ids: &[&str]) -> RaftConfiguration {
        let peers = ids.iter().map(|id| {
            ReplicaMetadata::new(
                ReplicaId::new(*id),
                Ipv4Addr::LOCALHOST,
                9000,
                ReplicaInfoBlob::new(0),
                0,
                PeerRole::Voter,
            )
        });
        RaftConfiguration::new_stable(None, PeerConfiguration::new(peers))
    }

    #[tokio::test]
    async fn read_confirmed_by_newer_acks_only() {
        let conf = configuration(&["me", "a", "b"]);
        let me = ReplicaId::new("me");
        let t0 = Instant::now();
        let registered_at = t0 + Duration::from_millis(10);

        let mut reads = PendingReads::default();
        let (tx, mut rx) = oneshot::channel();
        reads.register(Some(Index::new(5)), registered_at, Callback::new(tx));

        // Request sent before the read registered doesn't count.
        reads.record_ack(&ReplicaId::new("a"), t0, &conf, &me);
        assert!(rx.try_recv().is_err());
        assert!(reads.waiting_for_newer_than(t0));

        reads.record_ack(&ReplicaId::new("a"), registered_at, &conf, &me);
        let output = rx.await.unwrap().unwrap();
        assert_eq!(output.read_index, Some(Index::new(5)));
        assert!(reads.is_empty());
    }

    #[tokio::test]
    async fn fail_all_on_step_down() {
        let mut reads = PendingReads::default();
        let (tx, rx) = oneshot::channel();
        reads.register(None, Instant::now(), Callback::new(tx));

        reads.fail_all(|| ReadIndexError::LostLeadership);
        assert!(matches!(rx.await.unwrap(), Err(ReadIndexError::LostLeadership)));
        assert!(reads.is_empty());
    }
}
