use crate::actor::Callback;
use crate::commitlog::Index;
use crate::replica::{ClientWriteError, ClientWriteOutput, Term, TermIndex};
use std::collections::BTreeMap;

/// PendingRequests are client writes that we appended as leader and haven't applied yet, keyed by
/// log index. Each is resolved exactly once: when its entry is applied, or when we step down.
#[derive(Default)]
pub(crate) struct PendingRequests {
    requests: BTreeMap<Index, PendingRequest>,
}

struct PendingRequest {
    term: Term,
    callback: Callback<ClientWriteOutput, ClientWriteError>,
}

impl PendingRequests {
    pub(crate) fn insert(&mut self, entry: TermIndex, callback: Callback<ClientWriteOutput, ClientWriteError>) {
        let previous = self.requests.insert(
            entry.index,
            PendingRequest {
                term: entry.term,
                callback,
            },
        );

        // Only possible if our own log was truncated under us, which a leader never does.
        if let Some(previous) = previous {
            previous.callback.send(Err(ClientWriteError::NoLeader));
        }
    }

    /// Completes the request waiting on `entry`, if any. A request whose entry was replaced by one
    /// from another term is failed instead.
    pub(crate) fn resolve(&mut self, entry: TermIndex, outcome: ClientWriteOutput) {
        if let Some(request) = self.requests.remove(&entry.index) {
            if request.term == entry.term {
                request.callback.send(Ok(outcome));
            } else {
                request.callback.send(Err(ClientWriteError::NoLeader));
            }
        }
    }

    pub(crate) fn fail_all(&mut self, error: impl Fn() -> ClientWriteError) {
        for (_, request) in std::mem::take(&mut self.requests) {
            request.callback.send(Err(error()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }
}
