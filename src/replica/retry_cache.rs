use crate::replica::election::{Clock, RealClock};
use crate::replica::replica_api::{ClientWriteError, ClientWriteOutput};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// ClientInvocationId identifies one logical client call. Retries of the same call carry the same
/// id.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct ClientInvocationId {
    pub(crate) client_id: String,
    pub(crate) call_id: u64,
}

impl ClientInvocationId {
    pub(crate) fn new(client_id: String, call_id: u64) -> Self {
        ClientInvocationId { client_id, call_id }
    }
}

pub(crate) type CachedReply = Result<ClientWriteOutput, ClientWriteError>;

#[derive(Clone)]
enum EntryState {
    Pending,
    Done(CachedReply),
}

/// CacheEntry is the single outcome shared by every attempt of one invocation.
pub(crate) struct CacheEntry {
    sender: watch::Sender<EntryState>,
    receiver: watch::Receiver<EntryState>,
    // None while pending.
    resolved_at: Mutex<Option<Instant>>,
}

impl CacheEntry {
    fn new() -> Self {
        let (sender, receiver) = watch::channel(EntryState::Pending);
        CacheEntry {
            sender,
            receiver,
            resolved_at: Mutex::new(None),
        }
    }

    /// Transitions pending to terminal. Only the first call has any effect; returns whether this
    /// call was it.
    fn resolve(&self, reply: CachedReply, now: Instant) -> bool {
        let mut resolved_at = self.resolved_at.lock().expect("CacheEntry.resolve() mutex guard poison");
        if resolved_at.is_some() {
            return false;
        }

        resolved_at.replace(now);
        let _ = self.sender.send(EntryState::Done(reply));
        true
    }

    fn resolved_at(&self) -> Option<Instant> {
        *self.resolved_at.lock().expect("CacheEntry.resolved_at() mutex guard poison")
    }

    /// Waits for the invocation's outcome.
    pub(crate) async fn wait(&self) -> CachedReply {
        let mut receiver = self.receiver.clone();
        loop {
            if let EntryState::Done(reply) = &*receiver.borrow() {
                return reply.clone();
            }

            if receiver.changed().await.is_err() {
                return Err(ClientWriteError::Shutdown);
            }
        }
    }
}

pub(crate) enum CacheQueryResult {
    /// First time we've seen this invocation (or the previous attempt failed or expired). The
    /// caller owns execution and must resolve the entry.
    New(Arc<CacheEntry>),
    /// A retry. Attach to the existing outcome instead of executing again.
    Existing(Arc<CacheEntry>),
}

/// RetryCache gives at-most-once application of client invocations.
///
/// Entries are created when a request arrives and resolved when the command is applied (by the
/// state machine updater) or when the attempt fails. Failed attempts are removed right away so a
/// retry executes again. Successful ones are kept for `expiry` after resolution.
pub(crate) struct RetryCache<C: Clock = RealClock> {
    entries: Mutex<HashMap<ClientInvocationId, Arc<CacheEntry>>>,
    expiry: Duration,
    clock: C,
}

impl RetryCache<RealClock> {
    pub(crate) fn new(expiry: Duration) -> Self {
        Self::with_clock(expiry, RealClock)
    }
}

impl<C: Clock> RetryCache<C> {
    pub(crate) fn with_clock(expiry: Duration, clock: C) -> Self {
        RetryCache {
            entries: Mutex::new(HashMap::new()),
            expiry,
            clock,
        }
    }

    pub(crate) fn get_or_create(&self, invocation: &ClientInvocationId) -> CacheQueryResult {
        let now = self.clock.now();
        let mut entries = self.lock_entries();

        if let Some(existing) = entries.get(invocation) {
            if !self.is_expired(existing, now) {
                return CacheQueryResult::Existing(existing.clone());
            }
        }

        let entry = Arc::new(CacheEntry::new());
        entries.insert(invocation.clone(), entry.clone());
        CacheQueryResult::New(entry)
    }

    /// Resolves the attempt that `entry` belongs to. A failure invalidates the entry so that the
    /// next retry executes again; if the entry was already resolved, nothing changes.
    pub(crate) fn resolve(&self, invocation: &ClientInvocationId, entry: &Arc<CacheEntry>, reply: CachedReply) {
        let failed = reply.is_err();
        let changed = entry.resolve(reply, self.clock.now());

        if failed && changed {
            let mut entries = self.lock_entries();
            if matches!(entries.get(invocation), Some(current) if Arc::ptr_eq(current, entry)) {
                entries.remove(invocation);
            }
        }
    }

    /// Records that the state machine applied `invocation`. Used by the state machine updater, so
    /// it also covers invocations this replica never received from a client directly. The cache
    /// only decides whether a request is appended; whether an entry is applied is up to the
    /// updater's own table.
    pub(crate) fn record_applied(&self, invocation: &ClientInvocationId, output: ClientWriteOutput) {
        let now = self.clock.now();
        let entry = {
            let mut entries = self.lock_entries();
            let expired = matches!(entries.get(invocation), Some(e) if self.is_expired(e, now));
            if expired {
                entries.remove(invocation);
            }

            entries
                .entry(invocation.clone())
                .or_insert_with(|| Arc::new(CacheEntry::new()))
                .clone()
        };

        entry.resolve(Ok(output), now);
    }

    pub(crate) fn evict_expired(&self) {
        let now = self.clock.now();
        let mut entries = self.lock_entries();
        entries.retain(|_, entry| !self.is_expired(entry, now));
    }

    pub(crate) fn len(&self) -> usize {
        self.lock_entries().len()
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        match entry.resolved_at() {
            None => false,
            Some(resolved_at) => now.saturating_duration_since(resolved_at) >= self.expiry,
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<ClientInvocationId, Arc<CacheEntry>>> {
        self.entries.lock().expect("RetryCache mutex guard poison")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::StateMachineOutput;
    use crate::commitlog::Index;
    use crate::replica::election::mocked_clock;
    use crate::replica::term_index::TermIndex;
    use crate::replica::Term;
    use bytes::Bytes;

    fn invocation(call_id: u64) -> ClientInvocationId {
        ClientInvocationId::new("client-a".to_string(), call_id)
    }

    fn output(index: u64) -> ClientWriteOutput {
        ClientWriteOutput {
            entry: TermIndex::new(Term::new(1), Index::new(index)),
            output: StateMachineOutput::Data(Bytes::from(format!("applied-{}", index))),
        }
    }

    fn unwrap_new(result: CacheQueryResult) -> Arc<CacheEntry> {
        match result {
            CacheQueryResult::New(entry) => entry,
            CacheQueryResult::Existing(_) => panic!("Expected new entry"),
        }
    }

    fn unwrap_existing(result: CacheQueryResult) -> Arc<CacheEntry> {
        match result {
            CacheQueryResult::Existing(entry) => entry,
            CacheQueryResult::New(_) => panic!("Expected existing entry"),
        }
    }

    #[tokio::test]
    async fn duplicate_attaches_to_pending_outcome() {
        let cache = Arc::new(RetryCache::new(Duration::from_secs(60)));
        let id = invocation(1);

        let created = unwrap_new(cache.get_or_create(&id));
        let attached = unwrap_existing(cache.get_or_create(&id));
        assert!(Arc::ptr_eq(&created, &attached));

        let waiter = tokio::spawn(async move { attached.wait().await });

        // Updater applies, then the creator resolves with the same outcome.
        cache.record_applied(&id, output(4));
        cache.resolve(&id, &created, Ok(output(4)));

        let reply = waiter.await.unwrap().unwrap();
        assert_eq!(reply.entry.index, Index::new(4));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn failure_invalidates_entry() {
        let cache = RetryCache::new(Duration::from_secs(60));
        let id = invocation(2);

        let created = unwrap_new(cache.get_or_create(&id));
        let attached = unwrap_existing(cache.get_or_create(&id));

        cache.resolve(&id, &created, Err(ClientWriteError::NoLeader));
        assert!(matches!(attached.wait().await, Err(ClientWriteError::NoLeader)));

        // Retry after the failure executes again.
        let retried = unwrap_new(cache.get_or_create(&id));
        assert!(!Arc::ptr_eq(&created, &retried));
    }

    #[tokio::test]
    async fn failure_after_apply_keeps_applied_outcome() {
        let cache = RetryCache::new(Duration::from_secs(60));
        let id = invocation(3);

        let created = unwrap_new(cache.get_or_create(&id));
        cache.record_applied(&id, output(7));
        cache.resolve(&id, &created, Err(ClientWriteError::NoLeader));

        assert!(matches!(created.wait().await, Ok(ref o) if o.entry.index == Index::new(7)));
        let retry = unwrap_existing(cache.get_or_create(&id));
        assert!(matches!(retry.wait().await, Ok(ref o) if o.entry.index == Index::new(7)));
    }

    #[tokio::test]
    async fn applied_without_client_request() {
        let cache = RetryCache::new(Duration::from_secs(60));
        let id = invocation(4);

        cache.record_applied(&id, output(1));
        // A second application is a duplicate, the first output sticks.
        cache.record_applied(&id, output(2));

        let retry = unwrap_existing(cache.get_or_create(&id));
        assert!(matches!(retry.wait().await, Ok(ref o) if o.entry.index == Index::new(1)));
    }

    #[tokio::test]
    async fn resolved_entries_expire() {
        let expiry = Duration::from_secs(10);
        let (clock, mut controller) = mocked_clock();
        let cache = RetryCache::with_clock(expiry, clock);
        let id = invocation(5);

        let created = unwrap_new(cache.get_or_create(&id));

        // Pending entries never expire.
        controller.advance(expiry * 3);
        unwrap_existing(cache.get_or_create(&id));

        cache.resolve(&id, &created, Ok(output(9)));
        controller.advance(expiry - Duration::from_millis(1));
        unwrap_existing(cache.get_or_create(&id));
        cache.evict_expired();
        assert_eq!(cache.len(), 1);

        controller.advance(Duration::from_millis(1));
        cache.evict_expired();
        assert_eq!(cache.len(), 0);
        unwrap_new(cache.get_or_create(&id));
    }
}
