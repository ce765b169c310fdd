use crate::replica::LeaderRedirectInfo;
use tokio::sync::watch;

/// What the application sees of our election state. Leader contact times and vote tallies are
/// left out, so repeated transitions into the same role don't show up as changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ElectionStateSnapshot {
    Leader,
    Candidate,
    Follower(LeaderRedirectInfo),
    FollowerNoLeader,
    Listener(Option<LeaderRedirectInfo>),
    Shutdown,
}

pub(super) fn new(initial_state: ElectionStateSnapshot) -> (ElectionStateChangeNotifier, ElectionStateChangeListener) {
    let (tx, rx) = watch::channel(initial_state);

    (ElectionStateChangeNotifier { tx }, ElectionStateChangeListener { rx })
}

pub(super) struct ElectionStateChangeNotifier {
    tx: watch::Sender<ElectionStateSnapshot>,
}

impl ElectionStateChangeNotifier {
    pub(super) fn notify_new_state(&self, new_state: ElectionStateSnapshot) {
        self.tx.send_if_modified(|current| {
            if *current == new_state {
                false
            } else {
                *current = new_state;
                true
            }
        });
    }
}

#[derive(Clone)]
pub(crate) struct ElectionStateChangeListener {
    rx: watch::Receiver<ElectionStateSnapshot>,
}

impl ElectionStateChangeListener {
    /// Waits for the next change. Intermediate states are skipped if the caller falls behind.
    /// After `Shutdown` is seen, there's nothing more to wait for.
    pub(crate) async fn next(&mut self) -> Option<ElectionStateSnapshot> {
        if *self.rx.borrow() == ElectionStateSnapshot::Shutdown && !self.rx.has_changed().unwrap_or(false) {
            return None;
        }
        self.rx.changed().await.ok()?;
        let state = self.rx.borrow_and_update().clone();
        Some(state)
    }

    pub(crate) fn current(&self) -> ElectionStateSnapshot {
        self.rx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_state_twice_is_one_change() {
        let (notifier, mut listener) = new(ElectionStateSnapshot::FollowerNoLeader);

        notifier.notify_new_state(ElectionStateSnapshot::Candidate);
        notifier.notify_new_state(ElectionStateSnapshot::Candidate);
        assert_eq!(listener.next().await, Some(ElectionStateSnapshot::Candidate));

        let no_change = tokio::time::timeout(Duration::from_millis(10), listener.next()).await;
        assert!(no_change.is_err());
    }

    #[tokio::test]
    async fn lagging_listener_sees_latest_state() {
        let (notifier, mut listener) = new(ElectionStateSnapshot::FollowerNoLeader);

        notifier.notify_new_state(ElectionStateSnapshot::Candidate);
        notifier.notify_new_state(ElectionStateSnapshot::Leader);
        assert_eq!(listener.next().await, Some(ElectionStateSnapshot::Leader));
        assert_eq!(listener.current(), ElectionStateSnapshot::Leader);
    }

    #[tokio::test]
    async fn stream_ends_after_shutdown() {
        let (notifier, mut listener) = new(ElectionStateSnapshot::Leader);

        notifier.notify_new_state(ElectionStateSnapshot::Shutdown);
        assert_eq!(listener.next().await, Some(ElectionStateSnapshot::Shutdown));
        assert_eq!(listener.next().await, None);
    }
}
