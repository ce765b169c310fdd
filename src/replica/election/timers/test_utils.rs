use crate::actor::Event;
use crate::replica::LeaderTimerTick;
use std::time::Duration;
use tokio::sync::mpsc;

/// Reads the actor queue the way the actor would, so timer tests can check what got sent.
pub(super) struct ActorQueueWatcher {
    rx: mpsc::Receiver<Event>,
    quiet_period: Duration,
}

impl ActorQueueWatcher {
    pub(super) fn new(rx: mpsc::Receiver<Event>) -> Self {
        ActorQueueWatcher {
            rx,
            quiet_period: Duration::from_millis(10),
        }
    }

    async fn next(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("no event within 5s")
            .expect("actor queue closed")
    }

    pub(super) async fn expect_heartbeat_tick(&mut self, expected: &LeaderTimerTick) {
        match self.next().await {
            Event::LeaderTimer(tick) => assert_eq!(&tick, expected),
            _ => panic!("expected a leader timer tick"),
        }
    }

    pub(super) async fn expect_election_timeout(&mut self) {
        match self.next().await {
            Event::FollowerTimeout => {}
            _ => panic!("expected an election timeout"),
        }
    }

    pub(super) async fn expect_quiet(&mut self) {
        if tokio::time::timeout(self.quiet_period, self.rx.recv()).await.is_ok() {
            panic!("expected no event");
        }
    }
}
