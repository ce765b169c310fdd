use crate::actor::WeakActorClient;
use crate::replica::election::timers::clock::{Clock, RealClock};
use crate::replica::election::timers::deadline::{self, DeadlineSlot, DeadlineWatch, Wake};
use crate::replica::{LeaderTimerTick, ReplicaId, Term};
use tokio::time::Duration;

/// One per peer while we're leader. The actor gets a `LeaderTimerTick` for the peer right away,
/// then whenever `heartbeat_interval` passes without a call to `reset_heartbeat_timer()`.
pub(crate) struct HeartbeatTimerHandle<C: Clock = RealClock> {
    deadline: DeadlineSlot,
    heartbeat_interval: Duration,
    clock: C,
}

struct HeartbeatTimerTask<C: Clock> {
    deadline: DeadlineWatch,
    heartbeat_interval: Duration,
    actor_client: WeakActorClient,
    tick: LeaderTimerTick,
    clock: C,
}

impl HeartbeatTimerHandle {
    pub(crate) fn spawn(
        heartbeat_interval: Duration,
        actor_client: WeakActorClient,
        peer_id: ReplicaId,
        term: Term,
    ) -> Self {
        let tick = LeaderTimerTick { peer_id, term };
        let (task, handle) = HeartbeatTimerTask::new(heartbeat_interval, actor_client, tick, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock> HeartbeatTimerHandle<C> {
    /// We just sent this peer something, so the next heartbeat can wait a full interval.
    pub(crate) fn reset_heartbeat_timer(&self) {
        self.deadline.arm(self.clock.now() + self.heartbeat_interval);
    }
}

impl<C: Clock> HeartbeatTimerTask<C> {
    fn new(
        heartbeat_interval: Duration,
        actor_client: WeakActorClient,
        tick: LeaderTimerTick,
        clock: C,
    ) -> (Self, HeartbeatTimerHandle<C>) {
        let (slot, watch) = deadline::new();

        let task = HeartbeatTimerTask {
            deadline: watch,
            heartbeat_interval,
            actor_client,
            tick,
            clock: clock.clone(),
        };
        let handle = HeartbeatTimerHandle {
            deadline: slot,
            heartbeat_interval,
            clock,
        };

        (task, handle)
    }

    // The slot starts empty, so the first tick goes out immediately. A new leader (or a peer that
    // just joined) hears from us without waiting an interval.
    async fn run(mut self) {
        loop {
            match self.deadline.poll() {
                Wake::Closed => return,
                Wake::At(at) => self.clock.sleep_until(at).await,
                Wake::Expired => {
                    let _ = self.actor_client.leader_timer(self.tick.clone()).await;
                    if !self.deadline.rearm(self.clock.now() + self.heartbeat_interval) {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::election::timers::clock::mocked_clock;
    use crate::replica::election::timers::test_utils::ActorQueueWatcher;

    const INTERVAL: Duration = Duration::from_millis(50);

    fn tick() -> LeaderTimerTick {
        LeaderTimerTick {
            peer_id: ReplicaId::new("replica-2"),
            term: Term::new(7),
        }
    }

    #[tokio::test]
    async fn ticks_immediately_then_once_per_interval() {
        let (actor_client, rx) = ActorClient::new(10);
        let mut watcher = ActorQueueWatcher::new(rx);
        let (clock, mut controller) = mocked_clock();

        let (task, _handle) = HeartbeatTimerTask::new(INTERVAL, actor_client.weak(), tick(), clock);
        tokio::task::spawn(task.run());

        watcher.expect_heartbeat_tick(&tick()).await;
        watcher.expect_quiet().await;

        for _ in 0..4 {
            controller.advance(INTERVAL);
            watcher.expect_heartbeat_tick(&tick()).await;
            watcher.expect_quiet().await;
        }

        // Missed intervals collapse into one tick.
        controller.advance(INTERVAL * 10);
        watcher.expect_heartbeat_tick(&tick()).await;
        watcher.expect_quiet().await;
    }

    #[tokio::test]
    async fn traffic_to_the_peer_postpones_the_heartbeat() {
        let (actor_client, rx) = ActorClient::new(10);
        let mut watcher = ActorQueueWatcher::new(rx);
        let (clock, mut controller) = mocked_clock();

        let (task, handle) = HeartbeatTimerTask::new(INTERVAL, actor_client.weak(), tick(), clock);
        tokio::task::spawn(task.run());
        watcher.expect_heartbeat_tick(&tick()).await;

        // Replication traffic every 0.8 intervals.
        for _ in 0..5 {
            controller.advance(INTERVAL * 4 / 5);
            handle.reset_heartbeat_timer();
        }
        watcher.expect_quiet().await;

        // Last reset at T=4.0 intervals.
        controller.advance(INTERVAL * 4 / 5);
        watcher.expect_quiet().await;
        controller.advance(INTERVAL / 5);
        watcher.expect_heartbeat_tick(&tick()).await;
        assert_eq!(controller.elapsed(), INTERVAL * 5);
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_the_task() {
        let (actor_client, rx) = ActorClient::new(10);
        let mut watcher = ActorQueueWatcher::new(rx);
        let (clock, mut controller) = mocked_clock();

        let (task, handle) = HeartbeatTimerTask::new(INTERVAL, actor_client.weak(), tick(), clock);
        let join_handle = tokio::task::spawn(task.run());
        watcher.expect_heartbeat_tick(&tick()).await;

        drop(handle);
        controller.advance(INTERVAL);
        join_handle.await.unwrap();
        watcher.expect_quiet().await;
    }
}
