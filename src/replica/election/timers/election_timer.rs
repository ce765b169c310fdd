use crate::actor::WeakActorClient;
use crate::replica::election::timers::clock::{Clock, RealClock};
use crate::replica::election::timers::deadline::{self, DeadlineSlot, DeadlineWatch, Wake};
use rand::Rng;
use std::ops::RangeInclusive;
use tokio::time::{Duration, Instant};

/// Held by followers and candidates. Unless `reset()` is called often enough, the actor gets a
/// `FollowerTimeout` after a random delay in `[min_timeout, max_timeout]`. Dropping the handle
/// stops the timer.
pub(crate) struct ElectionTimerHandle<C: Clock = RealClock> {
    deadline: DeadlineSlot,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
}

struct ElectionTimerTask<C: Clock> {
    deadline: DeadlineWatch,
    actor_client: WeakActorClient,
    clock: C,
    // While nobody resets the timer, repeat the timeout this often. Covers a candidate whose
    // election round got no answers.
    retrigger_after: Duration,
}

impl ElectionTimerHandle {
    pub(crate) fn spawn(min_timeout: Duration, max_timeout: Duration, actor_client: WeakActorClient) -> Self {
        let (task, handle) = ElectionTimerTask::new(min_timeout..=max_timeout, actor_client, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock> ElectionTimerHandle<C> {
    /// Called on every valid message from the current leader.
    pub(crate) fn reset(&self) {
        self.deadline.arm(self.next_deadline());
    }

    fn next_deadline(&self) -> Instant {
        self.clock.now() + jittered(&self.timeout_range)
    }
}

fn jittered(range: &RangeInclusive<Duration>) -> Duration {
    rand::thread_rng().gen_range(range.clone())
}

impl<C: Clock> ElectionTimerTask<C> {
    fn new(
        timeout_range: RangeInclusive<Duration>,
        actor_client: WeakActorClient,
        clock: C,
    ) -> (Self, ElectionTimerHandle<C>) {
        let (slot, watch) = deadline::new();

        let task = ElectionTimerTask {
            deadline: watch,
            actor_client,
            clock: clock.clone(),
            retrigger_after: *timeout_range.start(),
        };
        let handle = ElectionTimerHandle {
            deadline: slot,
            timeout_range,
            clock,
        };

        // Armed before the task runs, so a fresh follower doesn't time out right away.
        handle.reset();

        (task, handle)
    }

    async fn run(mut self) {
        loop {
            match self.deadline.poll() {
                Wake::Closed => return,
                Wake::At(at) => self.clock.sleep_until(at).await,
                Wake::Expired => {
                    // The actor ignores this if it stopped being a follower or candidate meanwhile.
                    let _ = self.actor_client.follower_timeout().await;
                    self.clock.sleep(self.retrigger_after).await;
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

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[test]
    fn jitter_stays_within_range() {
        let range = Duration::from_millis(150)..=Duration::from_millis(300);
        for _ in 0..1000 {
            assert!(range.contains(&jittered(&range)));
        }
    }

    #[tokio::test]
    async fn times_out_one_timeout_after_last_reset() {
        let (actor_client, rx) = ActorClient::new(10);
        let mut watcher = ActorQueueWatcher::new(rx);
        let (clock, mut controller) = mocked_clock();

        let (task, handle) = ElectionTimerTask::new(TIMEOUT..=TIMEOUT, actor_client.weak(), clock);
        tokio::task::spawn(task.run());

        // Heartbeats every 0.4 timeouts keep the follower quiet.
        for _ in 0..10 {
            controller.advance(TIMEOUT * 2 / 5);
            handle.reset();
        }
        watcher.expect_quiet().await;

        // Last reset was at T=4.0.
        controller.advance(TIMEOUT - Duration::from_millis(1));
        watcher.expect_quiet().await;
        controller.advance(Duration::from_millis(1));
        watcher.expect_election_timeout().await;
        assert_eq!(controller.elapsed(), TIMEOUT * 5);
    }

    #[tokio::test]
    async fn keeps_timing_out_while_nobody_resets() {
        let (actor_client, rx) = ActorClient::new(10);
        let mut watcher = ActorQueueWatcher::new(rx);
        let (clock, mut controller) = mocked_clock();

        let (task, _handle) = ElectionTimerTask::new(TIMEOUT..=TIMEOUT, actor_client.weak(), clock);
        tokio::task::spawn(task.run());

        for _ in 0..3 {
            controller.advance(TIMEOUT);
            watcher.expect_election_timeout().await;
            watcher.expect_quiet().await;
        }
    }

    #[tokio::test]
    async fn reset_after_a_timeout_is_honored() {
        let (actor_client, rx) = ActorClient::new(10);
        let mut watcher = ActorQueueWatcher::new(rx);
        let (clock, mut controller) = mocked_clock();

        let (task, handle) = ElectionTimerTask::new(TIMEOUT..=TIMEOUT, actor_client.weak(), clock);
        tokio::task::spawn(task.run());

        // An AppendEntries may already be queued behind the timeout. The actor handles the
        // timeout first, then resets the timer while handling the AppendEntries.
        controller.advance(TIMEOUT);
        watcher.expect_election_timeout().await;
        handle.reset();

        for _ in 0..5 {
            controller.advance(TIMEOUT / 2);
            handle.reset();
        }
        watcher.expect_quiet().await;
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_the_task() {
        let (actor_client, rx) = ActorClient::new(10);
        let mut watcher = ActorQueueWatcher::new(rx);
        let (clock, mut controller) = mocked_clock();

        let (task, handle) = ElectionTimerTask::new(TIMEOUT..=TIMEOUT, actor_client.weak(), clock);
        let join_handle = tokio::task::spawn(task.run());
        drop(handle);

        controller.advance(TIMEOUT * 2);
        join_handle.await.unwrap();
        watcher.expect_quiet().await;
    }
}
