use tokio::time::{Duration, Instant};

/// Source of time for timers and expiry. Tests swap in a clock they advance by hand.
#[async_trait::async_trait]
pub(crate) trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;
    async fn sleep_until(&mut self, deadline: Instant);

    async fn sleep(&mut self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

#[derive(Copy, Clone)]
pub(crate) struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
pub(crate) use mock::mocked_clock;

#[cfg(test)]
mod mock {
    use super::Clock;
    use tokio::sync::watch;
    use tokio::time::{Duration, Instant};

    pub(crate) fn mocked_clock() -> (MockClock, MockClockController) {
        let start = Instant::now();
        let (tx, rx) = watch::channel(start);

        (MockClock { now: rx }, MockClockController { now: tx, start })
    }

    #[derive(Clone)]
    pub(crate) struct MockClock {
        now: watch::Receiver<Instant>,
    }

    #[async_trait::async_trait]
    impl Clock for MockClock {
        fn now(&self) -> Instant {
            *self.now.borrow()
        }

        async fn sleep_until(&mut self, deadline: Instant) {
            while *self.now.borrow() < deadline {
                if self.now.changed().await.is_err() {
                    // Controller is gone, time stands still forever.
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    pub(crate) struct MockClockController {
        now: watch::Sender<Instant>,
        start: Instant,
    }

    impl MockClockController {
        pub(crate) fn elapsed(&self) -> Duration {
            *self.now.borrow() - self.start
        }

        /// Sleepers wake once `now` reaches their deadline, not at it. A single large step wakes
        /// a periodic sleeper only once, so step in increments no larger than what a test observes.
        pub(crate) fn advance(&mut self, duration: Duration) {
            let next = *self.now.borrow() + duration;
            let _ = self.now.send(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_sleeper_wakes_only_once_deadline_is_reached() {
        let (clock, mut controller) = mocked_clock();
        let deadline = clock.now() + Duration::from_secs(10);

        let mut sleeper_clock = clock.clone();
        let sleeper = tokio::spawn(async move { sleeper_clock.sleep_until(deadline).await });

        controller.advance(Duration::from_secs(4));
        controller.advance(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sleeper.is_finished());

        controller.advance(Duration::from_secs(1));
        tokio::time::timeout(Duration::from_secs(5), sleeper)
            .await
            .expect("sleeper should wake")
            .unwrap();
        assert_eq!(controller.elapsed(), Duration::from_secs(10));
        assert_eq!(clock.now(), deadline);
    }

    #[tokio::test]
    async fn mock_sleep_is_relative_to_mock_now() {
        let (mut clock, mut controller) = mocked_clock();
        controller.advance(Duration::from_secs(60));

        let mut sleep = clock.sleep(Duration::from_secs(1));
        // First poll fixes the deadline at 61s.
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut sleep).await.is_err());

        controller.advance(Duration::from_secs(1));
        tokio::time::timeout(Duration::from_secs(5), sleep).await.unwrap();
        assert_eq!(controller.elapsed(), Duration::from_secs(61));
    }
}
