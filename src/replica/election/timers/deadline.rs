use std::sync::{Arc, Mutex, Weak};
use tokio::time::Instant;

/// Owner side of a timer deadline. Dropping it closes the slot, which stops the timer task.
pub(super) struct DeadlineSlot {
    next: Arc<Mutex<Option<Instant>>>,
}

/// Timer task side of a deadline.
pub(super) struct DeadlineWatch {
    next: Weak<Mutex<Option<Instant>>>,
}

#[derive(Debug, PartialEq)]
pub(super) enum Wake {
    /// Someone pushed the deadline out. Sleep until then and look again.
    At(Instant),
    /// Nobody re-armed the slot since we last looked.
    Expired,
    /// The owner is gone.
    Closed,
}

pub(super) fn new() -> (DeadlineSlot, DeadlineWatch) {
    let next = Arc::new(Mutex::new(None));
    let watch = DeadlineWatch {
        next: Arc::downgrade(&next),
    };

    (DeadlineSlot { next }, watch)
}

impl DeadlineSlot {
    pub(super) fn arm(&self, at: Instant) {
        arm(&self.next, at);
    }
}

impl DeadlineWatch {
    pub(super) fn poll(&self) -> Wake {
        match self.next.upgrade() {
            None => Wake::Closed,
            Some(next) => match next.lock().expect("DeadlineWatch.poll() mutex guard poison").take() {
                Some(at) => Wake::At(at),
                None => Wake::Expired,
            },
        }
    }

    /// Returns false if the owner is gone.
    pub(super) fn rearm(&self, at: Instant) -> bool {
        match self.next.upgrade() {
            Some(next) => {
                arm(&next, at);
                true
            }
            None => false,
        }
    }
}

fn arm(next: &Mutex<Option<Instant>>, at: Instant) {
    next.lock().expect("DeadlineSlot.arm() mutex guard poison").replace(at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    #[test]
    fn poll_consumes_the_armed_deadline() {
        let (slot, watch) = new();
        let at = Instant::now() + Duration::from_millis(5);

        assert_eq!(watch.poll(), Wake::Expired);
        slot.arm(at);
        slot.arm(at + Duration::from_millis(1));
        assert_eq!(watch.poll(), Wake::At(at + Duration::from_millis(1)));
        assert_eq!(watch.poll(), Wake::Expired);
    }

    #[test]
    fn dropping_the_slot_closes_the_watch() {
        let (slot, watch) = new();
        assert!(watch.rearm(Instant::now()));

        drop(slot);
        assert_eq!(watch.poll(), Wake::Closed);
        assert!(!watch.rearm(Instant::now()));
    }
}
