use crate::commitlog::{Entry, Index, Log};
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::io;
use std::marker::PhantomData;

// I am focusing on learning raft's consensus algorithm, not strictly about exactly how to
// persist the data durably. I will theoretically model it here.
pub struct InMemoryLog<E: Entry> {
    logger: slog::Logger,
    // We don't *need* to convert these to bytes. We could just hold the original entry in memory,
    // but we want to exercise the conversion logic.
    log: VecDeque<Vec<u8>>,
    // Index of `log[0]`.
    first_index: Index,
    _pd: PhantomData<fn() -> E>,
}

impl<E: Entry> InMemoryLog<E> {
    pub fn create(logger: slog::Logger) -> Result<Self, io::Error> {
        Ok(InMemoryLog {
            logger,
            log: VecDeque::new(),
            first_index: Index::start_index(),
            _pd: PhantomData::default(),
        })
    }

    fn offset(&self, index: Index) -> Option<usize> {
        if index < self.first_index {
            return None;
        }

        Some((index.as_u64() - self.first_index.as_u64()) as usize)
    }
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        let index = self.next_index();
        self.log.push_back(entry.into());

        Ok(index)
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        match self.offset(index) {
            None => Ok(None),
            Some(offset) => self.log.get(offset).cloned().map(E::try_from).transpose(),
        }
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        match self.offset(index) {
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Can't truncate at {:?}, it precedes first retained index {:?}",
                    index, self.first_index
                ),
            )),
            Some(offset) => {
                self.log.truncate(offset);
                Ok(())
            }
        }
    }

    fn purge(&mut self, index: Index) -> Result<(), io::Error> {
        if index < self.first_index {
            return Ok(());
        }

        let num_to_purge = std::cmp::min(
            (index.as_u64() - self.first_index.as_u64() + 1) as usize,
            self.log.len(),
        );
        self.log.drain(..num_to_purge);
        self.first_index = index.plus(1);
        slog::debug!(self.logger, "Purged log through {:?}", index);

        Ok(())
    }

    fn reset(&mut self, next_index: Index) -> Result<(), io::Error> {
        self.log.clear();
        self.first_index = next_index;
        slog::debug!(self.logger, "Reset log, next index is {:?}", next_index);

        Ok(())
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        // Nothing to do, memory is as durable as it gets.
        Ok(())
    }

    fn next_index(&self) -> Index {
        self.first_index.plus(self.log.len() as u64)
    }

    fn first_index(&self) -> Index {
        self.first_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct TestEntry(Vec<u8>);

    impl Entry for TestEntry {}

    impl From<TestEntry> for Vec<u8> {
        fn from(entry: TestEntry) -> Self {
            entry.0
        }
    }

    impl TryFrom<Vec<u8>> for TestEntry {
        type Error = io::Error;

        fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
            Ok(TestEntry(bytes))
        }
    }

    fn new_log() -> InMemoryLog<TestEntry> {
        InMemoryLog::create(slog::Logger::root(slog::Discard, slog::o!())).unwrap()
    }

    fn entry(v: u8) -> TestEntry {
        TestEntry(vec![v])
    }

    #[test]
    fn append_and_read() {
        let mut log = new_log();
        assert_eq!(log.next_index(), Index::start_index());

        assert_eq!(log.append(entry(1)).unwrap(), Index::new(1));
        assert_eq!(log.append(entry(2)).unwrap(), Index::new(2));

        assert_eq!(log.read(Index::new(1)).unwrap(), Some(entry(1)));
        assert_eq!(log.read(Index::new(2)).unwrap(), Some(entry(2)));
        assert_eq!(log.read(Index::new(3)).unwrap(), None);
        assert_eq!(log.next_index(), Index::new(3));
    }

    #[test]
    fn truncate_suffix() {
        let mut log = new_log();
        for v in 1..=5 {
            log.append(entry(v)).unwrap();
        }

        log.truncate(Index::new(3)).unwrap();
        assert_eq!(log.next_index(), Index::new(3));
        assert_eq!(log.read(Index::new(3)).unwrap(), None);

        // Appending after truncation reuses the index.
        assert_eq!(log.append(entry(9)).unwrap(), Index::new(3));
        assert_eq!(log.read(Index::new(3)).unwrap(), Some(entry(9)));
    }

    #[test]
    fn purge_prefix() {
        let mut log = new_log();
        for v in 1..=5 {
            log.append(entry(v)).unwrap();
        }

        log.purge(Index::new(3)).unwrap();
        assert_eq!(log.first_index(), Index::new(4));
        assert_eq!(log.next_index(), Index::new(6));
        assert_eq!(log.read(Index::new(3)).unwrap(), None);
        assert_eq!(log.read(Index::new(4)).unwrap(), Some(entry(4)));

        // Can't truncate into the purged prefix.
        assert!(log.truncate(Index::new(2)).is_err());

        // Purging past the end leaves an empty log that continues after the purge point.
        log.purge(Index::new(7)).unwrap();
        assert_eq!(log.first_index(), Index::new(8));
        assert_eq!(log.next_index(), Index::new(8));
    }

    #[test]
    fn reset_to_index() {
        let mut log = new_log();
        for v in 1..=3 {
            log.append(entry(v)).unwrap();
        }

        log.reset(Index::new(11)).unwrap();
        assert_eq!(log.first_index(), Index::new(11));
        assert_eq!(log.read(Index::new(2)).unwrap(), None);
        assert_eq!(log.append(entry(4)).unwrap(), Index::new(11));
    }

    fn boxed<E: Entry, L: Log<E>>(log: L) -> Box<dyn Log<E>> {
        Box::new(log)
    }

    #[tokio::test]
    async fn usable_from_another_task() {
        let mut log = boxed(new_log());
        log.append(entry(1)).unwrap();

        let log = tokio::spawn(async move {
            log.append(entry(2)).unwrap();
            log
        })
        .await
        .unwrap();
        assert_eq!(log.read(Index::new(2)).unwrap(), Some(entry(2)));
    }
}
