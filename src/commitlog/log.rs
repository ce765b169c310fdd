use std::convert::TryFrom;
use std::{fmt, io};

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
struct U64NonZero(u64);

impl U64NonZero {
    fn new(val: u64) -> Self {
        assert_ne!(val, 0);
        U64NonZero(val)
    }
}

/// Index is an index of an entry in the log; i.e. a log entry's index.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Index(U64NonZero);

impl Index {
    pub fn new(index: u64) -> Self {
        Index(U64NonZero::new(index))
    }

    /// Maps the wire/sentinel representation (0 means "no index") into an optional index.
    pub fn from_u64_or_none(index: u64) -> Option<Self> {
        if index == 0 {
            None
        } else {
            Some(Self::new(index))
        }
    }

    pub fn start_index() -> Self {
        Self::new(1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0 .0
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index::new(self.as_u64() + delta)
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Index> {
        match self.as_u64().checked_sub(delta) {
            Some(new_value) if new_value > 0 => Some(Index::new(new_value)),
            _ => None,
        }
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 .0)
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 .0)
    }
}

/// Log is an append only log intended for use as a replicated commit log in a database.
///
/// Log indexes entries starting from 1. There will be no entry existing at index 0. The first
/// entry is written at index 1. A log may be compacted, after which its first retained index is
/// larger than 1 and reads of anything earlier return `None`.
pub trait Log<E: Entry>: Send + 'static {
    /// append() appends a log entry to the log at the next log entry index, then returns
    /// the log entry index that was just used to append the entry.
    fn append(&mut self, entry: E) -> Result<Index, io::Error>;

    /// Read log entry at specified index. Returns `None` for purged or not-yet-written indexes.
    fn read(&self, index: Index) -> Result<Option<E>, io::Error>;

    /// Deletes anything starting at `index` and later.
    fn truncate(&mut self, index: Index) -> Result<(), io::Error>;

    /// Deletes anything up to and including `index`. Used for compaction once a snapshot covers
    /// the purged prefix.
    fn purge(&mut self, index: Index) -> Result<(), io::Error>;

    /// Deletes every entry. The next append will land at `next_index`.
    fn reset(&mut self, next_index: Index) -> Result<(), io::Error>;

    /// Blocks until every appended entry is durable.
    fn flush(&mut self) -> Result<(), io::Error>;

    /// next_index returns the next index that will be used to append an entry.
    fn next_index(&self) -> Index;

    /// first_index returns the earliest index still retained by the log. If the log is empty, this
    /// is the same as `next_index()`.
    fn first_index(&self) -> Index;
}

pub trait Entry: Clone + Into<Vec<u8>> + TryFrom<Vec<u8>, Error = io::Error> + 'static {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_arithmetic() {
        let index = Index::new(5);
        assert_eq!(index.plus(2), Index::new(7));
        assert_eq!(index.checked_minus(4), Some(Index::new(1)));
        assert_eq!(index.checked_minus(5), None);
        assert_eq!(index.checked_minus(6), None);
    }

    #[test]
    fn index_sentinel() {
        assert_eq!(Index::from_u64_or_none(0), None);
        assert_eq!(Index::from_u64_or_none(3), Some(Index::new(3)));
    }

    #[test]
    #[should_panic]
    fn index_zero_is_illegal() {
        Index::new(0);
    }
}
