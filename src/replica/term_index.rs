use crate::commitlog::Index;
use crate::replica::local_state::Term;
use std::fmt;

/// TermIndex names a position in the log: the entry at `index`, written in `term`.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TermIndex {
    pub(crate) term: Term,
    pub(crate) index: Index,
}

impl TermIndex {
    pub(crate) fn new(term: Term, index: Index) -> Self {
        TermIndex { term, index }
    }

    /// Wire form, where (0, 0) means "no entry".
    pub(crate) fn from_u64s(term: u64, index: u64) -> Result<Option<Self>, &'static str> {
        match (term, index) {
            (0, 0) => Ok(None),
            (0, _) => Err("TermIndex has 0 term but non-0 index"),
            (_, 0) => Err("TermIndex has non-0 term but 0 index"),
            (term, index) => Ok(Some(TermIndex::new(Term::new(term), Index::new(index)))),
        }
    }

    pub(crate) fn to_u64s(opt: Option<TermIndex>) -> (u64, u64) {
        match opt {
            None => (0, 0),
            Some(ti) => (ti.term.as_u64(), ti.index.as_u64()),
        }
    }

    /// > Raft determines which of two logs is more up-to-date
    /// > by comparing the index and term of the last entries in the
    /// > logs. If the logs have last entries with different terms, then
    /// > the log with the later term is more up-to-date. If the logs
    /// > end with the same term, then whichever log is longer is
    /// > more up-to-date.
    pub(crate) fn is_at_least_as_up_to_date(candidate: Option<TermIndex>, mine: Option<TermIndex>) -> bool {
        match (mine, candidate) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(mine), Some(candidate)) => {
                if candidate.term != mine.term {
                    candidate.term > mine.term
                } else {
                    candidate.index >= mine.index
                }
            }
        }
    }
}

impl fmt::Debug for TermIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(t:{:?}, i:{:?})", self.term, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ti(term: u64, index: u64) -> Option<TermIndex> {
        TermIndex::from_u64s(term, index).unwrap()
    }

    #[test]
    fn up_to_date_comparison() {
        // Empty logs
        assert!(TermIndex::is_at_least_as_up_to_date(None, None));
        assert!(TermIndex::is_at_least_as_up_to_date(ti(1, 1), None));
        assert!(!TermIndex::is_at_least_as_up_to_date(None, ti(1, 1)));

        // Later term wins regardless of length.
        assert!(TermIndex::is_at_least_as_up_to_date(ti(3, 2), ti(2, 10)));
        assert!(!TermIndex::is_at_least_as_up_to_date(ti(2, 10), ti(3, 2)));

        // Same term, longer wins, equal is fine.
        assert!(TermIndex::is_at_least_as_up_to_date(ti(2, 5), ti(2, 5)));
        assert!(TermIndex::is_at_least_as_up_to_date(ti(2, 6), ti(2, 5)));
        assert!(!TermIndex::is_at_least_as_up_to_date(ti(2, 4), ti(2, 5)));
    }

    #[test]
    fn wire_form() {
        assert_eq!(TermIndex::from_u64s(0, 0), Ok(None));
        assert!(TermIndex::from_u64s(4, 0).is_err());
        assert_eq!(TermIndex::to_u64s(ti(4, 9)), (4, 9));
        assert_eq!(TermIndex::to_u64s(None), (0, 0));
    }
}
