use crate::replica::peers::ReplicaId;
use bytes::{Buf, BufMut, BytesMut};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::fmt;

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub(crate) struct Term(u64);

impl Term {
    pub(crate) fn new(term: u64) -> Self {
        Term(term)
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn incr(&mut self) {
        self.0 += 1;
    }

    pub(crate) fn next(&self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PersistentLocalState is used whenever raft requires that something is persisted to a
/// durable store to guarantee safety. Not everything that uses disk has to go through this, only
/// algorithm-correctness-critical ones.
///
/// Store methods should be implemented atomically via a CAS like operation. Similar to most CAS
/// method signatures, the CAS store methods will return true if we have mutated state. A method
/// only returns once the mutation is durable.
pub(crate) trait PersistentLocalState: Send {
    /// Set current term to `new_term` atomically, iff it is larger than current term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_term_if_increased(&mut self, new_term: Term) -> io::Result<bool>;

    /// Store our vote for the latest term iff the latest term (internal state) is the same term as
    /// the one provided, and we have not stored a vote for the latest term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: ReplicaId) -> io::Result<bool>;

    /// Return the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self) -> io::Result<Term>;

    fn current_term(&self) -> Term;
    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>);
}

/// In memory only. A restart forgets term and vote, so it's only safe for tests or for a cluster
/// that is never restarted.
pub(crate) struct VolatileLocalState {
    current_term: Term,
    voted_for_this_term: Option<Arc<ReplicaId>>,
    my_replica_id: Arc<ReplicaId>,
}

impl VolatileLocalState {
    pub(crate) fn new(my_replica_id: ReplicaId) -> Self {
        VolatileLocalState {
            current_term: Term::new(0),
            voted_for_this_term: None,
            my_replica_id: Arc::new(my_replica_id),
        }
    }
}

// LOL @ that impl signature.
impl PersistentLocalState for VolatileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> io::Result<bool> {
        if new_term <= self.current_term {
            Ok(false)
        } else {
            self.current_term = new_term;
            self.voted_for_this_term = None;
            Ok(true)
        }
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> io::Result<bool> {
        if expected_term == self.current_term && self.voted_for_this_term.is_none() {
            self.voted_for_this_term.replace(Arc::new(vote));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn increment_term_and_vote_for_self(&mut self) -> io::Result<Term> {
        self.current_term.incr();
        self.voted_for_this_term.replace(self.my_replica_id.clone());

        Ok(self.current_term)
    }

    fn current_term(&self) -> Term {
        self.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        (self.current_term, self.voted_for_this_term.clone())
    }
}

/// FileLocalState keeps term and vote in a single small file. Each mutation writes a sibling temp
/// file, fsyncs it, and renames it over the original, so a crash leaves either the old or the new
/// state on disk and never a mix.
///
/// ```text
/// | Vrs | Term (8 bytes) | VoteLen (4 bytes) | Vote (VoteLen bytes) |
/// ```
pub(crate) struct FileLocalState {
    path: PathBuf,
    inner: VolatileLocalState,
}

const LOCAL_STATE_FORMAT_VERSION: u8 = 1;

impl FileLocalState {
    /// Loads state from `path`, or starts at term 0 if the file doesn't exist yet.
    pub(crate) fn open(path: PathBuf, my_replica_id: ReplicaId) -> io::Result<Self> {
        let mut inner = VolatileLocalState::new(my_replica_id);

        match fs::read(&path) {
            Ok(bytes) => {
                let (term, vote) = Self::decode(&bytes)?;
                inner.current_term = term;
                inner.voted_for_this_term = vote.map(Arc::new);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        Ok(FileLocalState { path, inner })
    }

    fn persist(&self) -> io::Result<()> {
        let bytes = Self::encode(self.inner.current_term, self.inner.voted_for_this_term.as_deref());

        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let mut file = File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)
    }

    fn encode(term: Term, vote: Option<&ReplicaId>) -> Vec<u8> {
        let vote = vote.map(|v| v.as_str().as_bytes()).unwrap_or(&[]);
        let mut buf = BytesMut::with_capacity(1 + 8 + 4 + vote.len());
        buf.put_u8(LOCAL_STATE_FORMAT_VERSION);
        buf.put_u64(term.as_u64());
        buf.put_u32(vote.len() as u32);
        buf.put_slice(vote);

        buf.to_vec()
    }

    fn decode(mut bytes: &[u8]) -> io::Result<(Term, Option<ReplicaId>)> {
        let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, format!("Local state file: {}", msg));

        if bytes.remaining() < 1 + 8 + 4 {
            return Err(invalid("too short"));
        }
        if bytes.get_u8() != LOCAL_STATE_FORMAT_VERSION {
            return Err(invalid("unknown version"));
        }
        let term = Term::new(bytes.get_u64());
        let vote_len = bytes.get_u32() as usize;
        if bytes.remaining() != vote_len {
            return Err(invalid("vote length mismatch"));
        }

        if vote_len == 0 {
            return Ok((term, None));
        }

        let vote = String::from_utf8(bytes.to_vec()).map_err(|_| invalid("vote is not utf-8"))?;
        Ok((term, Some(ReplicaId::new(vote))))
    }
}

impl PersistentLocalState for FileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> io::Result<bool> {
        if new_term <= self.inner.current_term {
            return Ok(false);
        }

        // A failed write rolls memory back so it keeps matching disk.
        let previous = (self.inner.current_term, self.inner.voted_for_this_term.take());
        self.inner.current_term = new_term;
        if let Err(e) = self.persist() {
            self.inner.current_term = previous.0;
            self.inner.voted_for_this_term = previous.1;
            return Err(e);
        }

        Ok(true)
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> io::Result<bool> {
        if expected_term != self.inner.current_term || self.inner.voted_for_this_term.is_some() {
            return Ok(false);
        }

        self.inner.voted_for_this_term = Some(Arc::new(vote));
        if let Err(e) = self.persist() {
            self.inner.voted_for_this_term = None;
            return Err(e);
        }

        Ok(true)
    }

    fn increment_term_and_vote_for_self(&mut self) -> io::Result<Term> {
        let previous = (self.inner.current_term, self.inner.voted_for_this_term.clone());
        let new_term = self.inner.increment_term_and_vote_for_self()?;
        if let Err(e) = self.persist() {
            self.inner.current_term = previous.0;
            self.inner.voted_for_this_term = previous.1;
            return Err(e);
        }

        Ok(new_term)
    }

    fn current_term(&self) -> Term {
        self.inner.current_term()
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        self.inner.voted_for_current_term()
    }
}
