use bytes::Bytes;
use std::fmt;

/// Term is the election epoch under which a log entry was accepted.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Term(u64);

impl Term {
    pub fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn plus(&self, delta: u64) -> Term {
        Term(self.0 + delta)
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index is the position of an entry in the consensus log. Entries are indexed starting
/// from 1; there is never an entry at index 0.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Index(u64);

impl Index {
    pub fn new(index: u64) -> Self {
        assert_ne!(index, 0, "Log entry index 0 does not exist.");
        Index(index)
    }

    pub fn start_index() -> Self {
        Self::new(1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index::new(self.0 + delta)
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of an accepted log entry. For a fixed group, a committed (term, index) pair
/// maps to exactly one payload, forever.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct EntryId {
    pub term: Term,
    pub index: Index,
}

/// Distinguishes app data entries from membership change entries. Dispatch on this is
/// always an exhaustive match; there is no third kind hiding anywhere.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EntryKind {
    Data,
    Config,
}

/// An entry that the consensus group has durably committed. Delivered in strictly
/// increasing index order, but possibly more than once per index.
#[derive(Clone, Debug)]
pub struct CommittedEntry {
    pub id: EntryId,
    pub kind: EntryKind,
    pub payload: Bytes,
}

/// Identifies one consensus group / storage partition pair. Stable for the partition's
/// lifetime.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ReplicaGroupId(String);

impl ReplicaGroupId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        ReplicaGroupId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for ReplicaGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one physical replica within a group.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        ReplicaId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ConsensusLog is the handle the engine holds onto the consensus library's local
/// replica. The consensus library exclusively owns entry durability and term/index
/// assignment; the engine never invents either.
///
/// Commit and leadership notifications are not part of this trait; they arrive on the
/// ordered [`crate::consensus::ConsensusEventStream`] the implementation publishes to.
pub trait ConsensusLog: Send + Sync + 'static {
    /// Hand a payload to the consensus group for replication. Only succeeds on the
    /// current leader. The assigned (term, index) is returned immediately; commit is
    /// reported later through the event stream.
    fn append(&self, kind: EntryKind, payload: Bytes) -> Result<EntryId, ConsensusAppendError>;

    fn is_leader(&self) -> bool;

    fn current_leader(&self) -> Option<ReplicaId>;

    fn current_term(&self) -> Term;

    /// Highest index the group has durably committed, as known locally. This is the
    /// authority the applied cursor is recovered against after restart; the engine
    /// never trusts an in-memory cursor over this.
    fn committed_index(&self) -> Option<Index>;

    /// Relinquish leadership. No-op on a non-leader.
    fn step_down(&self);

    /// Tell the consensus log it may discard entries at or below `index`; a snapshot
    /// covering them exists.
    fn compact_to(&self, index: Index);
}

#[derive(Debug, thiserror::Error)]
pub enum ConsensusAppendError {
    #[error("this replica is not the leader")]
    NotLeader { leader_hint: Option<ReplicaId> },

    // Likely an election in progress. Retryable with backoff.
    #[error("group has no established leader")]
    NoLeader,
}
