use crate::consensus::{EntryId, Index, ReplicaGroupId, ReplicaId, Term};
use crate::engine::membership::ReplicaInfo;
use crate::storage::StorageError;
use bytes::Bytes;
use std::fmt;
use tokio::sync::oneshot;

/// Client-supplied idempotency token for one logical command. The token travels inside
/// the replicated entry, so every replica deduplicates the same way; a retry carrying
/// the token of an already-applied command is answered from the dedup record instead of
/// being applied again.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProposalToken(u128);

impl ProposalToken {
    pub fn new(token: u128) -> Self {
        ProposalToken(token)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }
}

impl fmt::Debug for ProposalToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Result of a command reaching the applied cursor.
#[derive(Clone, Debug)]
pub struct AppliedOutput {
    pub entry_id: EntryId,
    /// Previous value under the command's key, when the apply observed one. `None` for
    /// deduplicated retries; the first apply already consumed it.
    pub previous: Option<Bytes>,
}

pub(crate) type ProposalOutcome = Result<AppliedOutput, ProposeError>;

/// What the engine hands back for an accepted (or deduplicated) propose call.
#[derive(Debug)]
pub(crate) enum ProposeStarted {
    Pending(ProposeReceipt),
    AlreadyApplied(AppliedOutput),
}

#[derive(Debug)]
pub(crate) struct ProposeReceipt {
    pub(crate) entry_id: EntryId,
    pub(crate) completion: oneshot::Receiver<ProposalOutcome>,
}

/// Handle on an accepted membership change. The change has been enqueued in the
/// consensus log; it takes effect only once committed and applied.
#[derive(Debug)]
pub struct ReconfigureReceipt {
    pub entry_id: EntryId,
    pub(crate) applied: oneshot::Receiver<Result<(), ReconfigureError>>,
}

impl ReconfigureReceipt {
    /// Wait until the change has been committed and applied to the membership view.
    pub async fn applied(self) -> Result<(), ReconfigureError> {
        match self.applied.await {
            Ok(result) => result,
            Err(_) => Err(ReconfigureError::ActorExited),
        }
    }
}

/// Point-in-time description of one replica group as seen from this replica.
#[derive(Clone, Debug)]
pub struct GroupDescription {
    pub group_id: ReplicaGroupId,
    pub leader: Option<ReplicaId>,
    pub term: Term,
    pub members: Vec<ReplicaInfo>,
    /// Highest index applied to storage locally.
    pub commit_cursor: Option<Index>,
    /// Highest index the consensus group has committed, as known locally.
    pub committed_index: Option<Index>,
    pub serving: bool,
}

/// Why a replica stopped serving. These faults are not locally recoverable: the replica
/// steps down and refuses all traffic until restarted and resynced, while the rest of
/// the group keeps going.
#[derive(Clone, Debug, thiserror::Error)]
pub enum HaltReason {
    #[error("storage engine fault during apply: {0}")]
    StorageFault(String),

    #[error("commit delivery violated ordering: expected {expected:?}, observed {observed:?}")]
    CommitOrderViolation { expected: Index, observed: Index },

    #[error("snapshot install failed mid-flight: {0}")]
    SnapshotInstallFailure(String),

    #[error("committed entry at {index:?} could not be decoded")]
    CorruptedEntry { index: Index },
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum ProposeError {
    #[error("this replica is not the leader")]
    NotLeader { hint: Option<ReplicaId> },

    // Likely an election in progress. Retry with backoff.
    #[error("group has no established leader")]
    NoLeader,

    #[error("leadership changed at term {observed_term:?} before the proposal committed")]
    LeadershipLost { observed_term: Term },

    #[error("proposal timed out before commit")]
    Timeout,

    #[error("proposal fell below a snapshot install; re-derive state from the current snapshot")]
    SupersededBySnapshot,

    #[error("replica has stopped serving: {0}")]
    Halted(HaltReason),

    #[error("replica group engine has shut down")]
    ActorExited,
}

impl ProposeError {
    /// Whether retrying with the *same idempotency token* cannot double-apply the
    /// command. `SupersededBySnapshot` is the one unsafe case: the snapshot replaced
    /// the dedup record that would have absorbed the retry.
    pub fn retry_safe(&self) -> bool {
        match self {
            ProposeError::NotLeader { .. } => true,
            ProposeError::NoLeader => true,
            ProposeError::LeadershipLost { .. } => true,
            ProposeError::Timeout => true,
            ProposeError::SupersededBySnapshot => false,
            ProposeError::Halted(_) => true,
            ProposeError::ActorExited => true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("this replica is not the leader")]
    NotLeader { hint: Option<ReplicaId> },

    #[error("read barrier was not satisfied within the timeout")]
    Timeout,

    #[error("replica has stopped serving: {0}")]
    Halted(HaltReason),

    #[error("storage engine failed the read: {0}")]
    Storage(#[from] StorageError),

    #[error("replica group engine has shut down")]
    ActorExited,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconfigureError {
    #[error("this replica is not the leader")]
    NotLeader { hint: Option<ReplicaId> },

    #[error("group has no established leader")]
    NoLeader,

    // At most one membership change in flight per group. Retry after backoff.
    #[error("another membership change is awaiting commit")]
    ReconfigurationInProgress,

    #[error("{replica_id:?} is already a member with the requested role")]
    AlreadyMember { replica_id: ReplicaId },

    #[error("{replica_id:?} is not a member of the group")]
    UnknownReplica { replica_id: ReplicaId },

    #[error("change would leave the group without a voting member")]
    WouldOrphanGroup,

    #[error("replica has stopped serving: {0}")]
    Halted(HaltReason),

    #[error("replica group engine has shut down")]
    ActorExited,
}

#[derive(Debug, thiserror::Error)]
pub enum DescribeError {
    #[error("replica group engine has shut down")]
    ActorExited,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("nothing applied yet; no state to snapshot")]
    NothingApplied,

    // Snapshot install and reconfiguration are serialized per group.
    #[error("a membership change is awaiting commit")]
    ReconfigurationInProgress,

    #[error("descriptor floor {descriptor:?} is not ahead of the applied cursor {cursor:?}")]
    StaleDescriptor {
        descriptor: Index,
        cursor: Option<Index>,
    },

    #[error("storage engine failed: {0}")]
    Storage(#[from] StorageError),

    #[error("replica has stopped serving: {0}")]
    Halted(HaltReason),

    #[error("replica group engine has shut down")]
    ActorExited,
}
