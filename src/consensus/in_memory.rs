use crate::consensus::api::{
    CommittedEntry, ConsensusAppendError, ConsensusLog, EntryId, EntryKind, Index, ReplicaId, Term,
};
use crate::consensus::events::{ConsensusEvent, ConsensusEventPublisher, LeaderChange};
use bytes::Bytes;
use std::sync::Mutex;

// An in-process consensus group of one. Quorum is immediate, so an appended entry
// commits as soon as `auto_commit` allows. This is not a consensus algorithm; it is the
// scriptable stand-in for one, used to drive the engine through commit, leadership, and
// delivery-fault scenarios in tests.
pub struct InMemoryConsensus {
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    publisher: ConsensusEventPublisher,
    inner: Mutex<Inner>,
}

struct Inner {
    log: Vec<StoredEntry>,
    term: Term,
    leader: bool,
    leader_hint: Option<ReplicaId>,
    committed: u64,
    compacted_below: u64,
    auto_commit: bool,
}

struct StoredEntry {
    term: Term,
    kind: EntryKind,
    payload: Bytes,
}

impl InMemoryConsensus {
    /// A group whose local replica starts as leader of `term` and commits every append
    /// immediately.
    pub fn new_leader(
        logger: slog::Logger,
        my_replica_id: ReplicaId,
        term: Term,
        publisher: ConsensusEventPublisher,
    ) -> Self {
        InMemoryConsensus {
            logger,
            my_replica_id,
            publisher,
            inner: Mutex::new(Inner {
                log: Vec::new(),
                term,
                leader: true,
                leader_hint: None,
                committed: 0,
                compacted_below: 0,
                auto_commit: true,
            }),
        }
    }

    /// A group whose local replica starts as a follower with no known leader.
    pub fn new_follower(
        logger: slog::Logger,
        my_replica_id: ReplicaId,
        term: Term,
        publisher: ConsensusEventPublisher,
    ) -> Self {
        InMemoryConsensus {
            logger,
            my_replica_id,
            publisher,
            inner: Mutex::new(Inner {
                log: Vec::new(),
                term,
                leader: false,
                leader_hint: None,
                committed: 0,
                compacted_below: 0,
                auto_commit: true,
            }),
        }
    }

    /// When off, appended entries stay uncommitted until [`Self::release_commits`].
    pub fn set_auto_commit(&self, auto_commit: bool) {
        self.inner.lock().unwrap().auto_commit = auto_commit;
    }

    /// Commit (and publish) all entries up to and including `up_to`, in order.
    pub fn release_commits(&self, up_to: Index) {
        let to_publish = {
            let mut inner = self.inner.lock().unwrap();
            let ceiling = std::cmp::min(up_to.as_u64(), inner.log.len() as u64);
            let from = inner.committed;
            inner.committed = std::cmp::max(inner.committed, ceiling);
            (from..ceiling)
                .map(|i| inner.committed_entry_at(Index::new(i + 1)))
                .collect::<Vec<_>>()
        };

        for entry in to_publish {
            self.publisher
                .publish(&self.logger, ConsensusEvent::Committed(entry));
        }
    }

    /// Publish an already-committed entry a second time. The engine is required to
    /// treat this as a silent no-op.
    pub fn redeliver(&self, index: Index) {
        let entry = {
            let inner = self.inner.lock().unwrap();
            assert!(
                index.as_u64() <= inner.committed,
                "Cannot redeliver an uncommitted entry."
            );
            inner.committed_entry_at(index)
        };

        self.publisher
            .publish(&self.logger, ConsensusEvent::Committed(entry));
    }

    /// Lose leadership: a higher term was observed with (possibly) a new leader.
    pub fn become_follower(&self, new_term: Term, leader: Option<ReplicaId>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.term = new_term;
            inner.leader = false;
            inner.leader_hint = leader.clone();
        }

        self.publisher.publish(
            &self.logger,
            ConsensusEvent::LeaderChange(LeaderChange {
                term: new_term,
                is_leader: false,
                leader,
            }),
        );
    }

    /// Win an election for `new_term`.
    pub fn become_leader(&self, new_term: Term) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.term = new_term;
            inner.leader = true;
            inner.leader_hint = None;
        }

        self.publisher.publish(
            &self.logger,
            ConsensusEvent::LeaderChange(LeaderChange {
                term: new_term,
                is_leader: true,
                leader: Some(self.my_replica_id.clone()),
            }),
        );
    }

    pub fn log_len(&self) -> u64 {
        self.inner.lock().unwrap().log.len() as u64
    }

    pub fn compacted_below(&self) -> u64 {
        self.inner.lock().unwrap().compacted_below
    }
}

impl Inner {
    fn committed_entry_at(&self, index: Index) -> CommittedEntry {
        let stored = &self.log[(index.as_u64() - 1) as usize];
        CommittedEntry {
            id: EntryId {
                term: stored.term,
                index,
            },
            kind: stored.kind,
            payload: stored.payload.clone(),
        }
    }
}

impl ConsensusLog for InMemoryConsensus {
    fn append(&self, kind: EntryKind, payload: Bytes) -> Result<EntryId, ConsensusAppendError> {
        let (entry_id, committed_entry) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.leader {
                return match &inner.leader_hint {
                    Some(leader) => Err(ConsensusAppendError::NotLeader {
                        leader_hint: Some(leader.clone()),
                    }),
                    None => Err(ConsensusAppendError::NoLeader),
                };
            }

            let term = inner.term;
            inner.log.push(StoredEntry {
                term,
                kind,
                payload,
            });
            let index = Index::new(inner.log.len() as u64);
            let entry_id = EntryId { term, index };

            if inner.auto_commit {
                inner.committed = index.as_u64();
                (entry_id, Some(inner.committed_entry_at(index)))
            } else {
                (entry_id, None)
            }
        };

        if let Some(entry) = committed_entry {
            self.publisher
                .publish(&self.logger, ConsensusEvent::Committed(entry));
        }

        Ok(entry_id)
    }

    fn is_leader(&self) -> bool {
        self.inner.lock().unwrap().leader
    }

    fn current_leader(&self) -> Option<ReplicaId> {
        let inner = self.inner.lock().unwrap();
        if inner.leader {
            Some(self.my_replica_id.clone())
        } else {
            inner.leader_hint.clone()
        }
    }

    fn current_term(&self) -> Term {
        self.inner.lock().unwrap().term
    }

    fn committed_index(&self) -> Option<Index> {
        let inner = self.inner.lock().unwrap();
        if inner.committed == 0 {
            None
        } else {
            Some(Index::new(inner.committed))
        }
    }

    fn step_down(&self) {
        let changed = {
            let mut inner = self.inner.lock().unwrap();
            if inner.leader {
                inner.leader = false;
                inner.leader_hint = None;
                Some(inner.term)
            } else {
                None
            }
        };

        if let Some(term) = changed {
            self.publisher.publish(
                &self.logger,
                ConsensusEvent::LeaderChange(LeaderChange {
                    term,
                    is_leader: false,
                    leader: None,
                }),
            );
        }
    }

    fn compact_to(&self, index: Index) {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            index.as_u64() <= inner.committed,
            "Refusing to compact past the commit floor."
        );
        inner.compacted_below = std::cmp::max(inner.compacted_below, index.as_u64());
    }
}
