use crate::consensus::{EntryId, Index, ReplicaId, Term};
use crate::engine::applier::PayloadDecodeError;
use crate::engine::engine_api::ReconfigureError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tokio::sync::oneshot;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReplicaRole {
    /// Participates in quorum and elections.
    Voting,
    /// Receives replicated data without counting toward quorum.
    Learner,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReplicaInfo {
    pub replica_id: ReplicaId,
    pub role: ReplicaRole,
    /// Index of the committed Config entry that last changed this replica's standing.
    pub last_known_index: Option<Index>,
}

impl ReplicaInfo {
    pub fn new(replica_id: ReplicaId, role: ReplicaRole) -> Self {
        ReplicaInfo {
            replica_id,
            role,
            last_known_index: None,
        }
    }
}

/// The committed membership of one group. Mutated only by applying committed Config
/// entries (or installing a snapshot that carries a newer view), so every replica holds
/// the same view at the same log index.
#[derive(Clone, Debug, Default)]
pub struct MembershipView {
    members: BTreeMap<ReplicaId, ReplicaInfo>,
}

impl MembershipView {
    pub fn new(members: Vec<ReplicaInfo>) -> Self {
        let members = members
            .into_iter()
            .map(|info| (info.replica_id.clone(), info))
            .collect();
        MembershipView { members }
    }

    pub fn contains(&self, replica_id: &ReplicaId) -> bool {
        self.members.contains_key(replica_id)
    }

    pub fn get(&self, replica_id: &ReplicaId) -> Option<&ReplicaInfo> {
        self.members.get(replica_id)
    }

    pub fn voting_count(&self) -> usize {
        self.members
            .values()
            .filter(|info| info.role == ReplicaRole::Voting)
            .count()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in stable (id-sorted) order.
    pub fn members(&self) -> Vec<ReplicaInfo> {
        self.members.values().cloned().collect()
    }

    fn insert(&mut self, info: ReplicaInfo) {
        self.members.insert(info.replica_id.clone(), info);
    }

    fn remove(&mut self, replica_id: &ReplicaId) -> Option<ReplicaInfo> {
        self.members.remove(replica_id)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MemberChange {
    Add {
        replica_id: ReplicaId,
        role: ReplicaRole,
    },
    Remove {
        replica_id: ReplicaId,
    },
    /// Learner has caught up; make it a voter.
    Promote {
        replica_id: ReplicaId,
    },
}

impl MemberChange {
    pub fn replica_id(&self) -> &ReplicaId {
        match self {
            MemberChange::Add { replica_id, .. } => replica_id,
            MemberChange::Remove { replica_id } => replica_id,
            MemberChange::Promote { replica_id } => replica_id,
        }
    }
}

/// Byte representation of a Config-kind entry payload:
///
/// ```text
/// | 0 | 1 | 2    | 3 ...                 |
/// +---+---+------+-----------------------+
/// |Vrs|Tag|Role? | replica id (utf8)     |
/// +---+---+------+-----------------------+
/// ```
///
/// * `Vrs` - version of the serialized payload
/// * `Tag` - 1 = Add, 2 = Remove, 3 = Promote
/// * `Role` - only present for Add; 0 = Voting, 1 = Learner
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ConfigRecord {
    pub(crate) change: MemberChange,
}

const CONFIG_RECORD_FORMAT_VERSION: u8 = 1;

const TAG_ADD: u8 = 1;
const TAG_REMOVE: u8 = 2;
const TAG_PROMOTE: u8 = 3;

impl ConfigRecord {
    pub(crate) fn encode(&self) -> Bytes {
        let replica_id = self.change.replica_id().as_str().as_bytes();
        let mut bytes = BytesMut::with_capacity(3 + replica_id.len());

        bytes.put_u8(CONFIG_RECORD_FORMAT_VERSION);
        match &self.change {
            MemberChange::Add { role, .. } => {
                bytes.put_u8(TAG_ADD);
                bytes.put_u8(match role {
                    ReplicaRole::Voting => 0,
                    ReplicaRole::Learner => 1,
                });
            }
            MemberChange::Remove { .. } => bytes.put_u8(TAG_REMOVE),
            MemberChange::Promote { .. } => bytes.put_u8(TAG_PROMOTE),
        }
        bytes.put_slice(replica_id);

        bytes.freeze()
    }

    pub(crate) fn decode(payload: &Bytes) -> Result<ConfigRecord, PayloadDecodeError> {
        let mut buf = payload.clone();
        if buf.remaining() < 2 {
            return Err(PayloadDecodeError::Truncated);
        }

        let version = buf.get_u8();
        if version != CONFIG_RECORD_FORMAT_VERSION {
            return Err(PayloadDecodeError::UnsupportedVersion(version));
        }

        let tag = buf.get_u8();
        let role = if tag == TAG_ADD {
            if buf.remaining() < 1 {
                return Err(PayloadDecodeError::Truncated);
            }
            Some(match buf.get_u8() {
                0 => ReplicaRole::Voting,
                1 => ReplicaRole::Learner,
                other => return Err(PayloadDecodeError::UnknownTag(other)),
            })
        } else {
            None
        };

        let replica_id = String::from_utf8(buf.to_vec())
            .map_err(|_| PayloadDecodeError::MalformedField("replica id"))?;
        if replica_id.is_empty() {
            return Err(PayloadDecodeError::MalformedField("replica id"));
        }
        let replica_id = ReplicaId::new(replica_id);

        let change = match tag {
            TAG_ADD => MemberChange::Add {
                replica_id,
                // Role byte was parsed above whenever tag is Add.
                role: role.unwrap(),
            },
            TAG_REMOVE => MemberChange::Remove { replica_id },
            TAG_PROMOTE => MemberChange::Promote { replica_id },
            other => return Err(PayloadDecodeError::UnknownTag(other)),
        };

        Ok(ConfigRecord { change })
    }
}

/// Outcome of applying one committed Config entry.
#[derive(Debug)]
pub(crate) struct AppliedConfig {
    pub(crate) change: MemberChange,
    /// The entry removed this replica from the group.
    pub(crate) removed_self: bool,
}

#[derive(Debug)]
enum ReconfigState {
    Stable,
    /// Change validated and encoded; consensus append in progress.
    Proposing,
    /// Change accepted into the log; waiting for its commit to arrive.
    AwaitingCommit {
        entry_id: EntryId,
        applied_tx: Option<oneshot::Sender<Result<(), ReconfigureError>>>,
    },
}

/// MembershipController tracks the current replica set and drives add/remove/promote
/// requests through consensus. At most one change is in flight per group; a second
/// request is rejected until the first one's Config entry commits.
pub(crate) struct MembershipController {
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    view: MembershipView,
    state: ReconfigState,
}

impl MembershipController {
    pub(crate) fn new(
        logger: slog::Logger,
        my_replica_id: ReplicaId,
        initial_view: MembershipView,
    ) -> Self {
        MembershipController {
            logger,
            my_replica_id,
            view: initial_view,
            state: ReconfigState::Stable,
        }
    }

    pub(crate) fn view(&self) -> &MembershipView {
        &self.view
    }

    pub(crate) fn in_flight(&self) -> bool {
        !matches!(self.state, ReconfigState::Stable)
    }

    /// Validate `change` against the committed view and move to `Proposing`. Returns the
    /// encoded Config payload to hand to consensus.
    pub(crate) fn begin_change(&mut self, change: &MemberChange) -> Result<Bytes, ReconfigureError> {
        if self.in_flight() {
            return Err(ReconfigureError::ReconfigurationInProgress);
        }
        self.validate(change)?;

        self.state = ReconfigState::Proposing;
        Ok(ConfigRecord {
            change: change.clone(),
        }
        .encode())
    }

    /// Consensus accepted the change's entry; wait for its commit.
    pub(crate) fn change_enqueued(
        &mut self,
        entry_id: EntryId,
    ) -> oneshot::Receiver<Result<(), ReconfigureError>> {
        debug_assert!(matches!(self.state, ReconfigState::Proposing));
        let (tx, rx) = oneshot::channel();
        self.state = ReconfigState::AwaitingCommit {
            entry_id,
            applied_tx: Some(tx),
        };
        rx
    }

    /// Consensus rejected the append; back to `Stable`.
    pub(crate) fn abort_proposing(&mut self) {
        debug_assert!(matches!(self.state, ReconfigState::Proposing));
        self.state = ReconfigState::Stable;
    }

    /// A leadership change at `term` invalidates a change still awaiting commit under an
    /// older term. The entry may still commit later and will be applied as usual; only
    /// the caller waiting on this replica is told to retry.
    pub(crate) fn invalidate_stale_change(&mut self, term: Term) {
        if let ReconfigState::AwaitingCommit {
            entry_id,
            applied_tx,
        } = &mut self.state
        {
            if entry_id.term < term {
                slog::info!(
                    self.logger,
                    "Membership change at {:?} invalidated by leadership change at term {:?}",
                    entry_id,
                    term,
                );
                if let Some(tx) = applied_tx.take() {
                    let _ = tx.send(Err(ReconfigureError::NotLeader { hint: None }));
                }
                self.state = ReconfigState::Stable;
            }
        }
    }

    /// Apply one committed Config entry to the view. Deterministic and tolerant: a
    /// nonsensical change (remove of an unknown replica) is logged and skipped, the
    /// same way on every replica.
    pub(crate) fn apply_config(&mut self, id: EntryId, record: ConfigRecord) -> AppliedConfig {
        let change = record.change;
        let mut removed_self = false;

        match &change {
            MemberChange::Add { replica_id, role } => {
                self.view.insert(ReplicaInfo {
                    replica_id: replica_id.clone(),
                    role: *role,
                    last_known_index: Some(id.index),
                });
            }
            MemberChange::Remove { replica_id } => {
                if self.view.remove(replica_id).is_none() {
                    slog::warn!(
                        self.logger,
                        "Committed removal of {:?}, which is not in the view.",
                        replica_id,
                    );
                }
                removed_self = replica_id == &self.my_replica_id;
            }
            MemberChange::Promote { replica_id } => match self.view.get(replica_id) {
                Some(info) => {
                    let mut promoted = info.clone();
                    promoted.role = ReplicaRole::Voting;
                    promoted.last_known_index = Some(id.index);
                    self.view.insert(promoted);
                }
                None => {
                    slog::warn!(
                        self.logger,
                        "Committed promotion of {:?}, which is not in the view.",
                        replica_id,
                    );
                }
            },
        }

        // Resolve the in-flight change if this was it.
        if let ReconfigState::AwaitingCommit {
            entry_id,
            applied_tx,
        } = &mut self.state
        {
            if *entry_id == id {
                if let Some(tx) = applied_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                self.state = ReconfigState::Stable;
            } else {
                // Some other leader's change committed first. Ours is still in the log
                // race; leave the state alone until it commits or leadership moves.
                slog::info!(
                    self.logger,
                    "Config entry {:?} committed while awaiting {:?}",
                    id,
                    entry_id,
                );
            }
        }

        AppliedConfig {
            change,
            removed_self,
        }
    }

    /// Replace the view wholesale from an installed snapshot. The engine rejects
    /// installs while a change is in flight, so this never clobbers one.
    pub(crate) fn install_view(&mut self, view: MembershipView) {
        debug_assert!(!self.in_flight());
        self.view = view;
    }

    fn validate(&self, change: &MemberChange) -> Result<(), ReconfigureError> {
        match change {
            MemberChange::Add { replica_id, role } => match self.view.get(replica_id) {
                Some(existing) if existing.role == *role => Err(ReconfigureError::AlreadyMember {
                    replica_id: replica_id.clone(),
                }),
                Some(_) => {
                    // Role change goes through Remove or Promote, not a second Add.
                    Err(ReconfigureError::AlreadyMember {
                        replica_id: replica_id.clone(),
                    })
                }
                None => Ok(()),
            },
            MemberChange::Remove { replica_id } => match self.view.get(replica_id) {
                None => Err(ReconfigureError::UnknownReplica {
                    replica_id: replica_id.clone(),
                }),
                Some(info) => {
                    if info.role == ReplicaRole::Voting && self.view.voting_count() == 1 {
                        return Err(ReconfigureError::WouldOrphanGroup);
                    }
                    Ok(())
                }
            },
            MemberChange::Promote { replica_id } => match self.view.get(replica_id) {
                None => Err(ReconfigureError::UnknownReplica {
                    replica_id: replica_id.clone(),
                }),
                Some(info) if info.role == ReplicaRole::Voting => {
                    Err(ReconfigureError::AlreadyMember {
                        replica_id: replica_id.clone(),
                    })
                }
                Some(_) => Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::Term;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn replica(id: &str) -> ReplicaId {
        ReplicaId::new(id)
    }

    fn voting(id: &str) -> ReplicaInfo {
        ReplicaInfo {
            replica_id: replica(id),
            role: ReplicaRole::Voting,
            last_known_index: None,
        }
    }

    fn learner(id: &str) -> ReplicaInfo {
        ReplicaInfo {
            replica_id: replica(id),
            role: ReplicaRole::Learner,
            last_known_index: None,
        }
    }

    fn controller(members: Vec<ReplicaInfo>) -> MembershipController {
        MembershipController::new(test_logger(), replica("r1"), MembershipView::new(members))
    }

    fn entry_id(term: u64, index: u64) -> EntryId {
        EntryId {
            term: Term::new(term),
            index: Index::new(index),
        }
    }

    #[test]
    fn validation() {
        fn run(change: MemberChange, expect_ok: bool) {
            let mut c = controller(vec![voting("r1"), voting("r2"), learner("r3")]);
            assert_eq!(c.begin_change(&change).is_ok(), expect_ok, "{:?}", change);
        }

        run(
            MemberChange::Add {
                replica_id: replica("r4"),
                role: ReplicaRole::Learner,
            },
            true,
        );
        run(
            MemberChange::Add {
                replica_id: replica("r2"),
                role: ReplicaRole::Voting,
            },
            false,
        );
        run(
            MemberChange::Add {
                replica_id: replica("r3"),
                role: ReplicaRole::Voting,
            },
            false,
        );
        run(
            MemberChange::Remove {
                replica_id: replica("r2"),
            },
            true,
        );
        run(
            MemberChange::Remove {
                replica_id: replica("r9"),
            },
            false,
        );
        run(
            MemberChange::Promote {
                replica_id: replica("r3"),
            },
            true,
        );
        run(
            MemberChange::Promote {
                replica_id: replica("r2"),
            },
            false,
        );
    }

    #[test]
    fn removing_last_voter_is_rejected() {
        let mut c = controller(vec![voting("r1"), learner("r2")]);
        let result = c.begin_change(&MemberChange::Remove {
            replica_id: replica("r1"),
        });
        assert!(matches!(result, Err(ReconfigureError::WouldOrphanGroup)));
    }

    #[test]
    fn single_change_in_flight() {
        let mut c = controller(vec![voting("r1"), voting("r2")]);

        let change = MemberChange::Add {
            replica_id: replica("r3"),
            role: ReplicaRole::Voting,
        };
        c.begin_change(&change).unwrap();
        let _rx = c.change_enqueued(entry_id(1, 1));

        let second = c.begin_change(&MemberChange::Remove {
            replica_id: replica("r2"),
        });
        assert!(matches!(
            second,
            Err(ReconfigureError::ReconfigurationInProgress)
        ));

        // Committing the first change frees the slot.
        c.apply_config(
            entry_id(1, 1),
            ConfigRecord { change },
        );
        assert!(!c.in_flight());
        assert!(c.view().contains(&replica("r3")));
        assert!(c
            .begin_change(&MemberChange::Remove {
                replica_id: replica("r2"),
            })
            .is_ok());
    }

    #[test]
    fn apply_remove_of_self_is_reported() {
        let mut c = controller(vec![voting("r1"), voting("r2")]);
        let applied = c.apply_config(
            entry_id(1, 1),
            ConfigRecord {
                change: MemberChange::Remove {
                    replica_id: replica("r1"),
                },
            },
        );
        assert!(applied.removed_self);
        assert!(!c.view().contains(&replica("r1")));
    }

    #[test]
    fn stale_change_invalidated_on_leadership_change() {
        let mut c = controller(vec![voting("r1"), voting("r2")]);
        c.begin_change(&MemberChange::Add {
            replica_id: replica("r3"),
            role: ReplicaRole::Learner,
        })
        .unwrap();
        let rx = c.change_enqueued(entry_id(1, 1));

        c.invalidate_stale_change(Term::new(2));
        assert!(!c.in_flight());
        let result = rx.blocking_recv().unwrap();
        assert!(matches!(result, Err(ReconfigureError::NotLeader { .. })));
    }

    #[test]
    fn config_record_codec() {
        let changes = vec![
            MemberChange::Add {
                replica_id: replica("replica-7"),
                role: ReplicaRole::Learner,
            },
            MemberChange::Add {
                replica_id: replica("replica-7"),
                role: ReplicaRole::Voting,
            },
            MemberChange::Remove {
                replica_id: replica("replica-7"),
            },
            MemberChange::Promote {
                replica_id: replica("replica-7"),
            },
        ];

        for change in changes {
            let record = ConfigRecord { change };
            let decoded = ConfigRecord::decode(&record.encode()).unwrap();
            assert_eq!(record, decoded);
        }
    }

    #[test]
    fn config_record_decode_rejects_garbage() {
        assert!(ConfigRecord::decode(&Bytes::from_static(&[])).is_err());
        assert!(ConfigRecord::decode(&Bytes::from_static(&[9, 1, 0, b'x'])).is_err());
        assert!(ConfigRecord::decode(&Bytes::from_static(&[1, 7, b'x'])).is_err());
        // Add with role byte but empty id.
        assert!(ConfigRecord::decode(&Bytes::from_static(&[1, 1, 0])).is_err());
    }
}
