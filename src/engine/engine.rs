use crate::consensus::{
    CommittedEntry, ConsensusAppendError, ConsensusLog, EntryId, EntryKind, Index, LeaderChange,
    ReplicaGroupId, ReplicaId,
};
use crate::engine::applier::{Applied, ApplyFault, DataRecord, LogApplier};
use crate::engine::cursor::{Arrival, CommitCursor, CursorWatch};
use crate::engine::engine_api::{
    AppliedOutput, GroupDescription, HaltReason, ProposalToken, ProposeError, ProposeReceipt,
    ProposeStarted, ReconfigureError, ReconfigureReceipt, SnapshotError,
};
use crate::engine::membership::{
    ConfigRecord, MemberChange, MembershipController, MembershipView,
};
use crate::engine::proposals::ProposalTable;
use crate::engine::snapshot::{SnapshotDescriptor, SnapshotManager};
use crate::engine::Command;
use crate::storage::StorageEngine;
use std::sync::{Arc, RwLock};

/// Shared serving/halted state for one replica. The engine's actor is the only writer;
/// the read path checks it without going through the actor.
#[derive(Clone)]
pub(crate) struct ServingState {
    inner: Arc<RwLock<Option<HaltReason>>>,
}

impl ServingState {
    pub(crate) fn new() -> Self {
        ServingState {
            inner: Arc::new(RwLock::new(None)),
        }
    }

    pub(crate) fn halt_reason(&self) -> Option<HaltReason> {
        self.inner.read().unwrap().clone()
    }

    fn mark_halted(&self, reason: HaltReason) {
        let mut inner = self.inner.write().unwrap();
        // First fault wins; later faults are consequences.
        if inner.is_none() {
            *inner = Some(reason);
        }
    }
}

pub(crate) struct EngineConfig<C, S>
where
    C: ConsensusLog,
    S: StorageEngine,
{
    pub(crate) logger: slog::Logger,
    pub(crate) group_id: ReplicaGroupId,
    pub(crate) my_replica_id: ReplicaId,
    pub(crate) consensus: Arc<C>,
    pub(crate) storage: Arc<S>,
    pub(crate) initial_view: MembershipView,
    pub(crate) recovered_cursor: Option<Index>,
    pub(crate) serving: ServingState,
}

/// ReplicaGroupEngine binds one consensus group to one storage partition.
///
/// All state here is owned by the group's actor and mutated from its single-threaded
/// event loop; that event loop *is* the per-group exclusive critical section. Different
/// groups have different actors and proceed fully in parallel.
pub(crate) struct ReplicaGroupEngine<C, S>
where
    C: ConsensusLog,
    S: StorageEngine,
{
    logger: slog::Logger,
    group_id: ReplicaGroupId,
    my_replica_id: ReplicaId,
    consensus: Arc<C>,
    applier: LogApplier<S>,
    snapshots: SnapshotManager<S>,
    membership: MembershipController,
    proposals: ProposalTable,
    cursor: CommitCursor,
    // Identity of the entry at the cursor. `None` right after restart: the cursor is
    // recovered from the storage watermark, but the term at that index is not, so no
    // snapshot can be cut until something new applies.
    last_applied: Option<EntryId>,
    serving: ServingState,
}

impl<C, S> ReplicaGroupEngine<C, S>
where
    C: ConsensusLog,
    S: StorageEngine,
{
    pub(crate) fn new(config: EngineConfig<C, S>) -> Self {
        let applier = LogApplier::new(config.logger.clone(), config.storage.clone());
        let snapshots = SnapshotManager::new(config.logger.clone(), config.storage.clone());
        let membership = MembershipController::new(
            config.logger.clone(),
            config.my_replica_id.clone(),
            config.initial_view,
        );
        let proposals = ProposalTable::new(config.logger.clone());
        let cursor = CommitCursor::new(config.recovered_cursor);

        ReplicaGroupEngine {
            logger: config.logger,
            group_id: config.group_id,
            my_replica_id: config.my_replica_id,
            consensus: config.consensus,
            applier,
            snapshots,
            membership,
            proposals,
            cursor,
            last_applied: None,
            serving: config.serving,
        }
    }

    pub(crate) fn cursor_watch(&self) -> CursorWatch {
        self.cursor.watch()
    }

    pub(crate) fn handle_propose(
        &mut self,
        token: ProposalToken,
        command: Command,
    ) -> Result<ProposeStarted, ProposeError> {
        if let Some(reason) = self.serving.halt_reason() {
            return Err(ProposeError::Halted(reason));
        }

        // Dedup checks come before the leader check: a retry of an applied command is
        // answerable from any replica, leader or not.
        if let Some(entry_id) = self.applier.already_applied(&token) {
            return Ok(ProposeStarted::AlreadyApplied(AppliedOutput {
                entry_id,
                previous: None,
            }));
        }
        if let Some((entry_id, completion)) = self.proposals.join_pending(&token) {
            return Ok(ProposeStarted::Pending(ProposeReceipt {
                entry_id,
                completion,
            }));
        }

        let payload = DataRecord { token, command }.encode();
        let entry_id = self
            .consensus
            .append(EntryKind::Data, payload)
            .map_err(Self::map_append_error)?;

        let completion = self.proposals.register(token, entry_id);
        Ok(ProposeStarted::Pending(ProposeReceipt {
            entry_id,
            completion,
        }))
    }

    pub(crate) fn handle_cancel_proposal(&mut self, token: ProposalToken) {
        self.proposals.cancel(&token);
    }

    /// One committed entry from the consensus collaborator. Delivery is contractually
    /// in-order and gapless; a duplicate is ignored, a gap is fatal.
    pub(crate) fn handle_committed(&mut self, entry: CommittedEntry) {
        if self.serving.halt_reason().is_some() {
            slog::debug!(self.logger, "Halted; dropping commit {:?}", entry.id);
            return;
        }

        match self.cursor.classify(entry.id.index) {
            Arrival::Next => {}
            Arrival::Duplicate => {
                slog::debug!(self.logger, "Index {:?} already applied; no-op.", entry.id.index);
                return;
            }
            Arrival::Gap { expected } => {
                self.halt(HaltReason::CommitOrderViolation {
                    expected,
                    observed: entry.id.index,
                });
                return;
            }
        }

        // Leadership handoff must happen before our own removal takes effect.
        if entry.kind == EntryKind::Config {
            if let Ok(record) = ConfigRecord::decode(&entry.payload) {
                if let MemberChange::Remove { replica_id } = &record.change {
                    if replica_id == &self.my_replica_id && self.consensus.is_leader() {
                        slog::info!(
                            self.logger,
                            "Own removal committed at {:?}; stepping down before applying it.",
                            entry.id,
                        );
                        self.consensus.step_down();
                    }
                }
            }
        }

        match self
            .applier
            .apply(entry.id, entry.kind, &entry.payload, &mut self.membership)
        {
            Ok(applied) => {
                self.cursor.advance_to(entry.id.index);
                self.last_applied = Some(entry.id);

                match applied {
                    Applied::Data(data) => {
                        self.proposals.resolve(
                            &data.token,
                            Ok(AppliedOutput {
                                entry_id: entry.id,
                                previous: data.previous,
                            }),
                        );
                    }
                    Applied::Config(config) => {
                        slog::info!(
                            self.logger,
                            "Applied membership change {:?} at {:?}",
                            config.change,
                            entry.id,
                        );
                        if config.removed_self {
                            slog::info!(
                                self.logger,
                                "No longer a member of group {:?} as of {:?}.",
                                self.group_id,
                                entry.id,
                            );
                        }
                    }
                }
            }
            Err(fault) => {
                let reason = match fault {
                    ApplyFault::Storage(e) => HaltReason::StorageFault(e.to_string()),
                    ApplyFault::Corrupted(_) => HaltReason::CorruptedEntry {
                        index: entry.id.index,
                    },
                };
                self.halt(reason);
            }
        }
    }

    pub(crate) fn handle_leader_change(&mut self, change: LeaderChange) {
        if self.serving.halt_reason().is_some() {
            return;
        }

        slog::info!(
            self.logger,
            "Leadership change: term {:?}, is_leader={}, leader={:?}",
            change.term,
            change.is_leader,
            change.leader,
        );

        // Proposals accepted under older terms can no longer be confirmed here. Their
        // entries may still commit and will be applied in order regardless; the
        // replicated dedup record is what protects a retry from double effect.
        self.proposals.fail_stale_terms(change.term);
        self.membership.invalidate_stale_change(change.term);
    }

    pub(crate) fn handle_create_snapshot(
        &mut self,
    ) -> Result<SnapshotDescriptor<S::Snapshot>, SnapshotError> {
        if let Some(reason) = self.serving.halt_reason() {
            return Err(SnapshotError::Halted(reason));
        }
        if self.membership.in_flight() {
            return Err(SnapshotError::ReconfigurationInProgress);
        }
        let last_applied = self.last_applied.ok_or(SnapshotError::NothingApplied)?;

        let descriptor = self.snapshots.create(
            last_applied,
            self.membership.view().clone(),
            self.applier.dedup_state(),
        )?;
        Ok(descriptor)
    }

    pub(crate) fn handle_install_snapshot(
        &mut self,
        descriptor: SnapshotDescriptor<S::Snapshot>,
    ) -> Result<(), SnapshotError> {
        if let Some(reason) = self.serving.halt_reason() {
            return Err(SnapshotError::Halted(reason));
        }
        if self.membership.in_flight() {
            return Err(SnapshotError::ReconfigurationInProgress);
        }

        let floor = descriptor.last_included.index;
        let cursor = self.cursor.current();
        if cursor.map_or(false, |c| c >= floor) {
            return Err(SnapshotError::StaleDescriptor {
                descriptor: floor,
                cursor,
            });
        }

        if let Err(e) = self.snapshots.install(&descriptor) {
            // A partially-restored partition is unusable; same fate as a storage fault.
            let reason = HaltReason::SnapshotInstallFailure(e.to_string());
            self.halt(reason.clone());
            return Err(SnapshotError::Halted(reason));
        }

        self.cursor.install(floor);
        self.last_applied = Some(descriptor.last_included);
        self.membership.install_view(descriptor.members);
        self.applier.restore_dedup(descriptor.dedup);
        self.proposals.fail_at_or_below(floor);

        Ok(())
    }

    pub(crate) fn handle_reconfigure(
        &mut self,
        change: MemberChange,
    ) -> Result<ReconfigureReceipt, ReconfigureError> {
        if let Some(reason) = self.serving.halt_reason() {
            return Err(ReconfigureError::Halted(reason));
        }
        if !self.consensus.is_leader() {
            return Err(ReconfigureError::NotLeader {
                hint: self.consensus.current_leader(),
            });
        }

        let payload = self.membership.begin_change(&change)?;
        match self.consensus.append(EntryKind::Config, payload) {
            Ok(entry_id) => {
                slog::info!(
                    self.logger,
                    "Membership change {:?} enqueued at {:?}",
                    change,
                    entry_id,
                );
                let applied = self.membership.change_enqueued(entry_id);
                Ok(ReconfigureReceipt { entry_id, applied })
            }
            Err(e) => {
                self.membership.abort_proposing();
                Err(match e {
                    ConsensusAppendError::NotLeader { leader_hint } => {
                        ReconfigureError::NotLeader { hint: leader_hint }
                    }
                    ConsensusAppendError::NoLeader => ReconfigureError::NoLeader,
                })
            }
        }
    }

    pub(crate) fn handle_describe(&self) -> GroupDescription {
        GroupDescription {
            group_id: self.group_id.clone(),
            leader: self.consensus.current_leader(),
            term: self.consensus.current_term(),
            members: self.membership.view().members(),
            commit_cursor: self.cursor.current(),
            committed_index: self.consensus.committed_index(),
            serving: self.serving.halt_reason().is_none(),
        }
    }

    /// Replica-level shutdown of serving, distinct from process death. Other replicas
    /// of the group (and other groups on this process) are unaffected.
    fn halt(&mut self, reason: HaltReason) {
        slog::crit!(self.logger, "Replica halting: {}", reason);
        self.serving.mark_halted(reason.clone());
        self.proposals.fail_all(ProposeError::Halted(reason));
        self.consensus.step_down();
    }

    fn map_append_error(e: ConsensusAppendError) -> ProposeError {
        match e {
            ConsensusAppendError::NotLeader { leader_hint } => ProposeError::NotLeader {
                hint: leader_hint,
            },
            ConsensusAppendError::NoLeader => ProposeError::NoLeader,
        }
    }
}
