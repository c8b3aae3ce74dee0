use crate::actor::ActorClient;
use crate::api::types::ReadConsistency;
use crate::consensus::{ConsensusLog, ReplicaGroupId};
use crate::engine::{
    AppliedOutput, Command, CursorWatch, DescribeError, GroupDescription, MemberChange,
    ProposalToken, ProposeError, ProposeStarted, ReadError, ReconfigureError, ReconfigureReceipt,
    ServingState, SnapshotDescriptor, SnapshotError, SnapshotTimerHandle,
};
use crate::storage::StorageEngine;
use bytes::Bytes;
use std::sync::Arc;
use tokio::time::Duration;

/// The data-plane operations of one replica group, as seen by application callers.
#[async_trait::async_trait]
pub trait ReplicaGroupApi {
    /// Replicate one command and wait until it is applied locally. `token` is the
    /// caller's idempotency token: reusing it on a retry can never apply the command
    /// twice (see [`ProposeError::retry_safe`] for the one exception).
    async fn propose(
        &self,
        token: ProposalToken,
        command: Command,
        timeout: Duration,
    ) -> Result<AppliedOutput, ProposeError>;

    async fn read(
        &self,
        consistency: ReadConsistency,
        key: &[u8],
    ) -> Result<Option<Bytes>, ReadError>;

    async fn describe(&self) -> Result<GroupDescription, DescribeError>;
}

/// GroupHandle is the per-group client handle returned by
/// [`crate::api::try_start_group`]. Cheap to clone; all clones address the same group.
pub struct GroupHandle<C, S>
where
    C: ConsensusLog,
    S: StorageEngine,
{
    logger: slog::Logger,
    group_id: ReplicaGroupId,
    actor_client: ActorClient<S>,
    consensus: Arc<C>,
    storage: Arc<S>,
    cursor: CursorWatch,
    serving: ServingState,
    linearizable_read_timeout: Duration,
    _snapshot_timer: Option<Arc<SnapshotTimerHandle>>,
}

impl<C, S> Clone for GroupHandle<C, S>
where
    C: ConsensusLog,
    S: StorageEngine,
{
    fn clone(&self) -> Self {
        GroupHandle {
            logger: self.logger.clone(),
            group_id: self.group_id.clone(),
            actor_client: self.actor_client.clone(),
            consensus: self.consensus.clone(),
            storage: self.storage.clone(),
            cursor: self.cursor.clone(),
            serving: self.serving.clone(),
            linearizable_read_timeout: self.linearizable_read_timeout,
            _snapshot_timer: self._snapshot_timer.clone(),
        }
    }
}

impl<C, S> GroupHandle<C, S>
where
    C: ConsensusLog,
    S: StorageEngine,
{
    pub(super) fn new(
        logger: slog::Logger,
        group_id: ReplicaGroupId,
        actor_client: ActorClient<S>,
        consensus: Arc<C>,
        storage: Arc<S>,
        cursor: CursorWatch,
        serving: ServingState,
        linearizable_read_timeout: Duration,
        snapshot_timer: Option<Arc<SnapshotTimerHandle>>,
    ) -> Self {
        GroupHandle {
            logger,
            group_id,
            actor_client,
            consensus,
            storage,
            cursor,
            serving,
            linearizable_read_timeout,
            _snapshot_timer: snapshot_timer,
        }
    }

    pub fn group_id(&self) -> &ReplicaGroupId {
        &self.group_id
    }

    /// Capture a snapshot descriptor at the current applied index. Hand it to a lagging
    /// replica's [`Self::install_snapshot`]; the consensus log may be trimmed below its
    /// floor.
    pub async fn create_snapshot(&self) -> Result<SnapshotDescriptor<S::Snapshot>, SnapshotError> {
        self.actor_client.create_snapshot().await
    }

    /// Replace this replica's state wholesale with `descriptor`'s. For replicas too far
    /// behind for ordinary log replication to catch up.
    pub async fn install_snapshot(
        &self,
        descriptor: SnapshotDescriptor<S::Snapshot>,
    ) -> Result<(), SnapshotError> {
        self.actor_client.install_snapshot(descriptor).await
    }

    /// Propose a membership change. Accepted means enqueued; the change only takes
    /// effect once its Config entry commits and applies, which the returned receipt can
    /// be awaited on.
    pub async fn reconfigure(
        &self,
        change: MemberChange,
    ) -> Result<ReconfigureReceipt, ReconfigureError> {
        self.actor_client.reconfigure(change).await
    }
}

#[async_trait::async_trait]
impl<C, S> ReplicaGroupApi for GroupHandle<C, S>
where
    C: ConsensusLog,
    S: StorageEngine,
{
    async fn propose(
        &self,
        token: ProposalToken,
        command: Command,
        timeout: Duration,
    ) -> Result<AppliedOutput, ProposeError> {
        match self.actor_client.propose(token, command).await? {
            ProposeStarted::AlreadyApplied(output) => Ok(output),
            ProposeStarted::Pending(receipt) => {
                match tokio::time::timeout(timeout, receipt.completion).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_actor_dropped_completion)) => Err(ProposeError::ActorExited),
                    Err(_elapsed) => {
                        slog::info!(
                            self.logger,
                            "Proposal {:?} timed out after {:?}; cancelling waiter.",
                            token,
                            timeout,
                        );
                        // The entry may still commit later; the replicated dedup record
                        // keeps a retry of this token from double-applying.
                        self.actor_client.cancel_proposal(token).await;
                        Err(ProposeError::Timeout)
                    }
                }
            }
        }
    }

    async fn read(
        &self,
        consistency: ReadConsistency,
        key: &[u8],
    ) -> Result<Option<Bytes>, ReadError> {
        if let Some(reason) = self.serving.halt_reason() {
            return Err(ReadError::Halted(reason));
        }

        match consistency {
            ReadConsistency::Stale => {}
            ReadConsistency::LeaderLease => {
                if !self.consensus.is_leader() {
                    return Err(ReadError::NotLeader {
                        hint: self.consensus.current_leader(),
                    });
                }
            }
            ReadConsistency::Linearizable => {
                // Barrier: whatever was committed before this read started must be
                // applied locally before we serve. A blank commit floor needs no wait.
                if let Some(barrier) = self.consensus.committed_index() {
                    let mut cursor = self.cursor.clone();
                    match tokio::time::timeout(
                        self.linearizable_read_timeout,
                        cursor.wait_for(barrier),
                    )
                    .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(_barrier_lost)) => return Err(ReadError::ActorExited),
                        Err(_elapsed) => return Err(ReadError::Timeout),
                    }
                }
            }
        }

        let value = self.storage.get(key)?;
        Ok(value)
    }

    async fn describe(&self) -> Result<GroupDescription, DescribeError> {
        self.actor_client
            .describe()
            .await
            .ok_or(DescribeError::ActorExited)
    }
}
