use crate::api::{GroupHandle, ReadConsistency, ReplicaGroupApi};
use crate::consensus::{ConsensusLog, ReplicaGroupId};
use crate::engine::{
    AppliedOutput, Command, DescribeError, GroupDescription, MemberChange, ProposalToken,
    ProposeError, ReadError, ReconfigureError, ReconfigureReceipt,
};
use crate::storage::StorageEngine;
use bytes::Bytes;
use std::collections::HashMap;
use std::error::Error;
use std::sync::RwLock;
use tokio::time::Duration;

/// GroupRegistry is the process-wide supervisor's table of active replica groups.
///
/// It is explicit, owned state, injected wherever group-addressed calls originate;
/// nothing in this crate reaches for it ambiently. Each registered group runs its own
/// actor, so operations on different groups proceed fully in parallel.
pub struct GroupRegistry<C, S>
where
    C: ConsensusLog,
    S: StorageEngine,
{
    logger: slog::Logger,
    groups: RwLock<HashMap<ReplicaGroupId, GroupHandle<C, S>>>,
}

impl<C, S> GroupRegistry<C, S>
where
    C: ConsensusLog,
    S: StorageEngine,
{
    pub fn new(logger: slog::Logger) -> Self {
        GroupRegistry {
            logger,
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// First registration wins; a second handle for the same group is handed back.
    pub fn register(
        &self,
        handle: GroupHandle<C, S>,
    ) -> Result<(), GroupAlreadyRegistered> {
        let mut groups = self.groups.write().unwrap();
        let group_id = handle.group_id().clone();
        if groups.contains_key(&group_id) {
            return Err(GroupAlreadyRegistered(group_id));
        }

        slog::info!(self.logger, "Registered group {:?}", group_id);
        groups.insert(group_id, handle);
        Ok(())
    }

    pub fn group(&self, group_id: &ReplicaGroupId) -> Option<GroupHandle<C, S>> {
        self.groups.read().unwrap().get(group_id).cloned()
    }

    pub fn deregister(&self, group_id: &ReplicaGroupId) -> Option<GroupHandle<C, S>> {
        let removed = self.groups.write().unwrap().remove(group_id);
        if removed.is_some() {
            slog::info!(self.logger, "Deregistered group {:?}", group_id);
        }
        removed
    }

    pub fn group_ids(&self) -> Vec<ReplicaGroupId> {
        self.groups.read().unwrap().keys().cloned().collect()
    }

    pub async fn propose(
        &self,
        group_id: &ReplicaGroupId,
        token: ProposalToken,
        command: Command,
        timeout: Duration,
    ) -> Result<AppliedOutput, RegistryError<ProposeError>> {
        let group = self.lookup(group_id)?;
        let output = group.propose(token, command, timeout).await?;
        Ok(output)
    }

    pub async fn read(
        &self,
        group_id: &ReplicaGroupId,
        consistency: ReadConsistency,
        key: &[u8],
    ) -> Result<Option<Bytes>, RegistryError<ReadError>> {
        let group = self.lookup(group_id)?;
        let value = group.read(consistency, key).await?;
        Ok(value)
    }

    pub async fn reconfigure(
        &self,
        group_id: &ReplicaGroupId,
        change: MemberChange,
    ) -> Result<ReconfigureReceipt, RegistryError<ReconfigureError>> {
        let group = self.lookup(group_id)?;
        let receipt = group.reconfigure(change).await?;
        Ok(receipt)
    }

    pub async fn describe(
        &self,
        group_id: &ReplicaGroupId,
    ) -> Result<GroupDescription, RegistryError<DescribeError>> {
        let group = self.lookup(group_id)?;
        let description = group.describe().await?;
        Ok(description)
    }

    fn lookup<E: Error>(
        &self,
        group_id: &ReplicaGroupId,
    ) -> Result<GroupHandle<C, S>, RegistryError<E>> {
        self.group(group_id)
            .ok_or_else(|| RegistryError::UnknownGroup(group_id.clone()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("group {0:?} is already registered")]
pub struct GroupAlreadyRegistered(pub ReplicaGroupId);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError<E: Error> {
    #[error("no group registered for {0:?}")]
    UnknownGroup(ReplicaGroupId),

    #[error(transparent)]
    Group(#[from] E),
}
