use crate::actor;
use crate::api::client::GroupHandle;
use crate::api::options::{EngineOptions, EngineOptionsValidated};
use crate::consensus::{ConsensusEventStream, ConsensusLog, Index, ReplicaGroupId, ReplicaId};
use crate::engine::{
    EngineConfig, MembershipView, ReplicaGroupEngine, ReplicaInfo, ServingState,
    SnapshotTimerHandle,
};
use crate::storage::{StorageEngine, StorageError};
use std::convert::TryFrom;
use std::sync::Arc;

pub struct GroupConfig<C, S>
where
    C: ConsensusLog,
    S: StorageEngine,
{
    pub group_id: ReplicaGroupId,
    pub my_replica_id: ReplicaId,
    /// Membership as of group creation (or as recovered by the consensus library).
    /// Afterwards the view changes only through committed Config entries.
    pub initial_members: Vec<ReplicaInfo>,
    pub consensus: Arc<C>,
    pub storage: Arc<S>,
    /// The ordered commit/leadership stream the consensus implementation publishes to.
    pub consensus_events: ConsensusEventStream,
    pub logger: slog::Logger,
    pub options: EngineOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum GroupStartError {
    #[error("illegal options for starting group: {0}")]
    IllegalOptions(&'static str),

    // We will need to relax this if a replica can ever start outside its own view.
    #[error("my replica ID not in initial membership")]
    MeNotInGroup,

    // The watermark vouches for applies the consensus log has no commit for. One of the
    // two collaborators lost data; serving from here would be undefined.
    #[error("applied watermark {watermark:?} is ahead of the consensus commit floor {committed:?}")]
    CursorAheadOfConsensus {
        watermark: Index,
        committed: Option<Index>,
    },

    #[error("storage engine failed during cursor recovery: {0}")]
    Storage(#[from] StorageError),
}

/// Assemble and start one replica group: recover the applied cursor, spawn the engine
/// actor, the consensus event pump, and (optionally) the snapshot trigger timer.
pub async fn try_start_group<C, S>(
    config: GroupConfig<C, S>,
) -> Result<GroupHandle<C, S>, GroupStartError>
where
    C: ConsensusLog,
    S: StorageEngine,
{
    let options = EngineOptionsValidated::try_from(config.options)
        .map_err(GroupStartError::IllegalOptions)?;

    if !config
        .initial_members
        .iter()
        .any(|member| member.replica_id == config.my_replica_id)
    {
        return Err(GroupStartError::MeNotInGroup);
    }

    let logger = config.logger.new(slog::o!(
        "group" => config.group_id.as_str().to_string(),
        "replica" => config.my_replica_id.as_str().to_string(),
    ));

    // The cursor is recovered from the storage engine's durable watermark, then held
    // against the consensus collaborator's own commit floor. An in-memory cursor is
    // never trusted across restart.
    let watermark = config.storage.applied_watermark()?;
    let committed = config.consensus.committed_index();
    if let Some(watermark) = watermark {
        let vouched = committed.map_or(false, |committed| watermark <= committed);
        if !vouched {
            return Err(GroupStartError::CursorAheadOfConsensus {
                watermark,
                committed,
            });
        }
    }

    let serving = ServingState::new();
    let engine = ReplicaGroupEngine::new(EngineConfig {
        logger: logger.clone(),
        group_id: config.group_id.clone(),
        my_replica_id: config.my_replica_id,
        consensus: config.consensus.clone(),
        storage: config.storage.clone(),
        initial_view: MembershipView::new(config.initial_members),
        recovered_cursor: watermark,
        serving: serving.clone(),
    });
    let cursor = engine.cursor_watch();

    let (actor_client, engine_actor) = actor::create(logger.clone(), options.actor_queue_size, engine);
    tokio::spawn(engine_actor.run_event_loop());

    // Pump: consensus events in, actor events out, order preserved.
    let pump_client = actor_client.clone();
    let pump_logger = logger.clone();
    let mut consensus_events = config.consensus_events;
    tokio::spawn(async move {
        while let Some(event) = consensus_events.next().await {
            if pump_client.from_consensus(event).await.is_err() {
                break;
            }
        }
        slog::info!(pump_logger, "Consensus event pump stopped.");
    });

    let snapshot_timer = options.snapshot_trigger.map(|(interval, jitter)| {
        Arc::new(SnapshotTimerHandle::spawn_background_task(
            logger.clone(),
            interval,
            jitter,
            actor_client.clone(),
            config.consensus.clone(),
        ))
    });

    Ok(GroupHandle::new(
        logger,
        config.group_id,
        actor_client,
        config.consensus,
        config.storage,
        cursor,
        serving,
        options.linearizable_read_timeout,
        snapshot_timer,
    ))
}
