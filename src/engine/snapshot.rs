use crate::actor::ActorClient;
use crate::consensus::{ConsensusLog, EntryId};
use crate::engine::applier::DedupState;
use crate::engine::engine_api::SnapshotError;
use crate::engine::membership::MembershipView;
use crate::storage::{StorageEngine, StorageError};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use tokio::time::Duration;

/// A self-describing, point-in-time capture of one group's replicated state, used to
/// fast-forward a replica past log entries it never received.
///
/// Everything a blank replica needs to converge travels together: the storage engine's
/// own capture, the membership view as of the floor, and the token dedup record, all
/// consistent with `last_included`.
pub struct SnapshotDescriptor<SN> {
    pub last_included: EntryId,
    pub members: MembershipView,
    pub(crate) dedup: DedupState,
    pub(crate) storage: SN,
}

impl<SN: Clone> Clone for SnapshotDescriptor<SN> {
    fn clone(&self) -> Self {
        SnapshotDescriptor {
            last_included: self.last_included,
            members: self.members.clone(),
            dedup: self.dedup.clone(),
            storage: self.storage.clone(),
        }
    }
}

impl<SN> fmt::Debug for SnapshotDescriptor<SN> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotDescriptor")
            .field("last_included", &self.last_included)
            .field("members", &self.members.len())
            .finish()
    }
}

/// SnapshotManager produces and installs snapshot captures against the storage engine.
/// The engine invokes it from inside the group's critical section, which is what makes
/// "a storage state consistent with one specific applied index" hold.
pub(crate) struct SnapshotManager<S: StorageEngine> {
    logger: slog::Logger,
    storage: Arc<S>,
}

impl<S: StorageEngine> SnapshotManager<S> {
    pub(crate) fn new(logger: slog::Logger, storage: Arc<S>) -> Self {
        SnapshotManager { logger, storage }
    }

    pub(crate) fn create(
        &self,
        last_included: EntryId,
        members: MembershipView,
        dedup: DedupState,
    ) -> Result<SnapshotDescriptor<S::Snapshot>, StorageError> {
        let storage = self.storage.consistent_snapshot_read()?;
        slog::info!(self.logger, "Captured snapshot at {:?}", last_included);

        Ok(SnapshotDescriptor {
            last_included,
            members,
            dedup,
            storage,
        })
    }

    pub(crate) fn install(
        &self,
        descriptor: &SnapshotDescriptor<S::Snapshot>,
    ) -> Result<(), StorageError> {
        self.storage
            .restore_from_snapshot(descriptor.storage.clone())?;
        slog::info!(
            self.logger,
            "Installed snapshot at {:?}",
            descriptor.last_included
        );
        Ok(())
    }
}

/// Periodically triggers a snapshot so the consensus log can be trimmed. Jittered so
/// replicas of many groups on one node don't all capture at the same instant. Dropping
/// the handle stops the task.
pub(crate) struct SnapshotTimerHandle {
    _stopper: stop_signal::Stopper,
}

impl SnapshotTimerHandle {
    pub(crate) fn spawn_background_task<C, S>(
        logger: slog::Logger,
        interval: Duration,
        jitter: Duration,
        actor_client: ActorClient<S>,
        consensus: Arc<C>,
    ) -> Self
    where
        C: ConsensusLog,
        S: StorageEngine,
    {
        let (stopper, stop_check) = stop_signal::new();

        tokio::task::spawn(Self::snapshot_timer_task(
            stop_check,
            logger,
            interval,
            jitter,
            actor_client,
            consensus,
        ));

        SnapshotTimerHandle { _stopper: stopper }
    }

    async fn snapshot_timer_task<C, S>(
        stop_check: stop_signal::StopCheck,
        logger: slog::Logger,
        interval: Duration,
        jitter: Duration,
        actor_client: ActorClient<S>,
        consensus: Arc<C>,
    ) where
        C: ConsensusLog,
        S: StorageEngine,
    {
        loop {
            let pause = interval + rand::thread_rng().gen_range(Duration::from_millis(0)..=jitter);
            tokio::time::sleep(pause).await;
            if stop_check.should_stop() {
                break;
            }

            match actor_client.create_snapshot().await {
                Ok(descriptor) => {
                    consensus.compact_to(descriptor.last_included.index);
                }
                Err(SnapshotError::NothingApplied) => {
                    slog::debug!(logger, "Snapshot timer fired with nothing applied yet.");
                }
                Err(SnapshotError::ActorExited) => {
                    break;
                }
                Err(e) => {
                    slog::warn!(logger, "Timer-triggered snapshot failed: {}", e);
                }
            }
        }
    }
}

mod stop_signal {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    pub struct Stopper {
        stop_signal: Arc<AtomicBool>,
    }

    pub struct StopCheck {
        stop_signal: Arc<AtomicBool>,
    }

    impl Drop for Stopper {
        fn drop(&mut self) {
            self.stop_signal.store(true, Ordering::Release);
        }
    }

    impl StopCheck {
        pub fn should_stop(&self) -> bool {
            self.stop_signal.load(Ordering::Acquire)
        }
    }

    pub fn new() -> (Stopper, StopCheck) {
        let stop_signal = Arc::new(AtomicBool::new(false));

        let stopper = Stopper {
            stop_signal: stop_signal.clone(),
        };
        let stop_check = StopCheck { stop_signal };

        (stopper, stop_check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{Index, Term};
    use crate::storage::InMemoryStorage;
    use bytes::Bytes;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn create_then_install_restores_captured_state() {
        let source = Arc::new(InMemoryStorage::create());
        source
            .put(Bytes::from_static(b"k"), Bytes::from_static(b"v"))
            .unwrap();
        source.record_applied(Index::new(3)).unwrap();

        let manager = SnapshotManager::new(test_logger(), source.clone());
        let descriptor = manager
            .create(
                EntryId {
                    term: Term::new(1),
                    index: Index::new(3),
                },
                MembershipView::default(),
                DedupState::default(),
            )
            .unwrap();

        let target = Arc::new(InMemoryStorage::create());
        let target_manager = SnapshotManager::new(test_logger(), target.clone());
        target_manager.install(&descriptor).unwrap();

        assert_eq!(
            target.get(b"k").unwrap(),
            Some(Bytes::from_static(b"v"))
        );
        assert_eq!(target.applied_watermark().unwrap(), Some(Index::new(3)));
    }
}
