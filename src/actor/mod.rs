use crate::consensus::{ConsensusEvent, ConsensusLog};
use crate::engine::{
    Command, GroupDescription, MemberChange, ProposalToken, ProposeError, ProposeStarted,
    ReconfigureError, ReconfigureReceipt, ReplicaGroupEngine, SnapshotDescriptor, SnapshotError,
};
use crate::storage::StorageEngine;
use std::error::Error;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};

pub(crate) fn create<C, S>(
    logger: slog::Logger,
    buffer_size: usize,
    engine: ReplicaGroupEngine<C, S>,
) -> (ActorClient<S>, EngineActor<C, S>)
where
    C: ConsensusLog,
    S: StorageEngine,
{
    let (tx, rx) = mpsc::channel(buffer_size);
    let client = ActorClient { sender: tx };
    let actor = EngineActor {
        logger,
        receiver: rx,
        engine,
    };

    (client, actor)
}

// One event queue per group. The queue is the group's exclusive critical section: every
// mutation of the cursor, proposal table, and membership view goes through here, while
// other groups' actors run in parallel.
enum Event<S: StorageEngine> {
    // Leader: dedup-check, hand to consensus, register the pending proposal.
    // Follower: answer retries of already-applied tokens; otherwise redirect.
    Propose {
        token: ProposalToken,
        command: Command,
        callback: Callback<ProposeStarted, ProposeError>,
    },

    // Caller's timeout elapsed; stop routing a completion to it.
    CancelProposal {
        token: ProposalToken,
    },

    // Commit or leadership notification, in consensus delivery order.
    FromConsensus(ConsensusEvent),

    // Capture a descriptor at the current applied index.
    CreateSnapshot(Callback<SnapshotDescriptor<S::Snapshot>, SnapshotError>),

    // Fast-forward this lagging replica wholesale.
    InstallSnapshot(
        Box<SnapshotDescriptor<S::Snapshot>>,
        Callback<(), SnapshotError>,
    ),

    // Leader: validate and enqueue a membership change through consensus.
    Reconfigure(MemberChange, Callback<ReconfigureReceipt, ReconfigureError>),

    Describe(oneshot::Sender<GroupDescription>),
}

struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Callback<O, E> {
    pub fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

pub(crate) struct ActorClient<S: StorageEngine> {
    sender: mpsc::Sender<Event<S>>,
}

// Manual impl; a derived one would demand `S: Clone` for no reason.
impl<S: StorageEngine> Clone for ActorClient<S> {
    fn clone(&self) -> Self {
        ActorClient {
            sender: self.sender.clone(),
        }
    }
}

impl<S: StorageEngine> ActorClient<S> {
    pub(crate) async fn propose(
        &self,
        token: ProposalToken,
        command: Command,
    ) -> Result<ProposeStarted, ProposeError> {
        let (tx, rx) = oneshot::channel();
        let event = Event::Propose {
            token,
            command,
            callback: Callback(tx),
        };
        if self.sender.send(event).await.is_err() {
            return Err(ProposeError::ActorExited);
        }

        rx.await.unwrap_or(Err(ProposeError::ActorExited))
    }

    pub(crate) async fn cancel_proposal(&self, token: ProposalToken) {
        let _ = self.sender.send(Event::CancelProposal { token }).await;
    }

    /// Used by the consensus event pump. `Err` means the actor is gone and the pump
    /// should stop.
    pub(crate) async fn from_consensus(&self, event: ConsensusEvent) -> Result<(), ActorGone> {
        self.sender
            .send(Event::FromConsensus(event))
            .await
            .map_err(|_| ActorGone {})
    }

    pub(crate) async fn create_snapshot(
        &self,
    ) -> Result<SnapshotDescriptor<S::Snapshot>, SnapshotError> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(Event::CreateSnapshot(Callback(tx)))
            .await
            .is_err()
        {
            return Err(SnapshotError::ActorExited);
        }

        rx.await.unwrap_or(Err(SnapshotError::ActorExited))
    }

    pub(crate) async fn install_snapshot(
        &self,
        descriptor: SnapshotDescriptor<S::Snapshot>,
    ) -> Result<(), SnapshotError> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(Event::InstallSnapshot(Box::new(descriptor), Callback(tx)))
            .await
            .is_err()
        {
            return Err(SnapshotError::ActorExited);
        }

        rx.await.unwrap_or(Err(SnapshotError::ActorExited))
    }

    pub(crate) async fn reconfigure(
        &self,
        change: MemberChange,
    ) -> Result<ReconfigureReceipt, ReconfigureError> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(Event::Reconfigure(change, Callback(tx)))
            .await
            .is_err()
        {
            return Err(ReconfigureError::ActorExited);
        }

        rx.await.unwrap_or(Err(ReconfigureError::ActorExited))
    }

    pub(crate) async fn describe(&self) -> Option<GroupDescription> {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(Event::Describe(tx)).await.is_err() {
            return None;
        }

        rx.await.ok()
    }
}

#[derive(Debug)]
pub(crate) struct ActorGone {}

/// EngineActor is the engine's event loop.
pub(crate) struct EngineActor<C, S>
where
    C: ConsensusLog,
    S: StorageEngine,
{
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event<S>>,
    engine: ReplicaGroupEngine<C, S>,
}

impl<C, S> EngineActor<C, S>
where
    C: ConsensusLog,
    S: StorageEngine,
{
    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);
        }
        slog::info!(self.logger, "Engine actor event loop exiting.");
    }

    // This must NOT be async. Any long running work must be spawned on another task
    // and/or come back to this actor as another event.
    fn handle_event(&mut self, event: Event<S>) {
        match event {
            Event::Propose {
                token,
                command,
                callback,
            } => {
                let result = self.engine.handle_propose(token, command);
                callback.send(result);
            }
            Event::CancelProposal { token } => {
                self.engine.handle_cancel_proposal(token);
            }
            Event::FromConsensus(consensus_event) => match consensus_event {
                ConsensusEvent::Committed(entry) => self.engine.handle_committed(entry),
                ConsensusEvent::LeaderChange(change) => self.engine.handle_leader_change(change),
            },
            Event::CreateSnapshot(callback) => {
                let result = self.engine.handle_create_snapshot();
                callback.send(result);
            }
            Event::InstallSnapshot(descriptor, callback) => {
                let result = self.engine.handle_install_snapshot(*descriptor);
                callback.send(result);
            }
            Event::Reconfigure(change, callback) => {
                let result = self.engine.handle_reconfigure(change);
                callback.send(result);
            }
            Event::Describe(tx) => {
                let _ = tx.send(self.engine.handle_describe());
            }
        }
    }
}
