use crate::consensus::api::{CommittedEntry, ReplicaId, Term};
use tokio::sync::mpsc;

pub fn consensus_event_channel() -> (ConsensusEventPublisher, ConsensusEventStream) {
    let (tx, rx) = mpsc::unbounded_channel();

    let publisher = ConsensusEventPublisher { sender: tx };
    let stream = ConsensusEventStream { receiver: rx };

    (publisher, stream)
}

/// Everything the consensus collaborator tells the engine, on one ordered stream.
/// Commit notifications and leadership changes share a channel so their relative order
/// is preserved; two channels would let a stale-term commit race past the leadership
/// change that invalidated it.
#[derive(Clone, Debug)]
pub enum ConsensusEvent {
    Committed(CommittedEntry),
    LeaderChange(LeaderChange),
}

#[derive(Clone, Debug)]
pub struct LeaderChange {
    pub term: Term,
    pub is_leader: bool,
    pub leader: Option<ReplicaId>,
}

/// Held by the consensus library side. Cloneable so a consensus implementation can
/// publish from whichever task observes the commit.
#[derive(Clone)]
pub struct ConsensusEventPublisher {
    sender: mpsc::UnboundedSender<ConsensusEvent>,
}

impl ConsensusEventPublisher {
    pub fn publish(&self, logger: &slog::Logger, event: ConsensusEvent) {
        if self.sender.send(event).is_err() {
            slog::warn!(logger, "Consensus event stream has disconnected.");
        }
    }
}

/// Held by the engine's event pump.
pub struct ConsensusEventStream {
    receiver: mpsc::UnboundedReceiver<ConsensusEvent>,
}

impl ConsensusEventStream {
    /// Returns `None` once the publishing side has shut down.
    pub async fn next(&mut self) -> Option<ConsensusEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking variant; `None` when nothing is queued right now.
    pub fn try_next(&mut self) -> Option<ConsensusEvent> {
        self.receiver.try_recv().ok()
    }
}
