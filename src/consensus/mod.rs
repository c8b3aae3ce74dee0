//! Boundary to the consensus collaborator: the library that owns leader election, quorum
//! replication, and term/index assignment. This crate only consumes it.

mod api;
mod events;
mod in_memory;

pub use api::CommittedEntry;
pub use api::ConsensusAppendError;
pub use api::ConsensusLog;
pub use api::EntryId;
pub use api::EntryKind;
pub use api::Index;
pub use api::ReplicaGroupId;
pub use api::ReplicaId;
pub use api::Term;
pub use events::consensus_event_channel;
pub use events::ConsensusEvent;
pub use events::ConsensusEventPublisher;
pub use events::ConsensusEventStream;
pub use events::LeaderChange;
pub use in_memory::InMemoryConsensus;
