mod actor;
mod api;
mod consensus;
mod engine;
mod registry;
mod storage;

pub use api::try_start_group;
pub use api::EngineOptions;
pub use api::GroupConfig;
pub use api::GroupHandle;
pub use api::GroupStartError;
pub use api::ReadConsistency;
pub use api::ReplicaGroupApi;

pub use consensus::consensus_event_channel;
pub use consensus::CommittedEntry;
pub use consensus::ConsensusAppendError;
pub use consensus::ConsensusEvent;
pub use consensus::ConsensusEventPublisher;
pub use consensus::ConsensusEventStream;
pub use consensus::ConsensusLog;
pub use consensus::EntryId;
pub use consensus::EntryKind;
pub use consensus::InMemoryConsensus;
pub use consensus::Index;
pub use consensus::LeaderChange;
pub use consensus::ReplicaGroupId;
pub use consensus::ReplicaId;
pub use consensus::Term;

pub use engine::AppliedOutput;
pub use engine::Command;
pub use engine::DescribeError;
pub use engine::GroupDescription;
pub use engine::HaltReason;
pub use engine::MemberChange;
pub use engine::MembershipView;
pub use engine::PayloadDecodeError;
pub use engine::ProposalToken;
pub use engine::ProposeError;
pub use engine::ReadError;
pub use engine::ReconfigureError;
pub use engine::ReconfigureReceipt;
pub use engine::ReplicaInfo;
pub use engine::ReplicaRole;
pub use engine::SnapshotDescriptor;
pub use engine::SnapshotError;

pub use registry::GroupAlreadyRegistered;
pub use registry::GroupRegistry;
pub use registry::RegistryError;

pub use storage::InMemorySnapshot;
pub use storage::InMemoryStorage;
pub use storage::StorageEngine;
pub use storage::StorageError;
