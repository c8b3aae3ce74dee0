//! The core: everything that binds one consensus group to one storage partition.

mod applier;
mod cursor;
mod engine;
mod engine_api;
mod membership;
mod proposals;
mod snapshot;

pub use applier::Command;
pub use applier::PayloadDecodeError;
pub use engine_api::AppliedOutput;
pub use engine_api::DescribeError;
pub use engine_api::GroupDescription;
pub use engine_api::HaltReason;
pub use engine_api::ProposalToken;
pub use engine_api::ProposeError;
pub use engine_api::ReadError;
pub use engine_api::ReconfigureError;
pub use engine_api::ReconfigureReceipt;
pub use engine_api::SnapshotError;
pub use membership::MemberChange;
pub use membership::MembershipView;
pub use membership::ReplicaInfo;
pub use membership::ReplicaRole;
pub use snapshot::SnapshotDescriptor;

pub(crate) use cursor::CursorWatch;
pub(crate) use engine::EngineConfig;
pub(crate) use engine::ReplicaGroupEngine;
pub(crate) use engine::ServingState;
pub(crate) use engine_api::ProposeStarted;
pub(crate) use snapshot::SnapshotTimerHandle;
