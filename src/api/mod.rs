//! This mod holds the library's client-facing API.

mod client;
mod options;
mod types;
mod wiring;

pub use client::GroupHandle;
pub use client::ReplicaGroupApi;
pub use options::EngineOptions;
pub use types::ReadConsistency;
pub use wiring::try_start_group;
pub use wiring::GroupConfig;
pub use wiring::GroupStartError;
