#![forbid(unsafe_code)]

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod core;
pub mod daemon;
pub mod error;
mod paths;
pub mod sim;
pub mod telemetry;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    AckRecord, AssuredMode, AssuredRequest, Completion, CompletionState, Csn, GenerationId,
    GroupId, PeerInfo, PeerKind, PeerStatus, ServerId, ServerState, UpdateEnvelope,
};
pub use crate::daemon::{InboundUpdate, ReplayError, Replica};
