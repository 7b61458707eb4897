//! Core replication data model.
//!
//! Module hierarchy follows type dependency order:
//! - identity: ServerId, GroupId, GenerationId
//! - csn: Csn and its text form
//! - server_state: per-source CSN watermarks
//! - peer: PeerInfo, PeerKind, PeerStatus
//! - assured: UpdateEnvelope, AckRecord, Completion

pub mod assured;
pub mod csn;
pub mod error;
pub mod identity;
pub mod peer;
pub mod server_state;

pub use assured::{
    AckRecord, AssuredMode, AssuredRequest, Completion, CompletionState, UpdateEnvelope,
};
pub use csn::Csn;
pub use error::{CoreError, InvalidCsn};
pub use identity::{GenerationId, GroupId, ServerId};
pub use peer::{PeerInfo, PeerKind, PeerStatus};
pub use server_state::ServerState;
