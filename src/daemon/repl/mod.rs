//! Replication sessions and assured-ack coordination.

pub mod coordinator;
pub mod pending;
pub mod proto;
pub mod runtime;
pub mod session;
pub mod status;
pub mod timer;
pub mod topology;
pub mod transport;

pub use coordinator::{Coordinator, CoordinatorConfig, Scope, UpdateSink};
pub use pending::{PendingAcks, Registered, Registration, Resolution, Waiter};
pub use proto::{
    ChangeStatusMsg, PROTOCOL_VERSION_V1, ReplMessage, StartMsg, TopologyMsg, WindowMsg,
};
pub use runtime::{SessionEvents, SessionHandle, SessionTable, spawn_session};
pub use session::{Session, SessionAction, SessionError, SessionPhase};
pub use status::{StatusMonitor, StatusTransition};
pub use topology::{Eligibility, TopologyChange, TopologyObserver, TopologyRegistry, TopologyView};
pub use transport::{ChannelLink, SessionLink, TransportError};
