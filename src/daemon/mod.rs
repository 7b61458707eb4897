//! Replication service.
//!
//! Provides:
//! - CSN stamping over a wall clock
//! - Change log seam and an in-memory implementation
//! - Sessions, topology and assured-ack coordination (`repl`)
//! - Assured monitoring counters and metric events
//! - `Replica`, which wires all of the above for one server

pub mod changelog;
pub mod clock;
pub mod metrics;
pub mod monitor;
pub mod repl;
pub mod replica;

pub use changelog::{Changelog, ChangelogError, MemoryChangelog};
pub use clock::{CsnGenerator, ManualClock, SystemClock, WallClock};
pub use monitor::{AssuredMonitor, MonitorSnapshot};
pub use replica::{InboundUpdate, ReplayError, Replica};
