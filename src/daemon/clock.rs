//! CSN generation.
//!
//! The generator stamps local changes with monotonically increasing CSNs
//! that embed this server's id. Wall-clock regressions never produce a
//! duplicate or smaller CSN: the generator keeps the last timestamp and
//! bumps the sequence instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::{Csn, ServerId, ServerState};

/// Source of wall time in milliseconds since the Unix epoch.
pub trait WallClock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Hand-driven clock for tests and simulations. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(now_ms)),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl WallClock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Last {
    timestamp_ms: u64,
    seq: u32,
}

/// Thread-safe CSN generator for one source.
pub struct CsnGenerator {
    server_id: ServerId,
    clock: Arc<dyn WallClock>,
    last: Mutex<Last>,
}

impl CsnGenerator {
    pub fn new(server_id: ServerId, clock: Arc<dyn WallClock>) -> Self {
        Self {
            server_id,
            clock,
            last: Mutex::new(Last::default()),
        }
    }

    /// Generator whose first CSN sorts after `floor`.
    pub fn with_floor(server_id: ServerId, clock: Arc<dyn WallClock>, floor: Option<Csn>) -> Self {
        let generator = Self::new(server_id, clock);
        if let Some(floor) = floor {
            generator.observe(&floor);
        }
        generator
    }

    /// Seed from persisted state so new CSNs sort after everything already
    /// known, from any source.
    pub fn from_server_state(
        server_id: ServerId,
        clock: Arc<dyn WallClock>,
        state: &ServerState,
    ) -> Self {
        Self::with_floor(server_id, clock, state.max_csn())
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Stamp a new local change.
    ///
    /// Guarantees:
    /// - Returned CSN is strictly greater than any previous one from this generator
    /// - Monotonic even if the wall clock goes backward
    pub fn next(&self) -> Csn {
        let now = self.clock.now_ms();
        let mut last = self.last.lock().expect("csn generator lock poisoned");

        if now > last.timestamp_ms {
            last.timestamp_ms = now;
            last.seq = 0;
        } else if last.seq == u32::MAX {
            // Sequence exhausted within one millisecond: move to a synthetic
            // next millisecond.
            last.timestamp_ms += 1;
            last.seq = 0;
        } else {
            last.seq += 1;
        }

        Csn::new(last.timestamp_ms, last.seq, self.server_id)
    }

    /// Adjust past a CSN seen from a peer so that the next local CSN sorts
    /// after it.
    pub fn observe(&self, remote: &Csn) {
        let mut last = self.last.lock().expect("csn generator lock poisoned");
        if (remote.timestamp_ms(), remote.seq()) > (last.timestamp_ms, last.seq) {
            last.timestamp_ms = remote.timestamp_ms();
            last.seq = remote.seq();
        }
    }

    /// Last CSN handed out (or observed), if any.
    pub fn last(&self) -> Option<Csn> {
        let last = *self.last.lock().expect("csn generator lock poisoned");
        (last != Last::default()).then(|| Csn::new(last.timestamp_ms, last.seq, self.server_id))
    }
}

impl std::fmt::Debug for CsnGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsnGenerator")
            .field("server_id", &self.server_id)
            .field("last", &self.last())
            .finish()
    }
}
