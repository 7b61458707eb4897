//! Pollable assured-replication counters.
//!
//! Counters are kept per assured mode for updates this server waited on,
//! per remote peer for traffic, and for assured updates received from
//! others. The monitoring collaborator polls `snapshot()`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::core::{AssuredMode, Completion, ServerId};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ModeCounters {
    pub sent_updates: u64,
    pub acknowledged_updates: u64,
    pub not_acknowledged_updates: u64,
    pub timeout_updates: u64,
    pub wrong_status_updates: u64,
    pub replay_error_updates: u64,
    pub server_not_acknowledged_updates: BTreeMap<ServerId, u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReceivedCounters {
    pub safe_read_received_updates: u64,
    pub safe_read_received_acked: u64,
    pub safe_read_received_not_acked: u64,
    pub safe_data_received_updates: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PeerCounters {
    pub updates_sent: u64,
    pub assured_updates_sent: u64,
    pub acks_received: u64,
    pub failed_to_ack: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MonitorSnapshot {
    pub server_id: ServerId,
    pub updates_sent: u64,
    pub updates_received: u64,
    pub safe_data: ModeCounters,
    pub safe_read: ModeCounters,
    pub received: ReceivedCounters,
    pub peers: BTreeMap<ServerId, PeerCounters>,
}

impl MonitorSnapshot {
    pub fn mode(&self, mode: AssuredMode) -> &ModeCounters {
        match mode {
            AssuredMode::SafeData => &self.safe_data,
            AssuredMode::SafeRead => &self.safe_read,
        }
    }

    fn mode_mut(&mut self, mode: AssuredMode) -> &mut ModeCounters {
        match mode {
            AssuredMode::SafeData => &mut self.safe_data,
            AssuredMode::SafeRead => &mut self.safe_read,
        }
    }
}

#[derive(Debug)]
pub struct AssuredMonitor {
    inner: Mutex<MonitorSnapshot>,
}

impl AssuredMonitor {
    pub fn new(server_id: ServerId) -> Self {
        Self {
            inner: Mutex::new(MonitorSnapshot {
                server_id,
                ..MonitorSnapshot::default()
            }),
        }
    }

    /// A locally originated update entered the coordinator.
    pub fn record_submitted(&self, mode: Option<AssuredMode>) {
        let mut inner = self.inner.lock().expect("monitor lock poisoned");
        inner.updates_sent += 1;
        if let Some(mode) = mode {
            inner.mode_mut(mode).sent_updates += 1;
        }
    }

    pub fn record_completion(&self, completion: &Completion) {
        let Some(mode) = completion.mode else {
            return;
        };
        let mut inner = self.inner.lock().expect("monitor lock poisoned");
        for peer in &completion.report.failed_server_ids {
            inner.peers.entry(*peer).or_default().failed_to_ack += 1;
        }

        let counters = inner.mode_mut(mode);
        let report = &completion.report;
        if completion.is_acked() && report.is_positive() {
            counters.acknowledged_updates += 1;
            return;
        }
        counters.not_acknowledged_updates += 1;
        if report.has_timeout {
            counters.timeout_updates += 1;
        }
        if report.has_wrong_status {
            counters.wrong_status_updates += 1;
        }
        if report.has_replay_error {
            counters.replay_error_updates += 1;
        }
        for peer in &report.failed_server_ids {
            *counters
                .server_not_acknowledged_updates
                .entry(*peer)
                .or_default() += 1;
        }
    }

    pub fn record_update_sent(&self, peer: ServerId, assured: bool) {
        let mut inner = self.inner.lock().expect("monitor lock poisoned");
        let counters = inner.peers.entry(peer).or_default();
        counters.updates_sent += 1;
        if assured {
            counters.assured_updates_sent += 1;
        }
    }

    pub fn record_ack_received(&self, peer: ServerId) {
        let mut inner = self.inner.lock().expect("monitor lock poisoned");
        inner.peers.entry(peer).or_default().acks_received += 1;
    }

    /// An update arrived from a peer carrying `assured`.
    pub fn record_received(&self, assured: Option<AssuredMode>) {
        let mut inner = self.inner.lock().expect("monitor lock poisoned");
        inner.updates_received += 1;
        match assured {
            Some(AssuredMode::SafeRead) => inner.received.safe_read_received_updates += 1,
            Some(AssuredMode::SafeData) => inner.received.safe_data_received_updates += 1,
            None => {}
        }
    }

    /// This server answered a safe-read update it received.
    pub fn record_safe_read_answer(&self, positive: bool) {
        let mut inner = self.inner.lock().expect("monitor lock poisoned");
        if positive {
            inner.received.safe_read_received_acked += 1;
        } else {
            inner.received.safe_read_received_not_acked += 1;
        }
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        self.inner.lock().expect("monitor lock poisoned").clone()
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("monitor lock poisoned");
        let server_id = inner.server_id;
        *inner = MonitorSnapshot {
            server_id,
            ..MonitorSnapshot::default()
        };
    }
}
