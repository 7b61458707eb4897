//! Per-peer flow-control status.
//!
//! A peer whose backlog (updates queued or in flight toward it) reaches the
//! degraded-status threshold is demoted to `Degraded`. It only returns to
//! `Normal` once the backlog has fully drained. `FullUpdate` is entered and
//! left explicitly around a bulk resynchronisation and overrides backlog
//! tracking. Every transition is pushed into the topology registry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::core::{PeerStatus, ServerId};

use super::topology::TopologyRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusTransition {
    pub peer: ServerId,
    pub from: PeerStatus,
    pub to: PeerStatus,
}

#[derive(Clone, Copy, Debug, Default)]
struct PeerFlow {
    backlog: usize,
    status: PeerStatus,
}

pub struct StatusMonitor {
    /// Zero disables demotion.
    threshold: usize,
    peers: Mutex<BTreeMap<ServerId, PeerFlow>>,
    registry: Arc<TopologyRegistry>,
}

impl StatusMonitor {
    pub fn new(threshold: usize, registry: Arc<TopologyRegistry>) -> Self {
        Self {
            threshold,
            peers: Mutex::new(BTreeMap::new()),
            registry,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Record the current backlog toward `peer` and apply any transition.
    pub fn observe_backlog(&self, peer: ServerId, backlog: usize) -> Option<StatusTransition> {
        let transition = {
            let mut peers = self.peers.lock().expect("status monitor lock poisoned");
            let flow = peers.entry(peer).or_default();
            flow.backlog = backlog;
            let next = match flow.status {
                PeerStatus::Normal if self.threshold > 0 && backlog >= self.threshold => {
                    PeerStatus::Degraded
                }
                PeerStatus::Degraded if backlog == 0 => PeerStatus::Normal,
                status => status,
            };
            Self::transition(peer, flow, next)
        };
        self.publish(transition)
    }

    pub fn begin_full_update(&self, peer: ServerId) -> Option<StatusTransition> {
        let transition = {
            let mut peers = self.peers.lock().expect("status monitor lock poisoned");
            let flow = peers.entry(peer).or_default();
            Self::transition(peer, flow, PeerStatus::FullUpdate)
        };
        self.publish(transition)
    }

    /// Leave `FullUpdate`. The peer comes back `Degraded` if its backlog is
    /// still above threshold.
    pub fn end_full_update(&self, peer: ServerId) -> Option<StatusTransition> {
        let transition = {
            let mut peers = self.peers.lock().expect("status monitor lock poisoned");
            let flow = peers.entry(peer).or_default();
            if flow.status != PeerStatus::FullUpdate {
                return None;
            }
            let next = if self.threshold > 0 && flow.backlog >= self.threshold {
                PeerStatus::Degraded
            } else {
                PeerStatus::Normal
            };
            Self::transition(peer, flow, next)
        };
        self.publish(transition)
    }

    pub fn status(&self, peer: ServerId) -> PeerStatus {
        self.peers
            .lock()
            .expect("status monitor lock poisoned")
            .get(&peer)
            .map(|flow| flow.status)
            .unwrap_or_default()
    }

    pub fn backlog(&self, peer: ServerId) -> usize {
        self.peers
            .lock()
            .expect("status monitor lock poisoned")
            .get(&peer)
            .map(|flow| flow.backlog)
            .unwrap_or(0)
    }

    pub fn forget(&self, peer: ServerId) {
        self.peers
            .lock()
            .expect("status monitor lock poisoned")
            .remove(&peer);
    }

    fn transition(
        peer: ServerId,
        flow: &mut PeerFlow,
        next: PeerStatus,
    ) -> Option<StatusTransition> {
        if flow.status == next {
            return None;
        }
        let from = std::mem::replace(&mut flow.status, next);
        Some(StatusTransition { peer, from, to: next })
    }

    fn publish(&self, transition: Option<StatusTransition>) -> Option<StatusTransition> {
        let transition = transition?;
        tracing::info!(
            peer = %transition.peer,
            from = %transition.from,
            to = %transition.to,
            backlog = self.backlog(transition.peer),
            "flow-control status transition"
        );
        self.registry.update_status(transition.peer, transition.to);
        Some(transition)
    }
}
