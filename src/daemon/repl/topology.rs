//! Live membership of the replication mesh.
//!
//! The registry holds one `PeerInfo` per known server: direct neighbours
//! (registered when their session starts) and servers learned from
//! neighbours' topology snapshots (recorded with `relay` set to the
//! neighbour that reported them). Readers take a short read lock; observers
//! are notified after the lock is released.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use crate::core::{
    AssuredMode, GenerationId, GroupId, PeerInfo, PeerKind, PeerStatus, ServerId,
};

use super::proto::TopologyMsg;

/// Peers selected for one assured computation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Eligibility {
    /// Peers that must answer.
    pub eligible: Vec<PeerInfo>,
    /// In-scope peers excluded because they were degraded at send time.
    pub wrong_status: Vec<PeerInfo>,
}

impl Eligibility {
    pub fn is_empty(&self) -> bool {
        self.eligible.is_empty() && self.wrong_status.is_empty()
    }
}

/// Read side of the registry, as used by the coordinator.
pub trait TopologyView: Send + Sync {
    fn eligible_peers(
        &self,
        group: GroupId,
        generation: GenerationId,
        mode: AssuredMode,
    ) -> Eligibility;

    fn direct_peers(&self) -> Vec<PeerInfo>;

    fn peer(&self, server_id: ServerId) -> Option<PeerInfo>;
}

/// Membership events.
pub trait TopologyObserver: Send + Sync {
    /// `gone` lists every server no longer reachable, direct or nested.
    fn peers_departed(&self, gone: &[ServerId]);

    fn status_changed(&self, _server_id: ServerId, _status: PeerStatus) {}
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopologyChange {
    pub added: Vec<ServerId>,
    pub removed: Vec<ServerId>,
    pub updated: Vec<ServerId>,
}

impl TopologyChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

pub struct TopologyRegistry {
    local_id: ServerId,
    local: RwLock<PeerInfo>,
    peers: RwLock<BTreeMap<ServerId, PeerInfo>>,
    observers: RwLock<Vec<Arc<dyn TopologyObserver>>>,
}

impl TopologyRegistry {
    pub fn new(local: PeerInfo) -> Self {
        Self {
            local_id: local.server_id,
            local: RwLock::new(local),
            peers: RwLock::new(BTreeMap::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn local(&self) -> PeerInfo {
        self.local.read().expect("topology lock poisoned").clone()
    }

    /// Status this server advertises about itself.
    pub fn set_local_status(&self, status: PeerStatus) -> bool {
        let mut local = self.local.write().expect("topology lock poisoned");
        let changed = local.status != status;
        local.status = status;
        changed
    }

    pub fn subscribe(&self, observer: Arc<dyn TopologyObserver>) {
        self.observers
            .write()
            .expect("topology observers lock poisoned")
            .push(observer);
    }

    /// Register a direct neighbour. Replaces any nested entry for the same
    /// server. Returns `true` if the entry changed.
    pub fn register(&self, mut peer: PeerInfo) -> bool {
        if peer.server_id == self.local_id {
            return false;
        }
        peer.relay = None;
        let mut peers = self.peers.write().expect("topology lock poisoned");
        let changed = peers.get(&peer.server_id) != Some(&peer);
        if changed {
            tracing::info!(
                peer = %peer.server_id,
                kind = %peer.kind,
                group = %peer.group_id,
                generation = %peer.generation_id,
                "replication peer registered"
            );
            peers.insert(peer.server_id, peer);
        }
        changed
    }

    /// Remove a server and everything reached through it.
    pub fn deregister(&self, server_id: ServerId) -> Vec<ServerId> {
        let gone: Vec<ServerId> = {
            let mut peers = self.peers.write().expect("topology lock poisoned");
            let gone: Vec<ServerId> = peers
                .values()
                .filter(|peer| peer.server_id == server_id || peer.relay == Some(server_id))
                .map(|peer| peer.server_id)
                .collect();
            for id in &gone {
                peers.remove(id);
            }
            gone
        };

        if !gone.is_empty() {
            tracing::info!(peer = %server_id, removed = gone.len(), "replication peer departed");
            self.notify_departed(&gone);
        }
        gone
    }

    /// Set a peer's status. Returns the previous status if it changed.
    pub fn update_status(&self, server_id: ServerId, status: PeerStatus) -> Option<PeerStatus> {
        let previous = {
            let mut peers = self.peers.write().expect("topology lock poisoned");
            let peer = peers.get_mut(&server_id)?;
            if peer.status == status {
                return None;
            }
            std::mem::replace(&mut peer.status, status)
        };

        tracing::info!(peer = %server_id, from = %previous, to = %status, "peer status changed");
        for observer in self.observers() {
            observer.status_changed(server_id, status);
        }
        Some(previous)
    }

    /// Replace everything learned through `via` with the contents of `msg`.
    ///
    /// Direct neighbours and the local server are never overwritten by
    /// nested entries.
    pub fn apply_snapshot(&self, via: ServerId, msg: &TopologyMsg) -> TopologyChange {
        let mut change = TopologyChange::default();
        {
            let mut peers = self.peers.write().expect("topology lock poisoned");
            let previous: BTreeMap<ServerId, PeerInfo> = peers
                .iter()
                .filter(|(_, peer)| peer.relay == Some(via))
                .map(|(id, peer)| (*id, peer.clone()))
                .collect();
            for id in previous.keys() {
                peers.remove(id);
            }

            let mut seen = BTreeSet::new();
            for entry in msg.peers() {
                let id = entry.server_id;
                if id == self.local_id || id == via {
                    continue;
                }
                if peers.get(&id).is_some_and(PeerInfo::is_direct) {
                    continue;
                }
                let nested = entry.clone().behind(via);
                match previous.get(&id) {
                    None if !peers.contains_key(&id) => change.added.push(id),
                    Some(old) if *old != nested => change.updated.push(id),
                    None => change.updated.push(id),
                    Some(_) => {}
                }
                seen.insert(id);
                peers.insert(id, nested);
            }

            change.removed = previous
                .keys()
                .filter(|id| !seen.contains(id))
                .copied()
                .collect();
        }

        if !change.removed.is_empty() {
            self.notify_departed(&change.removed);
        }
        if !change.is_empty() {
            tracing::debug!(
                via = %via,
                added = change.added.len(),
                removed = change.removed.len(),
                updated = change.updated.len(),
                "topology snapshot applied"
            );
        }
        change
    }

    /// Snapshot to send to `recipient`.
    ///
    /// A relay only learns about the sender and the directory servers
    /// attached to it; a directory server learns about everything but
    /// itself.
    pub fn snapshot_for(&self, recipient: &PeerInfo) -> TopologyMsg {
        let peers = self.peers.read().expect("topology lock poisoned");
        let local = std::iter::once(self.local());
        let others = peers
            .values()
            .filter(|peer| peer.server_id != recipient.server_id)
            .filter(|peer| match recipient.kind {
                PeerKind::Rs => peer.is_direct() && peer.kind == PeerKind::Ds,
                PeerKind::Ds => true,
            })
            .cloned()
            .map(|mut peer| {
                peer.relay = None;
                peer
            });
        TopologyMsg::from_peers(local.chain(others).collect::<Vec<_>>())
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers
            .read()
            .expect("topology lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().expect("topology lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn observers(&self) -> Vec<Arc<dyn TopologyObserver>> {
        self.observers
            .read()
            .expect("topology observers lock poisoned")
            .clone()
    }

    fn notify_departed(&self, gone: &[ServerId]) {
        for observer in self.observers() {
            observer.peers_departed(gone);
        }
    }
}

impl TopologyView for TopologyRegistry {
    fn eligible_peers(
        &self,
        group: GroupId,
        generation: GenerationId,
        mode: AssuredMode,
    ) -> Eligibility {
        let peers = self.peers.read().expect("topology lock poisoned");
        let mut out = Eligibility::default();
        for peer in peers.values() {
            if !peer.in_scope(group, generation) {
                continue;
            }
            match (mode, peer.kind, peer.status) {
                (AssuredMode::SafeData, PeerKind::Rs, _) => out.eligible.push(peer.clone()),
                (AssuredMode::SafeRead, PeerKind::Ds, PeerStatus::Normal) => {
                    out.eligible.push(peer.clone())
                }
                (AssuredMode::SafeRead, PeerKind::Ds, PeerStatus::Degraded) => {
                    out.wrong_status.push(peer.clone())
                }
                _ => {}
            }
        }
        out
    }

    fn direct_peers(&self) -> Vec<PeerInfo> {
        self.peers
            .read()
            .expect("topology lock poisoned")
            .values()
            .filter(|peer| peer.is_direct())
            .cloned()
            .collect()
    }

    fn peer(&self, server_id: ServerId) -> Option<PeerInfo> {
        self.peers
            .read()
            .expect("topology lock poisoned")
            .get(&server_id)
            .cloned()
    }
}
