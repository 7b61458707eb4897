//! Peer descriptors as seen by the topology registry.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::identity::{GenerationId, GroupId, ServerId};

/// Role of a node in the replication mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    /// Directory server: serves reads, originates writes, replays updates.
    Ds,
    /// Replication server: relays and aggregates between other nodes.
    Rs,
}

impl PeerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerKind::Ds => "ds",
            PeerKind::Rs => "rs",
        }
    }

    pub fn is_relay(self) -> bool {
        matches!(self, PeerKind::Rs)
    }
}

impl fmt::Display for PeerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flow-control status of a peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    #[default]
    Normal,
    Degraded,
    FullUpdate,
}

impl PeerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerStatus::Normal => "normal",
            PeerStatus::Degraded => "degraded",
            PeerStatus::FullUpdate => "full_update",
        }
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub server_id: ServerId,
    pub kind: PeerKind,
    pub group_id: GroupId,
    pub generation_id: GenerationId,
    #[serde(default)]
    pub status: PeerStatus,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Directly connected peer through which this one is reached. `None`
    /// for direct neighbours.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<ServerId>,
}

fn default_weight() -> u32 {
    1
}

impl PeerInfo {
    pub fn new(
        server_id: ServerId,
        kind: PeerKind,
        group_id: GroupId,
        generation_id: GenerationId,
    ) -> Self {
        Self {
            server_id,
            kind,
            group_id,
            generation_id,
            status: PeerStatus::Normal,
            weight: default_weight(),
            relay: None,
        }
    }

    pub fn with_status(mut self, status: PeerStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn behind(mut self, relay: ServerId) -> Self {
        self.relay = Some(relay);
        self
    }

    /// The neighbour that carries traffic to and acks from this peer.
    pub fn hop(&self) -> ServerId {
        self.relay.unwrap_or(self.server_id)
    }

    pub fn is_direct(&self) -> bool {
        self.relay.is_none()
    }

    /// Same consistency scope as `(group, generation)`.
    pub fn in_scope(&self, group: GroupId, generation: GenerationId) -> bool {
        self.group_id == group && self.generation_id == generation
    }
}
