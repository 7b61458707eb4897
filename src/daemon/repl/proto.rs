//! Replication protocol message schemas.
//!
//! Messages are typed values; byte encoding belongs to the transport.

use serde::{Deserialize, Serialize};

use crate::core::{
    AckRecord, GenerationId, GroupId, PeerInfo, PeerKind, PeerStatus, ServerId, ServerState,
    UpdateEnvelope,
};

pub const PROTOCOL_VERSION_V1: u32 = 1;

/// Session handshake. Each side sends one before anything else.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartMsg {
    pub protocol_version: u32,
    pub server_id: ServerId,
    pub kind: PeerKind,
    pub group_id: GroupId,
    pub generation_id: GenerationId,
    pub server_state: ServerState,
    pub window_size: u32,
}

impl StartMsg {
    pub fn describe(&self) -> PeerInfo {
        PeerInfo::new(self.server_id, self.kind, self.group_id, self.generation_id)
    }
}

/// Membership snapshot as seen by the sender, minus the recipient.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyMsg {
    pub ds_infos: Vec<PeerInfo>,
    pub rs_infos: Vec<PeerInfo>,
}

impl TopologyMsg {
    pub fn from_peers(peers: impl IntoIterator<Item = PeerInfo>) -> Self {
        let mut msg = TopologyMsg::default();
        for peer in peers {
            match peer.kind {
                PeerKind::Ds => msg.ds_infos.push(peer),
                PeerKind::Rs => msg.rs_infos.push(peer),
            }
        }
        msg
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerInfo> {
        self.ds_infos.iter().chain(self.rs_infos.iter())
    }
}

/// Flow-control credit returned by a receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowMsg {
    pub credit: u32,
}

/// Status change of `server_id`, announced to neighbours.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStatusMsg {
    pub server_id: ServerId,
    pub status: PeerStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum ReplMessage {
    Start(StartMsg),
    Topology(TopologyMsg),
    Update(UpdateEnvelope),
    Ack(AckRecord),
    Window(WindowMsg),
    ChangeStatus(ChangeStatusMsg),
    Stop,
}

impl ReplMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ReplMessage::Start(_) => "START",
            ReplMessage::Topology(_) => "TOPOLOGY",
            ReplMessage::Update(_) => "UPDATE",
            ReplMessage::Ack(_) => "ACK",
            ReplMessage::Window(_) => "WINDOW",
            ReplMessage::ChangeStatus(_) => "CHANGE_STATUS",
            ReplMessage::Stop => "STOP",
        }
    }
}
