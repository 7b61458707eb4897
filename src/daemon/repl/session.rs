//! Replication session state machine.
//!
//! One `Session` per connected neighbour. It owns the handshake and the
//! update window and never touches a socket: callers feed it messages and
//! commands and carry out the returned actions.

use std::collections::VecDeque;

use thiserror::Error;

use crate::core::{AckRecord, ServerId, UpdateEnvelope};

use super::proto::{
    ChangeStatusMsg, PROTOCOL_VERSION_V1, ReplMessage, StartMsg, TopologyMsg, WindowMsg,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Handshaking,
    Streaming,
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionError {
    #[error("protocol version {got} not supported (expected {expected})")]
    VersionIncompatible { expected: u32, got: u32 },
    #[error("peer announced our own server id {server_id}")]
    ServerIdCollision { server_id: ServerId },
    #[error("{kind} received before handshake")]
    BeforeHandshake { kind: &'static str },
    #[error("duplicate START from {server_id}")]
    DuplicateStart { server_id: ServerId },
    #[error("peer window size must be positive")]
    EmptyWindow,
    #[error("session closed by peer")]
    PeerStopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    Send(ReplMessage),
    /// Handshake finished; the peer is described by its START.
    Established(StartMsg),
    PeerUpdate(UpdateEnvelope),
    PeerAck(AckRecord),
    PeerTopology(TopologyMsg),
    PeerStatus(ChangeStatusMsg),
    Close { error: Option<SessionError> },
}

#[derive(Debug)]
pub struct Session {
    phase: SessionPhase,
    local: StartMsg,
    peer: Option<StartMsg>,
    /// Updates the peer will still accept before returning credit.
    send_credit: u32,
    queued: VecDeque<UpdateEnvelope>,
    /// Updates received and consumed since credit was last returned.
    consumed: u32,
    /// Updates received but not consumed yet.
    unconsumed: u32,
}

impl Session {
    pub fn new(local: StartMsg) -> Self {
        Self {
            phase: SessionPhase::Connecting,
            local,
            peer: None,
            send_credit: 0,
            queued: VecDeque::new(),
            consumed: 0,
            unconsumed: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn peer(&self) -> Option<&StartMsg> {
        self.peer.as_ref()
    }

    pub fn peer_id(&self) -> Option<ServerId> {
        self.peer.as_ref().map(|peer| peer.server_id)
    }

    pub fn begin_handshake(&mut self) -> Option<SessionAction> {
        if self.phase != SessionPhase::Connecting {
            return None;
        }
        self.phase = SessionPhase::Handshaking;
        Some(SessionAction::Send(ReplMessage::Start(self.local.clone())))
    }

    pub fn handle_message(&mut self, msg: ReplMessage) -> Vec<SessionAction> {
        if self.phase == SessionPhase::Closed {
            return Vec::new();
        }
        match msg {
            ReplMessage::Start(start) => self.handle_start(start),
            ReplMessage::Stop => {
                self.phase = SessionPhase::Closed;
                vec![SessionAction::Close {
                    error: Some(SessionError::PeerStopped),
                }]
            }
            other if self.phase != SessionPhase::Streaming => self.fail(SessionError::BeforeHandshake {
                kind: other.kind(),
            }),
            ReplMessage::Update(update) => {
                self.unconsumed = self.unconsumed.saturating_add(1);
                vec![SessionAction::PeerUpdate(update)]
            }
            ReplMessage::Ack(ack) => vec![SessionAction::PeerAck(ack)],
            ReplMessage::Topology(msg) => vec![SessionAction::PeerTopology(msg)],
            ReplMessage::ChangeStatus(msg) => vec![SessionAction::PeerStatus(msg)],
            ReplMessage::Window(WindowMsg { credit }) => {
                self.send_credit = self.send_credit.saturating_add(credit);
                self.flush_queue()
            }
        }
    }

    /// Send an update if the window allows, otherwise queue it.
    pub fn push_update(&mut self, update: UpdateEnvelope) -> Vec<SessionAction> {
        if self.phase == SessionPhase::Closed {
            return Vec::new();
        }
        self.queued.push_back(update);
        if self.phase == SessionPhase::Streaming {
            self.flush_queue()
        } else {
            Vec::new()
        }
    }

    /// Control messages bypass the window.
    pub fn push_control(&mut self, msg: ReplMessage) -> Option<SessionAction> {
        (self.phase == SessionPhase::Streaming).then_some(SessionAction::Send(msg))
    }

    /// One received update has been fully handled. Returns credit to the
    /// peer once half the local window is used up, or as soon as nothing
    /// received is left unconsumed so the peer sees its backlog drain.
    pub fn update_consumed(&mut self) -> Option<SessionAction> {
        if self.phase != SessionPhase::Streaming {
            return None;
        }
        self.unconsumed = self.unconsumed.saturating_sub(1);
        self.consumed += 1;
        let half = (self.local.window_size / 2).max(1);
        if self.consumed < half && self.unconsumed > 0 {
            return None;
        }
        let credit = std::mem::take(&mut self.consumed);
        Some(SessionAction::Send(ReplMessage::Window(WindowMsg { credit })))
    }

    /// Updates queued locally plus those sent but not yet credited back.
    pub fn backlog(&self) -> usize {
        let in_flight = self
            .peer
            .as_ref()
            .map(|peer| peer.window_size.saturating_sub(self.send_credit))
            .unwrap_or(0);
        self.queued.len() + in_flight as usize
    }

    pub fn close(&mut self) -> Option<SessionAction> {
        let was_streaming = self.phase == SessionPhase::Streaming;
        self.phase = SessionPhase::Closed;
        self.queued.clear();
        was_streaming.then_some(SessionAction::Send(ReplMessage::Stop))
    }

    fn handle_start(&mut self, start: StartMsg) -> Vec<SessionAction> {
        if let Some(peer) = &self.peer {
            let server_id = peer.server_id;
            return self.fail(SessionError::DuplicateStart { server_id });
        }
        if start.protocol_version != PROTOCOL_VERSION_V1 {
            return self.fail(SessionError::VersionIncompatible {
                expected: PROTOCOL_VERSION_V1,
                got: start.protocol_version,
            });
        }
        if start.server_id == self.local.server_id {
            return self.fail(SessionError::ServerIdCollision {
                server_id: start.server_id,
            });
        }
        if start.window_size == 0 {
            return self.fail(SessionError::EmptyWindow);
        }

        let mut actions = Vec::new();
        if let Some(action) = self.begin_handshake() {
            actions.push(action);
        }
        self.send_credit = start.window_size;
        self.peer = Some(start.clone());
        self.phase = SessionPhase::Streaming;
        actions.push(SessionAction::Established(start));
        actions.extend(self.flush_queue());
        actions
    }

    fn flush_queue(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        while self.send_credit > 0
            && let Some(update) = self.queued.pop_front()
        {
            self.send_credit -= 1;
            actions.push(SessionAction::Send(ReplMessage::Update(update)));
        }
        actions
    }

    fn fail(&mut self, error: SessionError) -> Vec<SessionAction> {
        tracing::warn!(peer = ?self.peer_id(), "replication session failed: {error}");
        self.phase = SessionPhase::Closed;
        self.queued.clear();
        vec![SessionAction::Close { error: Some(error) }]
    }
}
