//! A hand-driven remote server.
//!
//! The test owns one end of a channel link and speaks the replication
//! protocol directly, so it decides exactly when (and whether) acks go
//! back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dirrepl::config::ReplicationConfig;
use dirrepl::daemon::repl::{
    ChangeStatusMsg, ChannelLink, PROTOCOL_VERSION_V1, ReplMessage, SessionLink, StartMsg,
    TopologyMsg, TransportError,
};
use dirrepl::daemon::{MemoryChangelog, SystemClock};
use dirrepl::{
    AckRecord, AssuredRequest, Csn, GenerationId, GroupId, PeerInfo, PeerKind, PeerStatus,
    Replica, ServerId, ServerState, UpdateEnvelope,
};

pub const GROUP: GroupId = GroupId::new(1);
pub const GENERATION: GenerationId = GenerationId::new(10);

/// Large enough that the replica never waits for window credit.
const SCRIPTED_WINDOW: u32 = 10_000;

pub fn rs(id: u16) -> PeerInfo {
    PeerInfo::new(ServerId::new(id), PeerKind::Rs, GROUP, GENERATION)
}

pub fn ds(id: u16) -> PeerInfo {
    PeerInfo::new(ServerId::new(id), PeerKind::Ds, GROUP, GENERATION)
}

/// A real replica in the shared scope, backed by an in-memory change log.
pub fn replica(info: &PeerInfo, assured_timeout: Duration) -> Replica {
    let config = ReplicationConfig {
        server_id: info.server_id,
        kind: info.kind,
        group_id: info.group_id,
        generation_id: info.generation_id,
        assured_timeout_ms: Some(assured_timeout.as_millis() as u64),
        ..ReplicationConfig::default()
    };
    Replica::new(
        &config,
        Arc::new(SystemClock),
        Arc::new(MemoryChangelog::new()),
    )
    .expect("replica")
}

/// An update stamped by `origin`.
pub fn update(origin: u16, seq: u32, assured: Option<AssuredRequest>) -> UpdateEnvelope {
    let csn = Csn::new(1_700_000_000_000, seq, ServerId::new(origin));
    UpdateEnvelope::new(csn, format!("cn=entry-{seq}")).with_assured(assured)
}

pub struct ScriptedPeer {
    info: PeerInfo,
    link: ChannelLink,
    remote: StartMsg,
}

impl ScriptedPeer {
    pub fn connect(replica: &Replica, info: PeerInfo) -> Self {
        Self::connect_with_state(replica, info, ServerState::new())
    }

    /// Handshake as `info`, claiming to already hold `state`.
    pub fn connect_with_state(replica: &Replica, info: PeerInfo, state: ServerState) -> Self {
        let (ours, theirs) = ChannelLink::pair();
        replica.attach(Arc::new(theirs));

        ours.send(ReplMessage::Start(StartMsg {
            protocol_version: PROTOCOL_VERSION_V1,
            server_id: info.server_id,
            kind: info.kind,
            group_id: info.group_id,
            generation_id: info.generation_id,
            server_state: state,
            window_size: SCRIPTED_WINDOW,
        }))
        .expect("send start");

        let deadline = Instant::now() + Duration::from_secs(2);
        let remote = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match ours.recv_timeout(remaining) {
                Ok(ReplMessage::Start(start)) => break start,
                Ok(other) => panic!("expected start, got {}", other.kind()),
                Err(err) => panic!("no start from replica: {err}"),
            }
        };
        Self {
            info,
            link: ours,
            remote,
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.info.server_id
    }

    pub fn remote_start(&self) -> &StartMsg {
        &self.remote
    }

    /// Next update from the replica, skipping control traffic.
    pub fn next_update(&self, timeout: Duration) -> Option<UpdateEnvelope> {
        self.next_matching(timeout, |msg| match msg {
            ReplMessage::Update(update) => Some(update),
            _ => None,
        })
    }

    pub fn next_ack(&self, timeout: Duration) -> Option<AckRecord> {
        self.next_matching(timeout, |msg| match msg {
            ReplMessage::Ack(ack) => Some(ack),
            _ => None,
        })
    }

    pub fn next_topology(&self, timeout: Duration) -> Option<TopologyMsg> {
        self.next_matching(timeout, |msg| match msg {
            ReplMessage::Topology(topology) => Some(topology),
            _ => None,
        })
    }

    pub fn next_status(&self, timeout: Duration) -> Option<ChangeStatusMsg> {
        self.next_matching(timeout, |msg| match msg {
            ReplMessage::ChangeStatus(status) => Some(status),
            _ => None,
        })
    }

    pub fn send_update(&self, update: UpdateEnvelope) {
        self.link
            .send(ReplMessage::Update(update))
            .expect("send update");
    }

    pub fn ack(&self, ack: AckRecord) {
        self.link.send(ReplMessage::Ack(ack)).expect("send ack");
    }

    /// Tell the replica which servers sit behind this one.
    pub fn announce(&self, peers: impl IntoIterator<Item = PeerInfo>) {
        let mut listed = vec![self.info.clone()];
        listed.extend(peers);
        self.link
            .send(ReplMessage::Topology(TopologyMsg::from_peers(listed)))
            .expect("send topology");
    }

    pub fn set_status(&self, server_id: ServerId, status: PeerStatus) {
        self.link
            .send(ReplMessage::ChangeStatus(ChangeStatusMsg { server_id, status }))
            .expect("send status");
    }

    pub fn disconnect(&self) {
        let _ = self.link.send(ReplMessage::Stop);
        self.link.close();
    }

    fn next_matching<T>(
        &self,
        timeout: Duration,
        mut pick: impl FnMut(ReplMessage) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match self.link.recv_timeout(remaining) {
                Ok(msg) => {
                    if let Some(found) = pick(msg) {
                        return Some(found);
                    }
                }
                Err(TransportError::Timeout) => return None,
                Err(err) => panic!("link failed: {err}"),
            }
        }
    }
}
