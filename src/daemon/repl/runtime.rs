//! Session threads.
//!
//! Each neighbour gets a reader thread pulling messages off its link and a
//! session thread that multiplexes those messages with local commands,
//! drives the `Session` state machine and reports what happened through
//! `SessionEvents`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};

use crate::core::{AckRecord, ServerId, UpdateEnvelope};

use super::coordinator::UpdateSink;
use super::proto::{ChangeStatusMsg, ReplMessage, StartMsg, TopologyMsg};
use super::session::{Session, SessionAction, SessionError};
use super::transport::{SessionLink, TransportError};

const READ_POLL: Duration = Duration::from_millis(50);
const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug)]
enum SessionCommand {
    Update(UpdateEnvelope),
    Control(ReplMessage),
    Consumed,
    Close,
}

enum InboundMessage {
    Message(ReplMessage),
    Terminated,
}

/// Cheap handle for queueing work on a session thread.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    tx: Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn send_update(&self, update: UpdateEnvelope) -> Result<(), TransportError> {
        self.command(SessionCommand::Update(update))
    }

    pub fn send_ack(&self, ack: AckRecord) -> Result<(), TransportError> {
        self.command(SessionCommand::Control(ReplMessage::Ack(ack)))
    }

    pub fn send_topology(&self, msg: TopologyMsg) -> Result<(), TransportError> {
        self.command(SessionCommand::Control(ReplMessage::Topology(msg)))
    }

    pub fn send_status(&self, msg: ChangeStatusMsg) -> Result<(), TransportError> {
        self.command(SessionCommand::Control(ReplMessage::ChangeStatus(msg)))
    }

    /// A received update has been handled; may return window credit.
    pub fn consumed(&self) {
        let _ = self.command(SessionCommand::Consumed);
    }

    pub fn close(&self) {
        let _ = self.command(SessionCommand::Close);
    }

    pub fn same_session(&self, other: &SessionHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    fn command(&self, command: SessionCommand) -> Result<(), TransportError> {
        self.tx.send(command).map_err(|_| TransportError::Closed)
    }
}

/// Established sessions by peer id.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<BTreeMap<ServerId, SessionHandle>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle this one replaced, if any.
    pub fn insert(&self, peer: ServerId, handle: SessionHandle) -> Option<SessionHandle> {
        self.sessions
            .write()
            .expect("session table lock poisoned")
            .insert(peer, handle)
    }

    pub fn remove(&self, peer: ServerId) -> Option<SessionHandle> {
        self.sessions
            .write()
            .expect("session table lock poisoned")
            .remove(&peer)
    }

    /// Remove `peer` only if it is still served by `handle`.
    pub fn remove_if(&self, peer: ServerId, handle: &SessionHandle) -> bool {
        let mut sessions = self.sessions.write().expect("session table lock poisoned");
        if sessions.get(&peer).is_some_and(|current| current.same_session(handle)) {
            sessions.remove(&peer);
            true
        } else {
            false
        }
    }

    pub fn get(&self, peer: ServerId) -> Option<SessionHandle> {
        self.sessions
            .read()
            .expect("session table lock poisoned")
            .get(&peer)
            .cloned()
    }

    pub fn handles(&self) -> Vec<(ServerId, SessionHandle)> {
        self.sessions
            .read()
            .expect("session table lock poisoned")
            .iter()
            .map(|(peer, handle)| (*peer, handle.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("session table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handle(&self, peer: ServerId) -> Result<SessionHandle, TransportError> {
        self.get(peer).ok_or(TransportError::NotConnected { peer })
    }
}

impl UpdateSink for SessionTable {
    fn send_update(&self, peer: ServerId, update: UpdateEnvelope) -> Result<(), TransportError> {
        self.handle(peer)?.send_update(update)
    }

    fn send_ack(&self, peer: ServerId, ack: AckRecord) -> Result<(), TransportError> {
        self.handle(peer)?.send_ack(ack)
    }
}

/// Callbacks from a session thread. Implementations must not block on
/// another session.
pub trait SessionEvents: Send + Sync {
    fn established(&self, peer: &StartMsg, handle: &SessionHandle);

    fn update_received(&self, from: ServerId, update: UpdateEnvelope, handle: &SessionHandle);

    fn ack_received(&self, from: ServerId, ack: AckRecord);

    fn topology_received(&self, from: ServerId, msg: TopologyMsg);

    fn status_received(&self, from: ServerId, msg: ChangeStatusMsg);

    fn backlog_changed(&self, peer: ServerId, backlog: usize);

    /// The session ended. `peer` is `None` if the handshake never finished.
    fn closed(&self, peer: Option<ServerId>, handle: &SessionHandle);
}

/// Start the threads for one link. The returned join handle completes
/// after `SessionEvents::closed` has run.
pub fn spawn_session(
    link: Arc<dyn SessionLink>,
    local: StartMsg,
    events: Arc<dyn SessionEvents>,
    shutdown: Arc<AtomicBool>,
) -> (SessionHandle, JoinHandle<()>) {
    let (tx, rx) = crossbeam::channel::unbounded();
    let handle = SessionHandle { tx };
    let driver = SessionDriver {
        link,
        session: Session::new(local),
        handle: handle.clone(),
        events,
        reported_backlog: 0,
    };
    let join = thread::spawn(move || run_session(driver, rx, shutdown));
    (handle, join)
}

struct SessionDriver {
    link: Arc<dyn SessionLink>,
    session: Session,
    handle: SessionHandle,
    events: Arc<dyn SessionEvents>,
    reported_backlog: usize,
}

impl SessionDriver {
    /// Carry out `actions`. Returns `true` when the session must end.
    fn apply(&mut self, actions: impl IntoIterator<Item = SessionAction>) -> bool {
        for action in actions {
            let peer = self.session.peer_id();
            match action {
                SessionAction::Send(msg) => {
                    if let Err(err) = self.link.send(msg) {
                        tracing::debug!(peer = ?peer, "replication send failed: {err}");
                        return true;
                    }
                }
                SessionAction::Established(start) => {
                    tracing::info!(
                        peer = %start.server_id,
                        kind = %start.kind,
                        window = start.window_size,
                        "replication session established"
                    );
                    self.events.established(&start, &self.handle);
                }
                SessionAction::PeerUpdate(update) => {
                    if let Some(peer) = peer {
                        self.events.update_received(peer, update, &self.handle);
                    }
                }
                SessionAction::PeerAck(ack) => {
                    if let Some(peer) = peer {
                        self.events.ack_received(peer, ack);
                    }
                }
                SessionAction::PeerTopology(msg) => {
                    if let Some(peer) = peer {
                        self.events.topology_received(peer, msg);
                    }
                }
                SessionAction::PeerStatus(msg) => {
                    if let Some(peer) = peer {
                        self.events.status_received(peer, msg);
                    }
                }
                SessionAction::Close { error } => {
                    match error {
                        None | Some(SessionError::PeerStopped) => {
                            tracing::info!(peer = ?peer, "replication session stopped by peer");
                        }
                        Some(err) => {
                            tracing::warn!(peer = ?peer, "replication session closed: {err}");
                        }
                    }
                    return true;
                }
            }
        }
        self.report_backlog();
        false
    }

    fn report_backlog(&mut self) {
        let Some(peer) = self.session.peer_id() else {
            return;
        };
        let backlog = self.session.backlog();
        if backlog != self.reported_backlog {
            self.reported_backlog = backlog;
            self.events.backlog_changed(peer, backlog);
        }
    }

    fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Update(update) => {
                let actions = self.session.push_update(update);
                self.apply(actions)
            }
            SessionCommand::Control(msg) => {
                let action = self.session.push_control(msg);
                self.apply(action)
            }
            SessionCommand::Consumed => {
                let action = self.session.update_consumed();
                self.apply(action)
            }
            SessionCommand::Close => true,
        }
    }
}

fn run_session(mut driver: SessionDriver, commands: Receiver<SessionCommand>, shutdown: Arc<AtomicBool>) {
    let (inbound_tx, inbound_rx) = crossbeam::channel::unbounded::<InboundMessage>();
    let reader_link = driver.link.clone();
    let reader_shutdown = shutdown.clone();
    let reader_handle = thread::spawn(move || {
        run_reader_loop(reader_link.as_ref(), inbound_tx, reader_shutdown);
    });

    let mut done = match driver.session.begin_handshake() {
        Some(action) => driver.apply([action]),
        None => false,
    };

    while !done {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        crossbeam::select! {
            recv(inbound_rx) -> msg => {
                done = match msg {
                    Ok(InboundMessage::Message(msg)) => {
                        let actions = driver.session.handle_message(msg);
                        driver.apply(actions)
                    }
                    Ok(InboundMessage::Terminated) | Err(_) => true,
                };
            }
            recv(commands) -> command => {
                done = match command {
                    Ok(command) => driver.handle_command(command),
                    Err(_) => true,
                };
            }
            default(IDLE_POLL) => {}
        }
    }

    let peer = driver.session.peer_id();
    if let Some(SessionAction::Send(stop)) = driver.session.close() {
        let _ = driver.link.send(stop);
    }
    driver.link.close();
    let _ = reader_handle.join();
    driver.events.closed(peer, &driver.handle);
}

fn run_reader_loop(
    link: &dyn SessionLink,
    inbound_tx: Sender<InboundMessage>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            let _ = inbound_tx.send(InboundMessage::Terminated);
            break;
        }

        match link.recv_timeout(READ_POLL) {
            Ok(msg) => {
                if inbound_tx.send(InboundMessage::Message(msg)).is_err() {
                    break;
                }
            }
            Err(TransportError::Timeout) => continue,
            Err(err) => {
                tracing::debug!("replication reader stopped: {err}");
                let _ = inbound_tx.send(InboundMessage::Terminated);
                break;
            }
        }
    }
}
