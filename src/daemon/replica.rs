//! A replication node.
//!
//! `Replica` ties the pieces together for one server: CSN stamping, the
//! local server state and change log, the topology registry, per-peer flow
//! status, the session table and the assured coordinator. A directory
//! server (DS) hands received updates to a replay loop and answers
//! safe-read requests once replay finishes. A replication server (RS)
//! forwards what it receives and answers for the peers behind it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

use crate::config::ReplicationConfig;
use crate::core::{
    AckRecord, AssuredMode, AssuredRequest, Completion, Csn, PeerInfo, PeerKind, PeerStatus,
    ServerId, ServerState, UpdateEnvelope,
};
use crate::daemon::changelog::Changelog;
use crate::daemon::clock::{CsnGenerator, WallClock};
use crate::daemon::metrics;
use crate::daemon::monitor::AssuredMonitor;
use crate::daemon::repl::{
    ChangeStatusMsg, ChannelLink, Coordinator, CoordinatorConfig, PROTOCOL_VERSION_V1,
    SessionEvents, SessionHandle, SessionLink, SessionTable, StartMsg, StatusMonitor,
    StatusTransition, TopologyMsg, TopologyRegistry, TopologyView, spawn_session,
};

const REPLAY_POLL: Duration = Duration::from_millis(100);
const WAIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("replay failed: {reason}")]
pub struct ReplayError {
    pub reason: String,
}

impl ReplayError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// An update received by a directory server, waiting to be replayed.
///
/// Call `finish` with the replay outcome. Dropping it unfinished releases
/// flow-control credit but sends no ack.
#[derive(Debug)]
pub struct InboundUpdate {
    update: UpdateEnvelope,
    source: ServerId,
    ack_to: Option<ServerId>,
    local_id: ServerId,
    session: SessionHandle,
    monitor: Arc<AssuredMonitor>,
    received: Instant,
    finished: bool,
}

impl InboundUpdate {
    pub fn update(&self) -> &UpdateEnvelope {
        &self.update
    }

    pub fn csn(&self) -> Csn {
        self.update.csn
    }

    pub fn payload(&self) -> &Bytes {
        &self.update.payload
    }

    /// Neighbour the update arrived from.
    pub fn source(&self) -> ServerId {
        self.source
    }

    /// Whether finishing this update answers a safe-read wait upstream.
    pub fn expects_ack(&self) -> bool {
        self.ack_to.is_some()
    }

    pub fn finish(mut self, result: Result<(), ReplayError>) {
        self.finished = true;
        let csn = self.update.csn;
        let elapsed = self.received.elapsed();
        match &result {
            Ok(()) => metrics::replay_ok(elapsed),
            Err(err) => {
                metrics::replay_err(elapsed);
                tracing::warn!(csn = %csn, source = %self.source, "{err}");
            }
        }
        if let Some(hop) = self.ack_to {
            let ack = match result {
                Ok(()) => AckRecord::positive(csn),
                Err(_) => AckRecord::replay_error(csn, self.local_id),
            };
            self.monitor.record_safe_read_answer(ack.is_positive());
            if let Err(err) = self.session.send_ack(ack) {
                tracing::debug!(csn = %csn, peer = %hop, "safe-read ack not sent: {err}");
            }
        }
        self.session.consumed();
    }
}

impl Drop for InboundUpdate {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(csn = %self.update.csn, "inbound update dropped without replay");
            self.session.consumed();
        }
    }
}

pub struct Replica {
    core: Arc<ReplicaCore>,
    inbound: Receiver<InboundUpdate>,
}

impl Replica {
    pub fn new(
        config: &ReplicationConfig,
        clock: Arc<dyn WallClock>,
        changelog: Arc<dyn Changelog>,
    ) -> crate::Result<Self> {
        config.validate()?;
        let default_request = config.default_request()?;
        let local = config.local_peer();

        let registry = Arc::new(TopologyRegistry::new(local.clone()));
        let sessions = Arc::new(SessionTable::new());
        let monitor = Arc::new(AssuredMonitor::new(local.server_id));
        let coordinator = Coordinator::new(
            CoordinatorConfig {
                local: local.clone(),
                assured_timeout: config.assured_timeout(),
            },
            registry.clone(),
            sessions.clone(),
            monitor.clone(),
        );
        registry.subscribe(coordinator.observer());

        let state = changelog.server_state();
        let generator = CsnGenerator::from_server_state(local.server_id, clock, &state);
        let (inbound_tx, inbound) = crossbeam::channel::unbounded();

        tracing::info!(
            server_id = %local.server_id,
            kind = %local.kind,
            group = %local.group_id,
            generation = %local.generation_id,
            "replica started"
        );

        let core = Arc::new(ReplicaCore {
            local_id: local.server_id,
            kind: local.kind,
            window_size: config.window_size,
            default_request,
            generator,
            state: Mutex::new(state),
            changelog,
            status: StatusMonitor::new(config.degraded_status_threshold, registry.clone()),
            registry,
            sessions,
            coordinator,
            monitor,
            inbound_tx,
            shutdown: Arc::new(AtomicBool::new(false)),
            joins: Mutex::new(Vec::new()),
        });
        Ok(Self { core, inbound })
    }

    pub fn server_id(&self) -> ServerId {
        self.core.local_id
    }

    pub fn kind(&self) -> PeerKind {
        self.core.kind
    }

    /// This server as its neighbours see it.
    pub fn info(&self) -> PeerInfo {
        self.core.registry.local()
    }

    pub fn assured_timeout(&self) -> Duration {
        self.core.coordinator.assured_timeout()
    }

    /// Run a replication session over `link`.
    pub fn attach(&self, link: Arc<dyn SessionLink>) {
        if self.core.shutdown.load(Ordering::SeqCst) {
            link.close();
            return;
        }
        let events: Arc<dyn SessionEvents> = self.core.clone();
        let (_handle, join) = spawn_session(
            link,
            self.core.start_msg(),
            events,
            self.core.shutdown.clone(),
        );
        self.core
            .joins
            .lock()
            .expect("replica joins lock poisoned")
            .push(join);
    }

    /// Connect two in-process replicas with a channel link.
    pub fn connect(&self, other: &Replica) {
        let (ours, theirs) = ChannelLink::pair();
        self.attach(Arc::new(ours));
        other.attach(Arc::new(theirs));
    }

    /// Originate a change with the configured assured default.
    pub fn write(&self, payload: impl Into<Bytes>) -> crate::Result<Completion> {
        self.write_with(payload, self.core.default_request, self.assured_timeout())
    }

    /// Originate a change with an explicit assured request and wait budget.
    pub fn write_with(
        &self,
        payload: impl Into<Bytes>,
        assured: Option<AssuredRequest>,
        timeout: Duration,
    ) -> crate::Result<Completion> {
        let core = &self.core;
        let csn = core.generator.next();
        let update = UpdateEnvelope::new(csn, payload).with_assured(assured);
        core.changelog.append(&update)?;
        core.state.lock().expect("server state lock poisoned").update(&csn);
        tracing::debug!(csn = %csn, mode = ?update.mode(), "local change");

        let completion = core.coordinator.submit(update, timeout);
        if completion.is_timed_out() {
            tracing::warn!(
                csn = %csn,
                missing = ?completion.failed_server_ids(),
                "assured update timed out"
            );
        }
        Ok(completion)
    }

    /// Received updates waiting for replay. Directory servers only.
    pub fn inbound(&self) -> &Receiver<InboundUpdate> {
        &self.inbound
    }

    /// Replay received updates on a dedicated thread until shutdown.
    pub fn spawn_replayer<F>(&self, mut replay: F) -> JoinHandle<()>
    where
        F: FnMut(&UpdateEnvelope) -> Result<(), ReplayError> + Send + 'static,
    {
        let inbound = self.inbound.clone();
        let shutdown = self.core.shutdown.clone();
        thread::spawn(move || {
            while !shutdown.load(Ordering::SeqCst) {
                match inbound.recv_timeout(REPLAY_POLL) {
                    Ok(update) => {
                        let result = replay(update.update());
                        update.finish(result);
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
    }

    pub fn server_state(&self) -> ServerState {
        self.core
            .state
            .lock()
            .expect("server state lock poisoned")
            .clone()
    }

    pub fn monitor(&self) -> &Arc<AssuredMonitor> {
        &self.core.monitor
    }

    pub fn registry(&self) -> &Arc<TopologyRegistry> {
        &self.core.registry
    }

    /// Status of `peer` as currently known here.
    pub fn peer_status(&self, peer: ServerId) -> Option<PeerStatus> {
        self.core.registry.peer(peer).map(|info| info.status)
    }

    pub fn session_count(&self) -> usize {
        self.core.sessions.len()
    }

    /// Block until `check` holds or `timeout` passes.
    pub fn wait_until(&self, timeout: Duration, check: impl Fn(&Replica) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if check(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(WAIT_POLL);
        }
    }

    /// Block until at least `count` remote servers are known.
    pub fn wait_for_peers(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |replica| replica.core.registry.len() >= count)
    }

    /// Announce that this server is being reinitialised.
    pub fn begin_full_update(&self) {
        self.core.announce_local_status(PeerStatus::FullUpdate);
    }

    pub fn end_full_update(&self) {
        self.core.announce_local_status(PeerStatus::Normal);
    }

    /// Close every session, release pending waits and join session threads.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("server_id", &self.core.local_id)
            .field("kind", &self.core.kind)
            .field("sessions", &self.core.sessions.len())
            .finish_non_exhaustive()
    }
}

struct ReplicaCore {
    local_id: ServerId,
    kind: PeerKind,
    window_size: u32,
    default_request: Option<AssuredRequest>,
    generator: CsnGenerator,
    state: Mutex<ServerState>,
    changelog: Arc<dyn Changelog>,
    registry: Arc<TopologyRegistry>,
    status: StatusMonitor,
    sessions: Arc<SessionTable>,
    coordinator: Coordinator,
    monitor: Arc<AssuredMonitor>,
    inbound_tx: Sender<InboundUpdate>,
    shutdown: Arc<AtomicBool>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicaCore {
    fn start_msg(&self) -> StartMsg {
        let local = self.registry.local();
        StartMsg {
            protocol_version: PROTOCOL_VERSION_V1,
            server_id: local.server_id,
            kind: local.kind,
            group_id: local.group_id,
            generation_id: local.generation_id,
            server_state: self
                .state
                .lock()
                .expect("server state lock poisoned")
                .clone(),
            window_size: self.window_size,
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(server_id = %self.local_id, "replica shutting down");
        for (_, handle) in self.sessions.handles() {
            handle.close();
        }
        self.coordinator.shutdown();
        let joins = std::mem::take(&mut *self.joins.lock().expect("replica joins lock poisoned"));
        for join in joins {
            if join.join().is_err() {
                tracing::error!("replication session thread panicked");
            }
        }
    }

    /// Send every neighbour its view of the topology.
    fn broadcast_topology(&self) {
        if self.is_shutting_down() {
            return;
        }
        for (peer, handle) in self.sessions.handles() {
            let Some(info) = self.registry.peer(peer) else {
                continue;
            };
            let snapshot: TopologyMsg = self.registry.snapshot_for(&info);
            if let Err(err) = handle.send_topology(snapshot) {
                tracing::debug!(peer = %peer, "topology not sent: {err}");
            }
        }
    }

    fn announce_local_status(&self, status: PeerStatus) {
        if !self.registry.set_local_status(status) {
            return;
        }
        tracing::info!(server_id = %self.local_id, status = %status, "local status changed");
        let msg = ChangeStatusMsg {
            server_id: self.local_id,
            status,
        };
        for (peer, handle) in self.sessions.handles() {
            if let Err(err) = handle.send_status(msg) {
                tracing::debug!(peer = %peer, "status not sent: {err}");
            }
        }
        self.broadcast_topology();
    }

    fn on_transition(&self, transition: StatusTransition) {
        tracing::info!(
            peer = %transition.peer,
            from = %transition.from,
            to = %transition.to,
            "peer status changed"
        );
        metrics::peer_status_changed(transition.peer, transition.to);
        self.broadcast_topology();
    }

    /// A directory server answers safe-read updates from writers in its
    /// scope, and only while it is itself `Normal`.
    fn answers_safe_read(&self, update: &UpdateEnvelope, source: Option<&PeerInfo>) -> bool {
        if update.mode() != Some(AssuredMode::SafeRead) {
            return false;
        }
        let local = self.registry.local();
        if local.status != PeerStatus::Normal {
            return false;
        }
        // Scope is the writer's, which is the update's origin.
        let origin = self
            .registry
            .peer(update.csn.server_id())
            .or_else(|| source.cloned());
        origin.is_some_and(|peer| peer.in_scope(local.group_id, local.generation_id))
    }

    /// Neighbours a relay forwards `update` to. Updates from a directory
    /// server fan out to every other neighbour; updates from another relay
    /// only go down to directly attached directory servers.
    fn forward_targets(&self, from: ServerId, source_kind: PeerKind, origin: ServerId) -> Vec<ServerId> {
        self.registry
            .direct_peers()
            .into_iter()
            .filter(|peer| peer.server_id != from && peer.server_id != origin)
            .filter(|peer| source_kind == PeerKind::Ds || peer.kind == PeerKind::Ds)
            .map(|peer| peer.server_id)
            .collect()
    }

    fn deliver_local(
        &self,
        from: ServerId,
        update: UpdateEnvelope,
        source: Option<&PeerInfo>,
        handle: &SessionHandle,
    ) {
        let ack_to = self.answers_safe_read(&update, source).then_some(from);
        let inbound = InboundUpdate {
            update,
            source: from,
            ack_to,
            local_id: self.local_id,
            session: handle.clone(),
            monitor: self.monitor.clone(),
            received: Instant::now(),
            finished: false,
        };
        if self.inbound_tx.send(inbound).is_err() {
            tracing::debug!(peer = %from, "replay queue closed");
        }
    }
}

impl SessionEvents for ReplicaCore {
    fn established(&self, peer: &StartMsg, handle: &SessionHandle) {
        let info = peer.describe();
        let server_id = info.server_id;
        if let Some(previous) = self.sessions.insert(server_id, handle.clone()) {
            tracing::warn!(peer = %server_id, "replacing existing session");
            previous.close();
        }
        self.registry.register(info);

        match self.changelog.changes_after(&peer.server_state) {
            Ok(changes) => {
                let missing: Vec<_> = changes
                    .into_iter()
                    .filter(|update| update.csn.server_id() != server_id)
                    .collect();
                if !missing.is_empty() {
                    tracing::info!(peer = %server_id, count = missing.len(), "resending missed changes");
                }
                for update in missing {
                    if handle.send_update(update).is_err() {
                        break;
                    }
                }
            }
            Err(err) => tracing::warn!(peer = %server_id, "cannot read missed changes: {err}"),
        }

        self.broadcast_topology();
    }

    fn update_received(&self, from: ServerId, update: UpdateEnvelope, handle: &SessionHandle) {
        let csn = update.csn;
        metrics::repl_updates_in(1);
        self.monitor.record_received(update.mode());
        self.generator.observe(&csn);
        let source = self.registry.peer(from);

        let fresh = match self.changelog.append(&update) {
            Ok(fresh) => fresh,
            Err(err) => {
                tracing::warn!(csn = %csn, "changelog append failed: {err}");
                !self
                    .state
                    .lock()
                    .expect("server state lock poisoned")
                    .covers(&csn)
            }
        };
        self.state
            .lock()
            .expect("server state lock poisoned")
            .update(&csn);

        if !fresh {
            tracing::debug!(peer = %from, csn = %csn, "duplicate update");
            let answer = match self.kind {
                PeerKind::Rs => update.is_assured(),
                PeerKind::Ds => self.answers_safe_read(&update, source.as_ref()),
            };
            if answer && let Err(err) = handle.send_ack(AckRecord::positive(csn)) {
                tracing::debug!(peer = %from, "duplicate ack not sent: {err}");
            }
            handle.consumed();
            return;
        }

        match self.kind {
            PeerKind::Ds => self.deliver_local(from, update, source.as_ref(), handle),
            PeerKind::Rs => {
                let source_kind = source.map(|peer| peer.kind).unwrap_or(PeerKind::Ds);
                let targets = self.forward_targets(from, source_kind, csn.server_id());
                self.coordinator.relay(&update, from, &targets);
                handle.consumed();
            }
        }
    }

    fn ack_received(&self, from: ServerId, ack: AckRecord) {
        self.coordinator.on_ack(from, ack);
    }

    fn topology_received(&self, from: ServerId, msg: TopologyMsg) {
        let change = self.registry.apply_snapshot(from, &msg);
        if !change.is_empty() {
            tracing::debug!(
                peer = %from,
                added = ?change.added,
                removed = ?change.removed,
                updated = ?change.updated,
                "topology changed"
            );
            self.broadcast_topology();
        }
    }

    fn status_received(&self, from: ServerId, msg: ChangeStatusMsg) {
        if msg.server_id == self.local_id {
            if self.registry.set_local_status(msg.status) {
                tracing::info!(peer = %from, status = %msg.status, "local status set by peer");
                self.broadcast_topology();
            }
            return;
        }
        if msg.server_id != from {
            tracing::debug!(peer = %from, about = %msg.server_id, "ignoring relayed status");
            return;
        }
        let transition = match msg.status {
            PeerStatus::FullUpdate => self.status.begin_full_update(from),
            PeerStatus::Normal | PeerStatus::Degraded => self.status.end_full_update(from),
        };
        if let Some(transition) = transition {
            self.on_transition(transition);
        }
    }

    fn backlog_changed(&self, peer: ServerId, backlog: usize) {
        metrics::set_repl_peer_backlog(peer, backlog);
        let Some(transition) = self.status.observe_backlog(peer, backlog) else {
            return;
        };
        if let Some(handle) = self.sessions.get(peer) {
            let msg = ChangeStatusMsg {
                server_id: peer,
                status: transition.to,
            };
            if let Err(err) = handle.send_status(msg) {
                tracing::debug!(peer = %peer, "status not sent: {err}");
            }
        }
        self.on_transition(transition);
    }

    fn closed(&self, peer: Option<ServerId>, handle: &SessionHandle) {
        let Some(peer) = peer else {
            return;
        };
        if !self.sessions.remove_if(peer, handle) {
            return;
        }
        tracing::info!(peer = %peer, "replication session closed");
        self.status.forget(peer);
        let gone = self.registry.deregister(peer);
        if !gone.is_empty() {
            self.broadcast_topology();
        }
    }
}
