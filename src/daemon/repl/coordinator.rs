//! Assured update coordinator.
//!
//! For every outgoing update the coordinator decides which peers must
//! answer, sends the update to every next hop (assured only toward hops
//! that answer for a required peer), and settles the wait from acks,
//! departures, the shared deadline timer or shutdown. Local submitters
//! block on a per-CSN channel; relayed waits answer the upstream hop with a
//! merged ack.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crossbeam::channel::RecvTimeoutError;

use crate::core::{
    AckRecord, AssuredRequest, Completion, CompletionState, Csn, GenerationId, GroupId, PeerInfo,
    ServerId, UpdateEnvelope,
};
use crate::daemon::metrics;
use crate::daemon::monitor::AssuredMonitor;

use super::pending::{PendingAcks, Registered, Registration, Resolution, Waiter};
use super::timer::DeadlineTimer;
use super::topology::{TopologyObserver, TopologyView};
use super::transport::TransportError;

/// Slack on top of the assured timeout before a submitter stops trusting
/// the timer thread and expires its own wait.
const SUBMIT_GRACE: Duration = Duration::from_secs(1);

/// Outbound seam: where the coordinator puts updates and acks.
pub trait UpdateSink: Send + Sync {
    fn send_update(&self, peer: ServerId, update: UpdateEnvelope) -> Result<(), TransportError>;

    fn send_ack(&self, peer: ServerId, ack: AckRecord) -> Result<(), TransportError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Scope {
    pub group: GroupId,
    pub generation: GenerationId,
}

impl Scope {
    pub fn of(peer: &PeerInfo) -> Self {
        Self {
            group: peer.group_id,
            generation: peer.generation_id,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub local: PeerInfo,
    pub assured_timeout: Duration,
}

#[derive(Debug, Default)]
struct DispatchPlan {
    quorum: Option<usize>,
    required: Vec<(ServerId, ServerId)>,
    wrong_status: Vec<ServerId>,
    assured_hops: BTreeSet<ServerId>,
}

struct Inner {
    local: PeerInfo,
    assured_timeout: Duration,
    topology: Arc<dyn TopologyView>,
    sink: Arc<dyn UpdateSink>,
    pending: Mutex<PendingAcks>,
    monitor: Arc<AssuredMonitor>,
}

pub struct Coordinator {
    inner: Arc<Inner>,
    timer: DeadlineTimer,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        topology: Arc<dyn TopologyView>,
        sink: Arc<dyn UpdateSink>,
        monitor: Arc<AssuredMonitor>,
    ) -> Self {
        let inner = Arc::new(Inner {
            local: config.local,
            assured_timeout: config.assured_timeout,
            topology,
            sink,
            pending: Mutex::new(PendingAcks::new()),
            monitor,
        });
        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let timer = DeadlineTimer::spawn(move |csn, epoch| {
            if let Some(inner) = weak.upgrade() {
                inner.expire(csn, epoch);
            }
        });
        Self { inner, timer }
    }

    pub fn assured_timeout(&self) -> Duration {
        self.inner.assured_timeout
    }

    /// Observer to subscribe to the topology registry so departures
    /// shrink in-flight required sets.
    pub fn observer(&self) -> Arc<dyn TopologyObserver> {
        Arc::new(DepartureObserver {
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Send a locally originated update and, if assured, block until it
    /// settles or `timeout` passes. Always returns a definite completion.
    pub fn submit(&self, update: UpdateEnvelope, timeout: Duration) -> Completion {
        let inner = &self.inner;
        let started = Instant::now();
        let csn = update.csn;
        inner.monitor.record_submitted(update.mode());

        let targets = inner.next_hops(&[csn.server_id()]);
        let Some(request) = update.assured else {
            inner.dispatch(&update, &targets, &BTreeSet::new());
            return Completion::immediate(csn, None);
        };

        let plan = inner.plan(request, Scope::of(&inner.local), &targets, false);
        let (tx, rx) = crossbeam::channel::bounded(1);
        let registered = inner.register(&update, request, &plan, Waiter::Local(tx));
        inner.dispatch(&update, &targets, &plan.assured_hops);

        let epoch = match registered {
            Registered::Resolved(resolution) => {
                inner.deliver(resolution);
                None
            }
            Registered::Waiting { epoch } => {
                self.timer.schedule(Instant::now() + timeout, csn, epoch);
                tracing::debug!(
                    csn = %csn,
                    mode = %request.mode(),
                    required = plan.required.len(),
                    "waiting for assured acks"
                );
                Some(epoch)
            }
        };

        match rx.recv_timeout(timeout + SUBMIT_GRACE) {
            Ok(completion) => completion,
            Err(RecvTimeoutError::Timeout) => {
                if let Some(epoch) = epoch {
                    inner.expire(csn, epoch);
                }
                rx.try_recv()
                    .unwrap_or_else(|_| abandoned(csn, request, started))
            }
            Err(RecvTimeoutError::Disconnected) => abandoned(csn, request, started),
        }
    }

    /// Forward an update received from `source` to `targets`. Assured
    /// updates are awaited downstream and answered to `source` with one
    /// merged ack.
    pub fn relay(&self, update: &UpdateEnvelope, source: ServerId, targets: &[ServerId]) {
        let inner = &self.inner;
        let Some(request) = update.assured else {
            inner.dispatch(update, targets, &BTreeSet::new());
            return;
        };

        // Scope follows the originating server; the neighbour that relayed
        // the update may sit in another group.
        let scope = inner
            .topology
            .peer(update.csn.server_id())
            .or_else(|| inner.topology.peer(source))
            .map(|peer| Scope::of(&peer))
            .unwrap_or_else(|| Scope::of(&inner.local));
        let plan = inner.plan(request, scope, targets, true);
        let waiter = Waiter::Upstream { hop: source };
        let registered = inner.register(update, request, &plan, waiter);
        inner.dispatch(update, targets, &plan.assured_hops);

        match registered {
            Registered::Resolved(resolution) => inner.deliver(resolution),
            Registered::Waiting { epoch } => {
                self.timer
                    .schedule(Instant::now() + inner.assured_timeout, update.csn, epoch);
            }
        }
    }

    /// An ack arrived from neighbour `from`.
    pub fn on_ack(&self, from: ServerId, ack: AckRecord) {
        self.inner.on_ack(from, ack);
    }

    pub fn peers_departed(&self, gone: &[ServerId]) {
        self.inner.peers_departed(gone);
    }

    pub fn in_flight(&self) -> usize {
        self.inner.pending.lock().expect("pending acks lock poisoned").len()
    }

    /// Release every wait as timed out and stop the timer. Later submits
    /// return immediately.
    pub fn shutdown(&self) {
        let released = self
            .inner
            .pending
            .lock()
            .expect("pending acks lock poisoned")
            .close();
        if !released.is_empty() {
            tracing::info!(released = released.len(), "releasing assured waits on shutdown");
        }
        for resolution in released {
            self.inner.deliver(resolution);
        }
        self.timer.shutdown();
    }
}

impl Inner {
    /// Directly connected peers, minus `exclude`.
    fn next_hops(&self, exclude: &[ServerId]) -> Vec<ServerId> {
        self.topology
            .direct_peers()
            .into_iter()
            .map(|peer| peer.server_id)
            .filter(|id| !exclude.contains(id))
            .collect()
    }

    fn plan(
        &self,
        request: AssuredRequest,
        scope: Scope,
        targets: &[ServerId],
        relayed: bool,
    ) -> DispatchPlan {
        let quorum = request.level().map(|level| {
            // A relay already holds the change and counts toward the level.
            let level = usize::from(level);
            if relayed { level - 1 } else { level }
        });
        let mut plan = DispatchPlan {
            quorum,
            ..DispatchPlan::default()
        };
        if quorum == Some(0) {
            return plan;
        }

        let hops: BTreeSet<ServerId> = targets.iter().copied().collect();
        let eligibility = self
            .topology
            .eligible_peers(scope.group, scope.generation, request.mode());
        for peer in eligibility.eligible {
            if hops.contains(&peer.hop()) {
                plan.assured_hops.insert(peer.hop());
                plan.required.push((peer.server_id, peer.hop()));
            }
        }
        for peer in eligibility.wrong_status {
            if hops.contains(&peer.hop()) {
                plan.wrong_status.push(peer.server_id);
            }
        }
        plan
    }

    fn register(
        &self,
        update: &UpdateEnvelope,
        request: AssuredRequest,
        plan: &DispatchPlan,
        waiter: Waiter,
    ) -> Registered {
        let registration = Registration {
            csn: update.csn,
            mode: request.mode(),
            quorum: plan.quorum,
            required: plan.required.clone(),
            wrong_status: plan.wrong_status.clone(),
            waiter,
        };
        self.pending
            .lock()
            .expect("pending acks lock poisoned")
            .register(registration)
    }

    fn dispatch(&self, update: &UpdateEnvelope, targets: &[ServerId], assured_hops: &BTreeSet<ServerId>) {
        for hop in targets {
            let assured = update.is_assured() && assured_hops.contains(hop);
            let outgoing = if assured {
                update.clone()
            } else {
                update.not_assured()
            };
            match self.sink.send_update(*hop, outgoing) {
                Ok(()) => {
                    self.monitor.record_update_sent(*hop, assured);
                    metrics::repl_updates_out(*hop, 1);
                }
                Err(err) => {
                    tracing::warn!(peer = %hop, csn = %update.csn, "update send failed: {err}");
                }
            }
        }
    }

    fn on_ack(&self, from: ServerId, ack: AckRecord) {
        self.monitor.record_ack_received(from);
        let outcome = self
            .pending
            .lock()
            .expect("pending acks lock poisoned")
            .on_ack(from, &ack);
        match outcome {
            None => {
                tracing::debug!(peer = %from, csn = %ack.csn, "ack for settled or unknown csn");
            }
            Some(outcome) => {
                if let Some(resolution) = outcome.resolution {
                    self.deliver(resolution);
                }
            }
        }
    }

    fn peers_departed(&self, gone: &[ServerId]) {
        let resolutions = self
            .pending
            .lock()
            .expect("pending acks lock poisoned")
            .peers_departed(gone);
        for resolution in resolutions {
            self.deliver(resolution);
        }
    }

    fn expire(&self, csn: Csn, epoch: u64) {
        let resolution = self
            .pending
            .lock()
            .expect("pending acks lock poisoned")
            .expire(csn, epoch);
        if let Some(resolution) = resolution {
            tracing::warn!(
                csn = %csn,
                missing = ?resolution.completion.report.failed_server_ids,
                "assured update timed out"
            );
            self.deliver(resolution);
        }
    }

    fn deliver(&self, resolution: Resolution) {
        let Resolution { waiter, completion } = resolution;
        if completion.report.has_replay_error {
            tracing::warn!(
                csn = %completion.csn,
                failed = ?completion.report.failed_server_ids,
                "replay error reported for assured update"
            );
        }
        match waiter {
            Waiter::Local(tx) => {
                self.monitor.record_completion(&completion);
                metrics::assured_completed(&completion);
                let _ = tx.send(completion);
            }
            Waiter::Upstream { hop } => {
                let ack = completion.report;
                tracing::debug!(
                    upstream = %hop,
                    csn = %ack.csn,
                    positive = ack.is_positive(),
                    "answering relayed assured update"
                );
                if let Err(err) = self.sink.send_ack(hop, ack) {
                    tracing::warn!(peer = %hop, "ack send failed: {err}");
                }
            }
        }
    }
}

/// Completion for a submitter whose wait could not be settled normally.
fn abandoned(csn: Csn, request: AssuredRequest, started: Instant) -> Completion {
    let mut completion = Completion::immediate(csn, Some(request.mode()));
    completion.state = CompletionState::TimedOut;
    completion.report.has_timeout = true;
    completion.elapsed = started.elapsed();
    completion
}

struct DepartureObserver {
    inner: Weak<Inner>,
}

impl TopologyObserver for DepartureObserver {
    fn peers_departed(&self, gone: &[ServerId]) {
        if let Some(inner) = self.inner.upgrade() {
            inner.peers_departed(gone);
        }
    }
}
