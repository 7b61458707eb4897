//! Replication metrics emission helpers.
//!
//! These helpers emit structured metrics via tracing by default. A test sink can
//! be installed to capture emissions in unit tests.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::core::{AssuredMode, Completion, PeerStatus, ServerId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(u64),
    Histogram(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricLabel {
    pub key: &'static str,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
    pub labels: Vec<MetricLabel>,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        match event.value {
            MetricValue::Counter(value) => {
                tracing::info!(
                    target: "metrics",
                    metric = event.name,
                    value,
                    labels = ?event.labels
                );
            }
            MetricValue::Gauge(value) => {
                tracing::info!(
                    target: "metrics",
                    metric = event.name,
                    value,
                    labels = ?event.labels
                );
            }
            MetricValue::Histogram(value) => {
                tracing::info!(
                    target: "metrics",
                    metric = event.name,
                    value,
                    labels = ?event.labels
                );
            }
        }
    }
}

static METRIC_SINK: std::sync::OnceLock<RwLock<Arc<dyn MetricSink>>> =
    std::sync::OnceLock::new();

fn sink() -> Arc<dyn MetricSink> {
    METRIC_SINK
        .get_or_init(|| RwLock::new(Arc::new(TracingSink)))
        .read()
        .expect("metrics sink lock poisoned")
        .clone()
}

pub fn set_sink(sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    *lock.write().expect("metrics sink lock poisoned") = sink;
}

fn emit(name: &'static str, value: MetricValue, labels: Vec<MetricLabel>) {
    sink().record(MetricEvent { name, value, labels });
}

fn duration_ms(duration: Duration) -> u64 {
    let ms = duration.as_millis();
    u64::try_from(ms).unwrap_or(u64::MAX)
}

fn peer_label(peer: ServerId) -> MetricLabel {
    MetricLabel {
        key: "peer",
        value: peer.to_string(),
    }
}

fn mode_label(mode: AssuredMode) -> MetricLabel {
    MetricLabel {
        key: "mode",
        value: mode.as_str().to_string(),
    }
}

pub fn assured_completed(completion: &Completion) {
    let Some(mode) = completion.mode else {
        return;
    };
    let name = if completion.is_timed_out() {
        "assured_timeout"
    } else if completion.is_degraded() {
        "assured_ack_degraded"
    } else {
        "assured_ack_ok"
    };
    emit(name, MetricValue::Counter(1), vec![mode_label(mode)]);
    emit(
        "assured_wait_duration",
        MetricValue::Histogram(duration_ms(completion.elapsed)),
        vec![mode_label(mode)],
    );
}

pub fn repl_updates_out(peer: ServerId, count: usize) {
    emit(
        "repl_updates_out",
        MetricValue::Counter(count as u64),
        vec![peer_label(peer)],
    );
}

pub fn repl_updates_in(count: usize) {
    emit("repl_updates_in", MetricValue::Counter(count as u64), Vec::new());
}

pub fn replay_ok(duration: Duration) {
    emit("replay_ok", MetricValue::Counter(1), Vec::new());
    emit(
        "replay_duration",
        MetricValue::Histogram(duration_ms(duration)),
        Vec::new(),
    );
}

pub fn replay_err(duration: Duration) {
    emit("replay_err", MetricValue::Counter(1), Vec::new());
    emit(
        "replay_duration",
        MetricValue::Histogram(duration_ms(duration)),
        Vec::new(),
    );
}

pub fn set_repl_peer_backlog(peer: ServerId, backlog: usize) {
    emit(
        "repl_peer_backlog",
        MetricValue::Gauge(backlog as u64),
        vec![peer_label(peer)],
    );
}

pub fn peer_status_changed(peer: ServerId, status: PeerStatus) {
    emit(
        "repl_peer_status_change",
        MetricValue::Counter(1),
        vec![
            peer_label(peer),
            MetricLabel {
                key: "status",
                value: status.as_str().to_string(),
            },
        ],
    );
}
