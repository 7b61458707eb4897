//! In-process replication topologies.
//!
//! A `Cluster` is one writing directory server attached to the first of a
//! full mesh of relays, plus reader directory servers spread round-robin
//! over the relays. Everything runs over channel links in this process.
//! Used by the `simulate` command and by integration tests.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::ReplicationConfig;
use crate::core::{AssuredRequest, Completion, PeerKind, ServerId};
use crate::daemon::{MemoryChangelog, MonitorSnapshot, ReplayError, Replica, SystemClock};

pub const WRITER_ID: ServerId = ServerId::new(1);
const FIRST_READER_ID: u16 = 2;
const FIRST_RELAY_ID: u16 = 100;

/// How a reader replays what it receives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReaderBehavior {
    #[default]
    Replay,
    /// Replay always fails.
    Fail,
    /// Never replays; received updates pile up.
    Stall,
}

#[derive(Clone, Debug)]
pub struct ClusterSpec {
    pub relays: usize,
    /// One entry per reader.
    pub readers: Vec<ReaderBehavior>,
    pub replay_delay: Duration,
    /// Template for every server; id and kind are filled in per server.
    pub base: ReplicationConfig,
    /// Overrides the writer's assured timeout.
    pub writer_timeout: Option<Duration>,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            relays: 1,
            readers: Vec::new(),
            replay_delay: Duration::ZERO,
            base: ReplicationConfig::default(),
            writer_timeout: None,
        }
    }
}

impl ClusterSpec {
    pub fn with_readers(mut self, behaviors: impl IntoIterator<Item = ReaderBehavior>) -> Self {
        self.readers = behaviors.into_iter().collect();
        self
    }

    pub fn with_relays(mut self, relays: usize) -> Self {
        self.relays = relays;
        self
    }

    pub fn reader_id(index: usize) -> ServerId {
        ServerId::new(FIRST_READER_ID + index as u16)
    }

    pub fn relay_id(index: usize) -> ServerId {
        ServerId::new(FIRST_RELAY_ID + index as u16)
    }

    fn server(&self, server_id: ServerId, kind: PeerKind) -> ReplicationConfig {
        let mut config = self.base.clone();
        config.server_id = server_id;
        config.kind = kind;
        config
    }
}

pub struct Cluster {
    writer: Replica,
    relays: Vec<Replica>,
    readers: Vec<Replica>,
    replayers: Vec<JoinHandle<()>>,
}

impl Cluster {
    pub fn start(spec: &ClusterSpec) -> crate::Result<Self> {
        let relays = (0..spec.relays.max(1))
            .map(|index| spawn_replica(spec.server(ClusterSpec::relay_id(index), PeerKind::Rs)))
            .collect::<crate::Result<Vec<_>>>()?;
        for (index, relay) in relays.iter().enumerate() {
            for other in &relays[index + 1..] {
                relay.connect(other);
            }
        }

        let mut writer_config = spec.server(WRITER_ID, PeerKind::Ds);
        if let Some(timeout) = spec.writer_timeout {
            writer_config.assured_timeout_ms = Some(timeout.as_millis() as u64);
        }
        let writer = spawn_replica(writer_config)?;
        writer.connect(&relays[0]);

        let mut readers = Vec::with_capacity(spec.readers.len());
        let mut replayers = Vec::new();
        for (index, behavior) in spec.readers.iter().enumerate() {
            let reader = spawn_replica(spec.server(ClusterSpec::reader_id(index), PeerKind::Ds))?;
            reader.connect(&relays[index % relays.len()]);
            let delay = spec.replay_delay;
            match behavior {
                ReaderBehavior::Replay => replayers.push(reader.spawn_replayer(move |_| {
                    pause(delay);
                    Ok(())
                })),
                ReaderBehavior::Fail => replayers.push(reader.spawn_replayer(move |update| {
                    pause(delay);
                    Err(ReplayError::new(format!("entry {} rejected", update.csn)))
                })),
                ReaderBehavior::Stall => {}
            }
            readers.push(reader);
        }

        Ok(Self {
            writer,
            relays,
            readers,
            replayers,
        })
    }

    pub fn writer(&self) -> &Replica {
        &self.writer
    }

    pub fn relay(&self, index: usize) -> &Replica {
        &self.relays[index]
    }

    pub fn reader(&self, index: usize) -> &Replica {
        &self.readers[index]
    }

    pub fn relays(&self) -> &[Replica] {
        &self.relays
    }

    pub fn readers(&self) -> &[Replica] {
        &self.readers
    }

    /// Every server other than the writer.
    pub fn remote_count(&self) -> usize {
        self.relays.len() + self.readers.len()
    }

    /// Wait until the writer knows every other server.
    pub fn wait_converged(&self, timeout: Duration) -> bool {
        let expected = self.remote_count();
        self.writer.wait_for_peers(expected, timeout)
    }

    /// Issue `count` writes from the writer, one after the other.
    pub fn run_writes(
        &self,
        count: usize,
        request: Option<AssuredRequest>,
        timeout: Duration,
    ) -> crate::Result<SimulationReport> {
        let started = Instant::now();
        let mut report = SimulationReport::default();
        for index in 0..count {
            let payload = format!("cn=entry-{index},dc=example,dc=com");
            let completion = self.writer.write_with(payload, request, timeout)?;
            report.record(&completion);
        }
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        report.monitor = self.writer.monitor().snapshot();
        Ok(report)
    }

    pub fn shutdown(self) {
        self.writer.shutdown();
        for relay in &self.relays {
            relay.shutdown();
        }
        for reader in &self.readers {
            reader.shutdown();
        }
        for replayer in self.replayers {
            if replayer.join().is_err() {
                tracing::error!("replay thread panicked");
            }
        }
    }
}

fn spawn_replica(config: ReplicationConfig) -> crate::Result<Replica> {
    Replica::new(
        &config,
        Arc::new(SystemClock),
        Arc::new(MemoryChangelog::new()),
    )
}

fn pause(delay: Duration) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
}

/// Outcome of a batch of writes, seen from the writer.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SimulationReport {
    pub writes: usize,
    pub acked: usize,
    pub degraded: usize,
    pub timed_out: usize,
    pub max_latency_ms: u64,
    pub elapsed_ms: u64,
    pub monitor: MonitorSnapshot,
}

impl SimulationReport {
    fn record(&mut self, completion: &Completion) {
        self.writes += 1;
        if completion.is_timed_out() {
            self.timed_out += 1;
        } else if completion.is_degraded() {
            self.degraded += 1;
        } else {
            self.acked += 1;
        }
        self.max_latency_ms = self
            .max_latency_ms
            .max(completion.elapsed.as_millis() as u64);
    }
}
