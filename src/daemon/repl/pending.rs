//! Per-CSN pending acknowledgment table.
//!
//! Each in-flight assured update owns one record with a slot per required
//! peer. A slot is answered by the peer's hop: a direct neighbour answers
//! for itself, a relay answers for every required peer reached through it.
//! The table is pure bookkeeping; callers own locking, timers and delivery.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use crossbeam::channel::Sender;

use crate::core::{AckRecord, AssuredMode, Completion, CompletionState, Csn, ServerId};

/// Who is told when a record resolves.
#[derive(Clone, Debug)]
pub enum Waiter {
    /// A local submitter blocked on the channel.
    Local(Sender<Completion>),
    /// The neighbour that relayed the update to us; answered with an ack.
    Upstream { hop: ServerId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Waiting,
    Acked,
    Failed,
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    hop: ServerId,
    state: SlotState,
}

/// Everything needed to start waiting on one CSN.
#[derive(Clone, Debug)]
pub struct Registration {
    pub csn: Csn,
    pub mode: AssuredMode,
    /// Number of positive answers wanted. `None` means every slot must
    /// answer, positively or not.
    pub quorum: Option<usize>,
    /// `(peer, hop)` for every required peer.
    pub required: Vec<(ServerId, ServerId)>,
    /// Peers excluded for a wrong status; reported, never awaited.
    pub wrong_status: Vec<ServerId>,
    pub waiter: Waiter,
}

#[derive(Debug)]
pub struct Resolution {
    pub waiter: Waiter,
    pub completion: Completion,
}

#[derive(Debug)]
pub enum Registered {
    Waiting { epoch: u64 },
    Resolved(Resolution),
}

#[derive(Debug)]
struct PendingRecord {
    mode: AssuredMode,
    quorum: Option<usize>,
    slots: BTreeMap<ServerId, Slot>,
    report: AckRecord,
    waiter: Waiter,
    started: Instant,
    epoch: u64,
}

impl PendingRecord {
    fn target(&self) -> usize {
        match self.quorum {
            Some(quorum) => quorum.min(self.slots.len()),
            None => self.slots.len(),
        }
    }

    fn count(&self, state: SlotState) -> usize {
        self.slots.values().filter(|slot| slot.state == state).count()
    }

    /// Outcome once nothing more can change it. A quorum record whose
    /// slots all answered without reaching the level has timed out.
    fn settled(&self) -> Option<CompletionState> {
        if self.count(SlotState::Acked) >= self.target() {
            return Some(CompletionState::Acked);
        }
        if self.count(SlotState::Waiting) > 0 {
            return None;
        }
        Some(match self.quorum {
            Some(_) => CompletionState::TimedOut,
            None => CompletionState::Acked,
        })
    }

    fn waiting(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.state == SlotState::Waiting)
            .map(|(peer, _)| *peer)
    }

    fn resolve(mut self, csn: Csn, state: CompletionState) -> Resolution {
        if state == CompletionState::TimedOut {
            let missing: Vec<ServerId> = self.waiting().collect();
            self.report.merge(&AckRecord::timeout(csn, missing));
        }
        let completion = Completion {
            csn,
            mode: Some(self.mode),
            state,
            report: self.report,
            required: self.slots.keys().copied().collect(),
            elapsed: self.started.elapsed(),
        };
        Resolution {
            waiter: self.waiter,
            completion,
        }
    }
}

#[derive(Debug, Default)]
pub struct PendingAcks {
    records: HashMap<Csn, PendingRecord>,
    next_epoch: u64,
    closed: bool,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `registration.csn`. Resolves immediately when nothing
    /// needs to be awaited, and with a timeout once the table is closed.
    pub fn register(&mut self, registration: Registration) -> Registered {
        let Registration {
            csn,
            mode,
            quorum,
            required,
            wrong_status,
            waiter,
        } = registration;

        let mut report = AckRecord::positive(csn);
        if !wrong_status.is_empty() {
            report.has_wrong_status = true;
            report.failed_server_ids.extend(wrong_status);
        }

        self.next_epoch += 1;
        let record = PendingRecord {
            mode,
            quorum,
            slots: required
                .into_iter()
                .map(|(peer, hop)| {
                    (
                        peer,
                        Slot {
                            hop,
                            state: SlotState::Waiting,
                        },
                    )
                })
                .collect(),
            report,
            waiter,
            started: Instant::now(),
            epoch: self.next_epoch,
        };

        if self.closed {
            return Registered::Resolved(record.resolve(csn, CompletionState::TimedOut));
        }
        if let Some(state) = record.settled() {
            return Registered::Resolved(record.resolve(csn, state));
        }

        let epoch = record.epoch;
        if let Some(stale) = self.records.insert(csn, record) {
            tracing::warn!(csn = %csn, epoch = stale.epoch, "replaced pending record for csn");
        }
        Registered::Waiting { epoch }
    }

    /// Apply an ack received from neighbour `hop`. Returns `None` when the
    /// ack answers nothing still waiting.
    pub fn on_ack(&mut self, hop: ServerId, ack: &AckRecord) -> Option<AckOutcome> {
        let record = self.records.get_mut(&ack.csn)?;

        let mut answered = Vec::new();
        for (peer, slot) in record.slots.iter_mut() {
            if slot.hop != hop || slot.state != SlotState::Waiting {
                continue;
            }
            slot.state = if ack.failed_server_ids.contains(peer) {
                SlotState::Failed
            } else {
                SlotState::Acked
            };
            answered.push(*peer);
        }
        if answered.is_empty() {
            return None;
        }
        record.report.merge(ack);

        let resolution = match record.settled() {
            Some(state) => self
                .records
                .remove(&ack.csn)
                .map(|record| record.resolve(ack.csn, state)),
            None => None,
        };
        Some(AckOutcome {
            answered,
            resolution,
        })
    }

    /// Drop departed peers from every record's required set and resolve the
    /// records that no longer need to wait.
    pub fn peers_departed(&mut self, gone: &[ServerId]) -> Vec<Resolution> {
        let gone: BTreeSet<ServerId> = gone.iter().copied().collect();
        let mut settled = Vec::new();
        for (csn, record) in self.records.iter_mut() {
            let before = record.slots.len();
            record
                .slots
                .retain(|peer, slot| slot.state != SlotState::Waiting || !gone.contains(peer));
            if record.slots.len() != before
                && let Some(state) = record.settled()
            {
                settled.push((*csn, state));
            }
        }

        settled
            .into_iter()
            .filter_map(|(csn, state)| {
                self.records
                    .remove(&csn)
                    .map(|record| record.resolve(csn, state))
            })
            .collect()
    }

    /// Deadline for `csn` passed. Ignored if the record resolved meanwhile
    /// or was re-registered under a newer epoch.
    pub fn expire(&mut self, csn: Csn, epoch: u64) -> Option<Resolution> {
        if self.records.get(&csn)?.epoch != epoch {
            return None;
        }
        self.records
            .remove(&csn)
            .map(|record| record.resolve(csn, CompletionState::TimedOut))
    }

    /// Release every pending record as timed out and refuse new waits.
    pub fn close(&mut self) -> Vec<Resolution> {
        self.closed = true;
        self.records
            .drain()
            .map(|(csn, record)| record.resolve(csn, CompletionState::TimedOut))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn contains(&self, csn: &Csn) -> bool {
        self.records.contains_key(csn)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug)]
pub struct AckOutcome {
    /// Required peers this ack answered for.
    pub answered: Vec<ServerId>,
    pub resolution: Option<Resolution>,
}
