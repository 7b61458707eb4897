//! Assured update model: envelopes, ack records and completions.

use std::collections::BTreeSet;
use std::fmt;
use std::num::NonZeroU8;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::csn::Csn;
use super::error::CoreError;
use super::identity::ServerId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssuredMode {
    /// A number of relays hold the change.
    SafeData,
    /// Every live reader in scope has replayed the change.
    SafeRead,
}

impl AssuredMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AssuredMode::SafeData => "safe_data",
            AssuredMode::SafeRead => "safe_read",
        }
    }
}

impl fmt::Display for AssuredMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an assured update asks of the mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AssuredRequest {
    SafeData { level: NonZeroU8 },
    SafeRead,
}

impl AssuredRequest {
    pub fn safe_data(level: u8) -> Result<Self, CoreError> {
        NonZeroU8::new(level)
            .map(|level| AssuredRequest::SafeData { level })
            .ok_or(CoreError::InvalidSafeDataLevel { level })
    }

    pub fn mode(&self) -> AssuredMode {
        match self {
            AssuredRequest::SafeData { .. } => AssuredMode::SafeData,
            AssuredRequest::SafeRead => AssuredMode::SafeRead,
        }
    }

    /// Safe-data level, `None` for safe-read.
    pub fn level(&self) -> Option<u8> {
        match self {
            AssuredRequest::SafeData { level } => Some(level.get()),
            AssuredRequest::SafeRead => None,
        }
    }
}

/// A replicated change. Immutable once sent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEnvelope {
    pub csn: Csn,
    pub payload: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assured: Option<AssuredRequest>,
}

impl UpdateEnvelope {
    pub fn new(csn: Csn, payload: impl Into<Bytes>) -> Self {
        Self {
            csn,
            payload: payload.into(),
            assured: None,
        }
    }

    pub fn with_assured(mut self, assured: Option<AssuredRequest>) -> Self {
        self.assured = assured;
        self
    }

    pub fn is_assured(&self) -> bool {
        self.assured.is_some()
    }

    pub fn mode(&self) -> Option<AssuredMode> {
        self.assured.as_ref().map(AssuredRequest::mode)
    }

    /// Copy of this update with the assured request stripped. The payload
    /// buffer is shared.
    pub fn not_assured(&self) -> Self {
        Self {
            csn: self.csn,
            payload: self.payload.clone(),
            assured: None,
        }
    }
}

/// Acknowledgment for one CSN, possibly folded from several peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRecord {
    pub csn: Csn,
    #[serde(default)]
    pub has_timeout: bool,
    #[serde(default)]
    pub has_wrong_status: bool,
    #[serde(default)]
    pub has_replay_error: bool,
    #[serde(default)]
    pub failed_server_ids: BTreeSet<ServerId>,
}

impl AckRecord {
    pub fn positive(csn: Csn) -> Self {
        Self {
            csn,
            has_timeout: false,
            has_wrong_status: false,
            has_replay_error: false,
            failed_server_ids: BTreeSet::new(),
        }
    }

    pub fn replay_error(csn: Csn, server_id: ServerId) -> Self {
        Self {
            has_replay_error: true,
            failed_server_ids: BTreeSet::from([server_id]),
            ..Self::positive(csn)
        }
    }

    /// Local synthesis for peers that never answered.
    pub fn timeout(csn: Csn, missing: impl IntoIterator<Item = ServerId>) -> Self {
        Self {
            has_timeout: true,
            failed_server_ids: missing.into_iter().collect(),
            ..Self::positive(csn)
        }
    }

    /// No failure flag and no failed server.
    pub fn is_positive(&self) -> bool {
        !self.has_timeout
            && !self.has_wrong_status
            && !self.has_replay_error
            && self.failed_server_ids.is_empty()
    }

    /// Fold `other` into `self`: flags are OR-ed, failed servers unioned.
    pub fn merge(&mut self, other: &AckRecord) {
        self.has_timeout |= other.has_timeout;
        self.has_wrong_status |= other.has_wrong_status;
        self.has_replay_error |= other.has_replay_error;
        self.failed_server_ids
            .extend(other.failed_server_ids.iter().copied());
    }

    pub fn merged<'a>(csn: Csn, acks: impl IntoIterator<Item = &'a AckRecord>) -> Self {
        let mut merged = AckRecord::positive(csn);
        for ack in acks {
            merged.merge(ack);
        }
        merged
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionState {
    Acked,
    TimedOut,
}

/// Definite outcome of a submitted update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub csn: Csn,
    /// `None` for a send-and-forget update.
    pub mode: Option<AssuredMode>,
    pub state: CompletionState,
    pub report: AckRecord,
    /// Peers whose answers were counted toward the quorum.
    pub required: BTreeSet<ServerId>,
    pub elapsed: Duration,
}

impl Completion {
    pub fn immediate(csn: Csn, mode: Option<AssuredMode>) -> Self {
        Self {
            csn,
            mode,
            state: CompletionState::Acked,
            report: AckRecord::positive(csn),
            required: BTreeSet::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_acked(&self) -> bool {
        self.state == CompletionState::Acked
    }

    pub fn is_timed_out(&self) -> bool {
        self.state == CompletionState::TimedOut
    }

    /// Acked, but some peer reported a wrong status, a replay error or a
    /// downstream timeout.
    pub fn is_degraded(&self) -> bool {
        self.is_acked() && !self.report.is_positive()
    }

    pub fn failed_server_ids(&self) -> &BTreeSet<ServerId> {
        &self.report.failed_server_ids
    }
}
