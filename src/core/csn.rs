//! Change sequence numbers.
//!
//! A CSN is `(timestamp_ms, seq, server_id)`. Ordering is by timestamp, then
//! sequence; the server id only breaks ties between otherwise equal stamps
//! from different sources.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::{CoreError, InvalidCsn};
use super::identity::ServerId;

const TIMESTAMP_HEX: usize = 16;
const SERVER_ID_HEX: usize = 4;
const SEQ_HEX: usize = 8;
const CSN_HEX_LEN: usize = TIMESTAMP_HEX + SERVER_ID_HEX + SEQ_HEX;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Csn {
    timestamp_ms: u64,
    seq: u32,
    server_id: ServerId,
}

impl Csn {
    pub const fn new(timestamp_ms: u64, seq: u32, server_id: ServerId) -> Self {
        Self {
            timestamp_ms,
            seq,
            server_id,
        }
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// True when `self` was stamped strictly after `other`, ignoring origin.
    pub fn is_newer_than(&self, other: &Csn) -> bool {
        (self.timestamp_ms, self.seq) > (other.timestamp_ms, other.seq)
    }
}

impl PartialOrd for Csn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Csn {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp_ms
            .cmp(&other.timestamp_ms)
            .then_with(|| self.seq.cmp(&other.seq))
            .then_with(|| self.server_id.cmp(&other.server_id))
    }
}

impl fmt::Debug for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Csn({}.{}@{})",
            self.timestamp_ms, self.seq, self.server_id
        )
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:04x}{:08x}",
            self.timestamp_ms,
            self.server_id.get(),
            self.seq
        )
    }
}

impl FromStr for Csn {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.len() != CSN_HEX_LEN {
            return Err(InvalidCsn {
                raw: raw.to_string(),
                reason: format!("expected {CSN_HEX_LEN} hex digits, got {}", raw.len()),
            }
            .into());
        }
        if !raw.is_ascii() {
            return Err(InvalidCsn {
                raw: raw.to_string(),
                reason: "non-ascii input".into(),
            }
            .into());
        }

        let (ts, rest) = raw.split_at(TIMESTAMP_HEX);
        let (sid, seq) = rest.split_at(SERVER_ID_HEX);
        let invalid = |field: &str| -> CoreError {
            InvalidCsn {
                raw: raw.to_string(),
                reason: format!("invalid {field}"),
            }
            .into()
        };

        let timestamp_ms = u64::from_str_radix(ts, 16).map_err(|_| invalid("timestamp"))?;
        let server_id = u16::from_str_radix(sid, 16).map_err(|_| invalid("server id"))?;
        let seq = u32::from_str_radix(seq, 16).map_err(|_| invalid("sequence"))?;

        Ok(Csn::new(timestamp_ms, seq, ServerId::new(server_id)))
    }
}

impl Serialize for Csn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Csn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
