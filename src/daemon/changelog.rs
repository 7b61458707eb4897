//! Change log collaborator.
//!
//! The replication core only needs to persist an ordered change and to
//! read back the changes a peer is missing. Storage format is the
//! implementor's business.

use std::collections::BTreeMap;
use std::sync::RwLock;

use thiserror::Error;

use crate::core::{Csn, ServerState, UpdateEnvelope};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChangelogError {
    #[error("changelog unavailable: {reason}")]
    Unavailable { reason: String },
}

pub trait Changelog: Send + Sync {
    /// Persist `update`. Returns `false` if the CSN was already stored.
    fn append(&self, update: &UpdateEnvelope) -> Result<bool, ChangelogError>;

    /// Changes not covered by `state`, in CSN order.
    fn changes_after(&self, state: &ServerState) -> Result<Vec<UpdateEnvelope>, ChangelogError>;

    /// Newest stored CSN per source.
    fn server_state(&self) -> ServerState;
}

/// In-memory change log.
#[derive(Debug, Default)]
pub struct MemoryChangelog {
    entries: RwLock<BTreeMap<Csn, UpdateEnvelope>>,
}

impl MemoryChangelog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("changelog lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, csn: &Csn) -> Option<UpdateEnvelope> {
        self.entries
            .read()
            .expect("changelog lock poisoned")
            .get(csn)
            .cloned()
    }
}

impl Changelog for MemoryChangelog {
    fn append(&self, update: &UpdateEnvelope) -> Result<bool, ChangelogError> {
        let mut entries = self.entries.write().expect("changelog lock poisoned");
        if entries.contains_key(&update.csn) {
            return Ok(false);
        }
        entries.insert(update.csn, update.not_assured());
        Ok(true)
    }

    fn changes_after(&self, state: &ServerState) -> Result<Vec<UpdateEnvelope>, ChangelogError> {
        Ok(self
            .entries
            .read()
            .expect("changelog lock poisoned")
            .values()
            .filter(|update| !state.covers(&update.csn))
            .cloned()
            .collect())
    }

    fn server_state(&self) -> ServerState {
        self.entries
            .read()
            .expect("changelog lock poisoned")
            .keys()
            .copied()
            .collect()
    }
}
