//! Per-source CSN watermarks.
//!
//! A `ServerState` records, for every source server, the newest CSN this
//! replica has seen from it. Entries only move forward.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::csn::Csn;
use super::identity::ServerId;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerState {
    inner: BTreeMap<ServerId, Csn>,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `csn` for its source. Returns `true` if the state advanced;
    /// an older or equal CSN is a no-op.
    pub fn update(&mut self, csn: &Csn) -> bool {
        match self.inner.get(&csn.server_id()) {
            Some(current) if csn <= current => false,
            _ => {
                self.inner.insert(csn.server_id(), *csn);
                true
            }
        }
    }

    /// True if this state already holds `csn` or something newer from the
    /// same source.
    pub fn covers(&self, csn: &Csn) -> bool {
        self.inner
            .get(&csn.server_id())
            .is_some_and(|current| current >= csn)
    }

    pub fn get(&self, source: ServerId) -> Option<&Csn> {
        self.inner.get(&source)
    }

    /// Sources on which `self` is behind `other`.
    pub fn diff(&self, other: &ServerState) -> BTreeSet<ServerId> {
        other
            .inner
            .iter()
            .filter(|(source, theirs)| match self.inner.get(source) {
                Some(ours) => *theirs > ours,
                None => true,
            })
            .map(|(source, _)| *source)
            .collect()
    }

    /// Fold every entry of `other` into `self`.
    pub fn merge(&mut self, other: &ServerState) {
        for csn in other.inner.values() {
            self.update(csn);
        }
    }

    /// Newest CSN across all sources.
    pub fn max_csn(&self) -> Option<Csn> {
        self.inner.values().max().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ServerId, &Csn)> {
        self.inner.iter()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl FromIterator<Csn> for ServerState {
    fn from_iter<I: IntoIterator<Item = Csn>>(iter: I) -> Self {
        let mut state = ServerState::new();
        for csn in iter {
            state.update(&csn);
        }
        state
    }
}
