//! Session links.
//!
//! A `SessionLink` moves typed messages between two nodes. The in-memory
//! `ChannelLink` backs tests and simulations; a network transport only has
//! to implement the same trait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

use super::proto::ReplMessage;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("link closed")]
    Closed,
    #[error("receive timed out")]
    Timeout,
    #[error("peer {peer} is not connected")]
    NotConnected { peer: crate::core::ServerId },
}

pub trait SessionLink: Send + Sync {
    fn send(&self, msg: ReplMessage) -> Result<(), TransportError>;

    fn recv_timeout(&self, timeout: Duration) -> Result<ReplMessage, TransportError>;

    /// Close both directions. Idempotent.
    fn close(&self);
}

/// One end of an in-memory duplex link.
pub struct ChannelLink {
    tx: Mutex<Option<Sender<ReplMessage>>>,
    rx: Receiver<ReplMessage>,
    closed: Arc<AtomicBool>,
}

impl ChannelLink {
    pub fn pair() -> (ChannelLink, ChannelLink) {
        let (a_tx, b_rx) = crossbeam::channel::unbounded();
        let (b_tx, a_rx) = crossbeam::channel::unbounded();
        let closed = Arc::new(AtomicBool::new(false));
        (
            ChannelLink {
                tx: Mutex::new(Some(a_tx)),
                rx: a_rx,
                closed: closed.clone(),
            },
            ChannelLink {
                tx: Mutex::new(Some(b_tx)),
                rx: b_rx,
                closed,
            },
        )
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl SessionLink for ChannelLink {
    fn send(&self, msg: ReplMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let tx = self.tx.lock().expect("link sender lock poisoned");
        match tx.as_ref() {
            Some(tx) => tx.send(msg).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<ReplMessage, TransportError> {
        if self.is_closed() && self.rx.is_empty() {
            return Err(TransportError::Closed);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(msg),
            Err(RecvTimeoutError::Timeout) => {
                if self.is_closed() {
                    Err(TransportError::Closed)
                } else {
                    Err(TransportError::Timeout)
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping our sender wakes the far end's receiver.
        self.tx.lock().expect("link sender lock poisoned").take();
    }
}
