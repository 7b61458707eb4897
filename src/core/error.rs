//! Core error types.

use thiserror::Error;

use crate::error::{Effect, Transience};

/// A CSN text form that could not be parsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("csn `{raw}` is invalid: {reason}")]
pub struct InvalidCsn {
    pub raw: String,
    pub reason: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidCsn(#[from] InvalidCsn),
    #[error("safe data level must be at least 1, got {level}")]
    InvalidSafeDataLevel { level: u8 },
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        // Core errors are pure input failures.
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}
