use thiserror::Error;

use crate::config::ConfigError;
use crate::core::CoreError;
use crate::daemon::changelog::ChangelogError;
use crate::daemon::repl::{SessionError, TransportError};

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred (locally or remotely).
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the capability errors. Assured waits never produce
/// one: their outcome is always a `Completion`.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Changelog(#[from] ChangelogError),

    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Core(e) => e.transience(),
            Error::Config(ConfigError::Read { .. } | ConfigError::Write { .. }) => {
                Transience::Unknown
            }
            Error::Config(_) => Transience::Permanent,
            Error::Transport(_) => Transience::Retryable,
            Error::Session(SessionError::PeerStopped) => Transience::Retryable,
            Error::Session(_) => Transience::Permanent,
            Error::Changelog(_) => Transience::Retryable,
            Error::Json(_) => Transience::Permanent,
            Error::Io(_) => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Core(e) => e.effect(),
            Error::Config(ConfigError::Write { .. }) => Effect::Unknown,
            Error::Config(_) => Effect::None,
            Error::Transport(_) | Error::Session(_) => Effect::Unknown,
            Error::Changelog(_) | Error::Json(_) => Effect::None,
            Error::Io(_) => Effect::Unknown,
        }
    }
}
