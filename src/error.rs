use thiserror::Error;

use crate::config::ConfigError;
use crate::core::{CoreError, EntityError};
use crate::daemon::collab::StoreError;
use crate::daemon::repl::ReplError;
use crate::daemon::retirement::RetirementError;

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
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Entity(#[from] EntityError),

    #[error(transparent)]
    Repl(#[from] ReplError),

    #[error(transparent)]
    Retirement(#[from] RetirementError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Core(e) => e.transience(),
            Error::Entity(e) => e.transience(),
            Error::Repl(e) => e.transience(),
            Error::Retirement(e) => e.transience(),
            Error::Store(e) => e.transience(),
            Error::Config(_) => Transience::Permanent,
            Error::Io(_) => Transience::Retryable,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Core(e) => e.effect(),
            Error::Entity(e) => e.effect(),
            Error::Repl(e) => e.effect(),
            Error::Retirement(e) => e.effect(),
            Error::Store(e) => e.effect(),
            Error::Config(_) => Effect::None,
            Error::Io(_) => Effect::Unknown,
        }
    }
}
