//! Error types for reconciler.

use thiserror::Error;

use crate::controller::ControllerState;
use crate::model::Action;

/// Opaque error returned by user handlers and cache implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    /// The event claims the object exists but the cache has no entry for it.
    #[error("object {key} does not exist in {action} event")]
    InconsistentState { key: String, action: Action },

    #[error("handler failed: {0}")]
    Handler(#[source] BoxError),

    #[error("handler panicked while syncing {key}")]
    HandlerPanicked { key: String },

    #[error("cache lookup failed: {0}")]
    Cache(String),

    #[error("timed out waiting for caches to sync")]
    SyncTimeout,

    /// Retry threshold exceeded; the key has been dropped from the queue.
    #[error("dropping {key} out of the queue after {retries} retries: {source}")]
    GiveUp {
        key: String,
        retries: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid controller transition: {from} -> {to}")]
    InvalidTransition {
        from: ControllerState,
        to: ControllerState,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InconsistentState { .. } => "inconsistent_state",
            Error::Handler(_) => "handler",
            Error::HandlerPanicked { .. } => "handler_panicked",
            Error::Cache(_) => "cache",
            Error::SyncTimeout => "sync_timeout",
            Error::GiveUp { .. } => "give_up",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
