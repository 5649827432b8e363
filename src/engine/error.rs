//! Engine-level errors.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::cache::CacheError;
use crate::config::{ConfigError, MAX_POOL_SIZE};
use crate::processor::ProcessorError;
use crate::request::RequestError;
use crate::transport::TransportError;

/// Errors surfaced by the request engine and its facade.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The request descriptor was invalid.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// The network attempt failed after retries.
    #[error(transparent)]
    Transport(Arc<TransportError>),

    /// Processor registration, lookup or parsing failed.
    #[error(transparent)]
    Processor(#[from] ProcessorError),

    /// The cache could not be opened.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The connectivity pre-check failed and no cached copy was available.
    #[error("network unreachable and no cached copy available")]
    Offline,

    /// The request was cancelled before it completed.
    #[error("request cancelled")]
    Cancelled,

    /// The engine binding was not ready within the bound.
    #[error("engine binding not ready after {waited:?}")]
    BindingTimeout {
        /// How long the caller waited.
        waited: Duration,
    },

    /// The binding was torn down before the request ran.
    #[error("engine disconnected before the request ran")]
    Disconnected,

    /// A blocking call was made from inside the engine's runtime.
    #[error(
        "blocking engine call issued from inside an async runtime; await run_sync instead"
    )]
    Reentrant,

    /// The worker pool no longer accepts work.
    #[error("worker pool is closed")]
    PoolClosed,

    /// A worker task panicked.
    #[error("worker task panicked: {message}")]
    WorkerPanicked {
        /// Panic detail.
        message: String,
    },

    /// The worker pool size is out of range.
    #[error("invalid worker pool size {size}: must be between 1 and {MAX_POOL_SIZE}")]
    InvalidPoolSize {
        /// Rejected size.
        size: usize,
    },
}

impl EngineError {
    /// Wraps a shared transport error.
    #[must_use]
    pub fn transport(error: Arc<TransportError>) -> Self {
        Self::Transport(error)
    }

    /// Returns the transport error, if this is one.
    #[must_use]
    pub fn as_transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(error) => Some(error.as_ref()),
            _ => None,
        }
    }
}
