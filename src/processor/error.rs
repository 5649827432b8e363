//! Processor registration and parsing errors.

use thiserror::Error;

use crate::request::ProcessorId;

/// Errors raised by the processor registry or a processor's parse step.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// A processor could not turn the body into its domain object.
    #[error("processor {processor_id} failed to parse body: {message}")]
    Parse {
        /// Processor that failed.
        processor_id: ProcessorId,
        /// Description of the failure.
        message: String,
    },

    /// The request never had a processor id set.
    #[error("request has no processor id set (created at {origin})")]
    UnsetId {
        /// Where the request was built.
        origin: String,
    },

    /// No processor is registered for the id.
    #[error("no processor registered for id {processor_id} (request created at {origin})")]
    NotRegistered {
        /// Requested id.
        processor_id: ProcessorId,
        /// Where the request was built.
        origin: String,
    },

    /// A different processor type already owns the id.
    #[error("processor id {processor_id} is owned by {existing}, cannot register {incoming}")]
    Collision {
        /// Contested id.
        processor_id: ProcessorId,
        /// Type name of the current owner.
        existing: &'static str,
        /// Type name of the rejected processor.
        incoming: &'static str,
    },

    /// The id is already registered to a processor of the same type.
    #[error("processor id {processor_id} is already registered")]
    AlreadyRegistered {
        /// Duplicate id.
        processor_id: ProcessorId,
    },

    /// Synchronous extraction was requested from an asynchronous-only processor.
    #[error("processor {processor_id} does not support synchronous extraction")]
    SyncUnsupported {
        /// Processor id.
        processor_id: ProcessorId,
    },
}

impl ProcessorError {
    /// Creates a parse error.
    #[must_use]
    pub fn parse(processor_id: ProcessorId, message: impl Into<String>) -> Self {
        Self::Parse {
            processor_id,
            message: message.into(),
        }
    }
}
