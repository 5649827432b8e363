//! Network replies and the adapter pairing them with their request.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures_util::stream::BoxStream;
use reqwest::header::HeaderMap;

use crate::request::Request;
use crate::transport::TransportError;

/// Live body stream for large-payload mode.
pub type BodyStream = BoxStream<'static, Result<Bytes, reqwest::Error>>;

/// Body of a [`Reply`].
pub enum ReplyBody {
    /// Fully buffered (and decompressed) body.
    Bytes(Bytes),
    /// Body committed to disk in file-download mode.
    File {
        /// Final path of the downloaded file.
        path: PathBuf,
        /// Bytes written.
        bytes: u64,
        /// Lowercase hex SHA-256 of the written bytes.
        sha256: String,
    },
    /// Unread body stream; the first processor to take it owns it.
    Stream(Mutex<Option<BodyStream>>),
}

impl fmt::Debug for ReplyBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::File { path, bytes, .. } => f
                .debug_struct("File")
                .field("path", path)
                .field("bytes", bytes)
                .finish_non_exhaustive(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Result of one network exchange.
#[derive(Debug)]
pub struct Reply {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: ReplyBody,
    /// URL that produced this reply after redirects.
    pub final_url: String,
}

impl Reply {
    /// Returns true for statuses handled as success: 2xx and 304.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status) || self.status == 304
    }

    /// Returns the buffered body, if the body was buffered.
    #[must_use]
    pub fn bytes(&self) -> Option<&Bytes> {
        match &self.body {
            ReplyBody::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Takes the live body stream. Returns `None` if not streaming or already taken.
    pub fn take_stream(&self) -> Option<BodyStream> {
        match &self.body {
            ReplyBody::Stream(slot) => slot.lock().unwrap_or_else(PoisonError::into_inner).take(),
            _ => None,
        }
    }
}

/// Outcome flag of a [`ReplyAdapter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Failed,
}

/// A request paired with its reply (if any) and outcome.
#[derive(Debug)]
pub struct ReplyAdapter {
    request: Request,
    reply: Option<Reply>,
    status: ReplyStatus,
    error: Option<Arc<TransportError>>,
    attempts: u32,
}

impl ReplyAdapter {
    /// Wraps a reply. Non-OK HTTP statuses become a failed adapter that keeps the reply.
    #[must_use]
    pub fn from_reply(request: Request, reply: Reply, attempts: u32) -> Self {
        if reply.is_ok() {
            Self {
                request,
                reply: Some(reply),
                status: ReplyStatus::Ok,
                error: None,
                attempts,
            }
        } else {
            let error = TransportError::http_status(reply.final_url.clone(), reply.status);
            Self {
                request,
                reply: Some(reply),
                status: ReplyStatus::Failed,
                error: Some(Arc::new(error)),
                attempts,
            }
        }
    }

    /// Builds a failed adapter with no reply.
    #[must_use]
    pub fn failed(request: Request, error: TransportError, attempts: u32) -> Self {
        Self {
            request,
            reply: None,
            status: ReplyStatus::Failed,
            error: Some(Arc::new(error)),
            attempts,
        }
    }

    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    #[must_use]
    pub fn reply(&self) -> Option<&Reply> {
        self.reply.as_ref()
    }

    #[must_use]
    pub fn status(&self) -> ReplyStatus {
        self.status
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    #[must_use]
    pub fn error(&self) -> Option<&Arc<TransportError>> {
        self.error.as_ref()
    }

    /// Total attempts made, including the first.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// HTTP status of the reply, if one was received.
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        self.reply.as_ref().map(|r| r.status)
    }
}
