//! Reply processors, their registry, and dispatch.
//!
//! A [`Processor`] turns a reply body or a cache hit into a typed domain
//! object and wraps it in a [`Delivery`]. Every processor owns one integer id
//! used both for registry lookup and to tag its deliveries.
//!
//! Processors that can also hand the parsed value straight back to a
//! synchronous caller implement [`SyncProcessor`] and return `Some(self)` from
//! [`Processor::as_sync`].
//!
//! Dispatch runs the parse step inside `catch_unwind`, so a panicking
//! processor yields a failed delivery instead of tearing down the task.

mod builtin;
mod error;
mod registry;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tracing::warn;

pub use builtin::{BytesProcessor, JsonProcessor, TextProcessor};
pub use error::ProcessorError;
pub use registry::ProcessorRegistry;

use crate::cache::{CachedObject, CachedValue};
use crate::delivery::{Delivery, Payload};
use crate::engine::EngineError;
use crate::reply::{BodyStream, Reply, ReplyAdapter, ReplyBody};
use crate::request::{ProcessorId, Request};

/// Payload produced for file-download replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    /// Final path on disk.
    pub path: PathBuf,
    /// Bytes written.
    pub bytes: u64,
    /// Lowercase hex SHA-256 of the file.
    pub sha256: String,
}

/// Payload produced for streamed replies. The stream can be taken once.
pub struct StreamedBody(Mutex<Option<BodyStream>>);

impl StreamedBody {
    /// Takes the body stream; `None` once taken.
    pub fn take(&self) -> Option<BodyStream> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Turns replies and cache hits into delivery messages.
pub trait Processor: Send + Sync + 'static {
    /// Registry id; also tags every delivery this processor produces.
    fn id(&self) -> ProcessorId;

    /// Parses a buffered body (live or cached) into the domain object.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Parse`] if the bytes are not valid for this processor.
    fn parse_bytes(&self, bytes: &Bytes) -> Result<Payload, ProcessorError>;

    /// Parses a live reply. Download replies yield a [`DownloadedFile`] and
    /// streamed replies a [`StreamedBody`].
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Parse`] if the body cannot be parsed.
    fn parse_reply(&self, reply: &Reply) -> Result<Payload, ProcessorError> {
        match &reply.body {
            ReplyBody::Bytes(bytes) => self.parse_bytes(bytes),
            ReplyBody::File {
                path,
                bytes,
                sha256,
            } => Ok(Arc::new(DownloadedFile {
                path: path.clone(),
                bytes: *bytes,
                sha256: sha256.clone(),
            })),
            ReplyBody::Stream(_) => reply
                .take_stream()
                .map(|stream| Arc::new(StreamedBody(Mutex::new(Some(stream)))) as Payload)
                .ok_or_else(|| ProcessorError::parse(self.id(), "reply stream already taken")),
        }
    }

    /// Rebuilds the domain object from a cache hit without a network round trip.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Parse`] if cached bytes cannot be parsed.
    fn parse_cached(&self, cached: &CachedObject) -> Result<Payload, ProcessorError> {
        match &cached.value {
            CachedValue::Object(payload) => Ok(Arc::clone(payload)),
            CachedValue::Bytes(bytes) => self.parse_bytes(bytes),
        }
    }

    /// Network path: one delivery for a completed or failed reply.
    fn on_reply(&self, adapter: &ReplyAdapter) -> Delivery {
        let request_id = adapter.request().id();
        let meta = adapter
            .reply()
            .map(|reply| (Some(reply.status), Some(reply.headers.clone())))
            .unwrap_or_default();

        let delivery = match (adapter.is_ok(), adapter.reply(), adapter.error()) {
            (true, Some(reply), _) => match self.parse_reply(reply) {
                Ok(payload) => Delivery::success(self.id(), request_id, payload),
                Err(error) => Delivery::failure(self.id(), request_id, error.into()),
            },
            (_, _, Some(error)) => Delivery::failure(
                self.id(),
                request_id,
                EngineError::transport(Arc::clone(error)),
            ),
            _ => Delivery::failure(
                self.id(),
                request_id,
                ProcessorError::parse(self.id(), "reply missing").into(),
            ),
        };
        delivery.with_reply_meta(meta.0, meta.1)
    }

    /// Cache-hit path: one delivery flagged as served from cache.
    fn on_cache_hit(&self, request: &Request, cached: &CachedObject) -> Delivery {
        match self.parse_cached(cached) {
            Ok(payload) => Delivery::success(self.id(), request.id(), payload),
            Err(error) => Delivery::failure(self.id(), request.id(), error.into()),
        }
        .from_cache()
    }

    /// Whether a successful reply should be written to the persistent cache.
    fn should_persist(&self, _reply: &Reply) -> bool {
        true
    }

    /// Synchronous capability, if implemented.
    fn as_sync(&self) -> Option<&dyn SyncProcessor> {
        None
    }

    /// Concrete type name, used to detect id collisions between processor types.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Processors that can return parsed values directly to a synchronous caller.
pub trait SyncProcessor: Processor {
    /// Same transformation as [`Processor::parse_reply`], returned directly.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Parse`] if the adapter has no reply or the body is invalid.
    fn extract(&self, adapter: &ReplyAdapter) -> Result<Payload, ProcessorError> {
        let reply = adapter
            .reply()
            .ok_or_else(|| ProcessorError::parse(self.id(), "reply missing"))?;
        self.parse_reply(reply)
    }

    /// Rebuilds the domain object from a FILE- or MEMORY-tagged cache hit.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Parse`] if cached bytes cannot be parsed.
    fn extract_cached(&self, cached: &CachedObject) -> Result<Payload, ProcessorError> {
        self.parse_cached(cached)
    }
}

fn panic_message(processor_id: ProcessorId, panic: &(dyn std::any::Any + Send)) -> ProcessorError {
    let detail = panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    warn!(processor_id, detail = %detail, "processor panicked during dispatch");
    ProcessorError::parse(processor_id, format!("processor panicked: {detail}"))
}

/// Routes a completed reply to `processor`, converting panics into a failed delivery.
pub fn dispatch_reply(processor: &dyn Processor, adapter: &ReplyAdapter) -> Delivery {
    catch_unwind(AssertUnwindSafe(|| processor.on_reply(adapter))).unwrap_or_else(|panic| {
        let error = panic_message(processor.id(), panic.as_ref());
        Delivery::failure(processor.id(), adapter.request().id(), error.into())
    })
}

/// Routes a cache hit to `processor`, converting panics into a failed delivery.
pub fn dispatch_cached(
    processor: &dyn Processor,
    request: &Request,
    cached: &CachedObject,
) -> Delivery {
    catch_unwind(AssertUnwindSafe(|| processor.on_cache_hit(request, cached))).unwrap_or_else(
        |panic| {
            let error = panic_message(processor.id(), panic.as_ref());
            Delivery::failure(processor.id(), request.id(), error.into()).from_cache()
        },
    )
}

/// Synchronous extraction from a reply, converting panics into a parse error.
///
/// # Errors
///
/// Returns [`ProcessorError::SyncUnsupported`] for asynchronous-only
/// processors, or the parse error.
pub fn extract_reply(
    processor: &dyn Processor,
    adapter: &ReplyAdapter,
) -> Result<Payload, ProcessorError> {
    let sync = processor
        .as_sync()
        .ok_or(ProcessorError::SyncUnsupported {
            processor_id: processor.id(),
        })?;
    catch_unwind(AssertUnwindSafe(|| sync.extract(adapter)))
        .unwrap_or_else(|panic| Err(panic_message(processor.id(), panic.as_ref())))
}

/// Synchronous extraction from a cache hit, converting panics into a parse error.
///
/// # Errors
///
/// Returns [`ProcessorError::SyncUnsupported`] for asynchronous-only
/// processors, or the parse error.
pub fn extract_cached(
    processor: &dyn Processor,
    cached: &CachedObject,
) -> Result<Payload, ProcessorError> {
    let sync = processor
        .as_sync()
        .ok_or(ProcessorError::SyncUnsupported {
            processor_id: processor.id(),
        })?;
    catch_unwind(AssertUnwindSafe(|| sync.extract_cached(cached)))
        .unwrap_or_else(|panic| Err(panic_message(processor.id(), panic.as_ref())))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use reqwest::header::HeaderMap;

    use super::*;
    use crate::cache::Provenance;
    use crate::transport::TransportError;

    struct Exploding;

    impl Processor for Exploding {
        fn id(&self) -> ProcessorId {
            66
        }

        fn parse_bytes(&self, _bytes: &Bytes) -> Result<Payload, ProcessorError> {
            panic!("boom");
        }
    }

    fn request() -> Request {
        Request::builder("https://example.com/x").processor(1).build().unwrap()
    }

    fn ok_adapter(body: &'static [u8]) -> ReplyAdapter {
        let reply = Reply {
            status: 200,
            headers: HeaderMap::new(),
            body: ReplyBody::Bytes(Bytes::from_static(body)),
            final_url: "https://example.com/x".to_string(),
        };
        ReplyAdapter::from_reply(request(), reply, 1)
    }

    #[test]
    fn test_dispatch_reply_success_carries_status_and_payload() {
        let processor = TextProcessor::new(1);
        let delivery = dispatch_reply(&processor, &ok_adapter(b"hello"));
        assert!(delivery.success);
        assert_eq!(delivery.processor_id, 1);
        assert_eq!(delivery.status, Some(200));
        assert_eq!(delivery.payload_as::<String>().unwrap(), "hello");
        assert!(!delivery.from_cache);
    }

    #[test]
    fn test_dispatch_reply_failure_carries_transport_error() {
        let processor = BytesProcessor::new(1);
        let adapter = ReplyAdapter::failed(request(), TransportError::timeout("https://example.com/x"), 3);
        let delivery = dispatch_reply(&processor, &adapter);
        assert!(!delivery.success);
        assert!(matches!(delivery.error.as_deref(), Some(EngineError::Transport(_))));
        assert_eq!(delivery.status, None);
    }

    #[test]
    fn test_dispatch_reply_panic_becomes_failed_delivery() {
        let delivery = dispatch_reply(&Exploding, &ok_adapter(b"x"));
        assert!(!delivery.success);
        assert_eq!(delivery.processor_id, 66);
        let msg = delivery.error.unwrap().to_string();
        assert!(msg.contains("boom"), "got: {msg}");
    }

    #[test]
    fn test_dispatch_cached_marks_from_cache() {
        let processor = TextProcessor::new(1);
        let cached = CachedObject::file(Bytes::from_static(b"cached"));
        let delivery = dispatch_cached(&processor, &request(), &cached);
        assert!(delivery.success && delivery.from_cache);
        assert_eq!(delivery.payload_as::<String>().unwrap(), "cached");
    }

    #[test]
    fn test_dispatch_cached_panic_is_contained() {
        let cached = CachedObject::file(Bytes::from_static(b"x"));
        let delivery = dispatch_cached(&Exploding, &request(), &cached);
        assert!(!delivery.success);
        assert!(delivery.from_cache);
    }

    #[test]
    fn test_memory_object_is_returned_without_reparse() {
        let processor = JsonProcessor::<serde_json::Value>::new(1);
        let object: Payload = Arc::new(serde_json::json!({"cached": true}));
        let cached = CachedObject {
            provenance: Provenance::Memory,
            value: CachedValue::Object(Arc::clone(&object)),
            tag: Some(1),
        };
        let payload = extract_cached(&processor, &cached).unwrap();
        assert!(Arc::ptr_eq(&payload, &object));
    }

    #[test]
    fn test_extract_requires_sync_capability() {
        let err = extract_reply(&Exploding, &ok_adapter(b"x")).unwrap_err();
        assert!(matches!(err, ProcessorError::SyncUnsupported { processor_id: 66 }));
    }

    #[test]
    fn test_extract_reply_parses_directly() {
        let processor = TextProcessor::new(1);
        let payload = extract_reply(&processor, &ok_adapter(b"direct")).unwrap();
        assert_eq!(payload.downcast_ref::<String>().unwrap(), "direct");
    }

    #[test]
    fn test_download_reply_yields_downloaded_file() {
        let processor = BytesProcessor::new(1);
        let reply = Reply {
            status: 200,
            headers: HeaderMap::new(),
            body: ReplyBody::File {
                path: PathBuf::from("/tmp/out.bin"),
                bytes: 4,
                sha256: "ab".to_string(),
            },
            final_url: "https://example.com/x".to_string(),
        };
        let payload = processor.parse_reply(&reply).unwrap();
        let file = payload.downcast_ref::<DownloadedFile>().unwrap();
        assert_eq!(file.bytes, 4);
    }
}
