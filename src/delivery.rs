//! Delivery messages and the sinks that carry them back to callers.
//!
//! A [`Delivery`] is the only way an asynchronous result leaves the engine.
//! Each request produces at most one.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use reqwest::header::HeaderMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::engine::EngineError;
use crate::request::{ProcessorId, RequestId};

/// Type-erased domain object produced by a processor.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Result message for one request.
#[derive(Clone)]
pub struct Delivery {
    /// Id of the processor that produced this message.
    pub processor_id: ProcessorId,
    /// Id of the request this message answers.
    pub request_id: RequestId,
    /// Whether the request produced a payload.
    pub success: bool,
    /// Processor output on success.
    pub payload: Option<Payload>,
    /// HTTP status of the live reply, if there was one.
    pub status: Option<u16>,
    /// Headers of the live reply, if there was one.
    pub headers: Option<HeaderMap>,
    /// Cause of failure.
    pub error: Option<Arc<EngineError>>,
    /// Whether the payload came from cache.
    pub from_cache: bool,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("processor_id", &self.processor_id)
            .field("request_id", &self.request_id)
            .field("success", &self.success)
            .field("has_payload", &self.payload.is_some())
            .field("status", &self.status)
            .field("error", &self.error)
            .field("from_cache", &self.from_cache)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    /// A successful delivery carrying `payload`.
    #[must_use]
    pub fn success(processor_id: ProcessorId, request_id: RequestId, payload: Payload) -> Self {
        Self {
            processor_id,
            request_id,
            success: true,
            payload: Some(payload),
            status: None,
            headers: None,
            error: None,
            from_cache: false,
        }
    }

    /// A failed delivery carrying `error`.
    #[must_use]
    pub fn failure(processor_id: ProcessorId, request_id: RequestId, error: EngineError) -> Self {
        Self {
            processor_id,
            request_id,
            success: false,
            payload: None,
            status: None,
            headers: None,
            error: Some(Arc::new(error)),
            from_cache: false,
        }
    }

    /// Attaches status and headers of the live reply.
    #[must_use]
    pub fn with_reply_meta(mut self, status: Option<u16>, headers: Option<HeaderMap>) -> Self {
        self.status = status;
        self.headers = headers;
        self
    }

    /// Marks the delivery as served from cache.
    #[must_use]
    pub fn from_cache(mut self) -> Self {
        self.from_cache = true;
        self
    }

    /// Downcasts the payload.
    #[must_use]
    pub fn payload_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.payload.as_ref()?.downcast_ref::<T>()
    }
}

/// Receiver of delivery messages.
///
/// `deliver` runs on an engine task; it must not block on engine results.
pub trait DeliverySink: Send + Sync {
    /// Accepts one delivery.
    fn deliver(&self, delivery: Delivery);
}

impl DeliverySink for UnboundedSender<Delivery> {
    fn deliver(&self, delivery: Delivery) {
        if self.send(delivery).is_err() {
            debug!("delivery receiver dropped");
        }
    }
}

/// Adapts a closure into a [`DeliverySink`].
pub struct CallbackSink<F>(pub F);

impl<F> DeliverySink for CallbackSink<F>
where
    F: Fn(Delivery) + Send + Sync,
{
    fn deliver(&self, delivery: Delivery) {
        (self.0)(delivery);
    }
}

/// Push-style download progress observer, called once per read chunk.
pub trait ProgressListener: Send + Sync {
    /// Reports cumulative bytes read and the expected total, if known.
    fn on_progress(&self, request_id: RequestId, bytes_read: u64, total: Option<u64>);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::request::Request;

    fn request_id() -> RequestId {
        Request::builder("https://example.com").build().unwrap().id()
    }

    #[test]
    fn test_payload_downcast() {
        let delivery = Delivery::success(3, request_id(), Arc::new(String::from("hi")));
        assert_eq!(delivery.payload_as::<String>().unwrap(), "hi");
        assert!(delivery.payload_as::<u32>().is_none());
        assert!(!delivery.from_cache);
    }

    #[test]
    fn test_failure_has_error_and_no_payload() {
        let delivery = Delivery::failure(3, request_id(), EngineError::Offline).from_cache();
        assert!(!delivery.success);
        assert!(delivery.payload.is_none());
        assert!(matches!(
            delivery.error.as_deref(),
            Some(EngineError::Offline)
        ));
        assert!(delivery.from_cache);
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tx.deliver(Delivery::success(1, request_id(), Arc::new(1u8)));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.processor_id, 1);
    }

    #[test]
    fn test_channel_sink_ignores_closed_receiver() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Delivery>();
        drop(rx);
        tx.deliver(Delivery::success(1, request_id(), Arc::new(())));
    }

    #[test]
    fn test_callback_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sink = CallbackSink(move |d: Delivery| seen_clone.lock().unwrap().push(d.processor_id));
        sink.deliver(Delivery::success(9, request_id(), Arc::new(())));
        assert_eq!(*seen.lock().unwrap(), vec![9]);
    }
}
