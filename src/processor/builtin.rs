//! Ready-made processors for common body shapes.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use super::{Processor, ProcessorError, SyncProcessor};
use crate::delivery::Payload;
use crate::request::ProcessorId;

/// Delivers the raw body as [`Bytes`].
#[derive(Debug, Clone, Copy)]
pub struct BytesProcessor {
    id: ProcessorId,
}

impl BytesProcessor {
    #[must_use]
    pub fn new(id: ProcessorId) -> Self {
        Self { id }
    }
}

impl Processor for BytesProcessor {
    fn id(&self) -> ProcessorId {
        self.id
    }

    fn parse_bytes(&self, bytes: &Bytes) -> Result<Payload, ProcessorError> {
        Ok(Arc::new(bytes.clone()))
    }

    fn as_sync(&self) -> Option<&dyn SyncProcessor> {
        Some(self)
    }
}

impl SyncProcessor for BytesProcessor {}

/// Delivers the body as a UTF-8 [`String`].
#[derive(Debug, Clone, Copy)]
pub struct TextProcessor {
    id: ProcessorId,
}

impl TextProcessor {
    #[must_use]
    pub fn new(id: ProcessorId) -> Self {
        Self { id }
    }
}

impl Processor for TextProcessor {
    fn id(&self) -> ProcessorId {
        self.id
    }

    fn parse_bytes(&self, bytes: &Bytes) -> Result<Payload, ProcessorError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ProcessorError::parse(self.id, format!("invalid UTF-8: {e}")))?;
        Ok(Arc::new(text.to_string()))
    }

    fn as_sync(&self) -> Option<&dyn SyncProcessor> {
        Some(self)
    }
}

impl SyncProcessor for TextProcessor {}

/// Deserializes the body as JSON into `T` (defaults to [`serde_json::Value`]).
pub struct JsonProcessor<T = serde_json::Value> {
    id: ProcessorId,
    _target: PhantomData<fn() -> T>,
}

impl<T> JsonProcessor<T> {
    #[must_use]
    pub fn new(id: ProcessorId) -> Self {
        Self {
            id,
            _target: PhantomData,
        }
    }
}

impl<T> fmt::Debug for JsonProcessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonProcessor")
            .field("id", &self.id)
            .field("target", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> Processor for JsonProcessor<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn id(&self) -> ProcessorId {
        self.id
    }

    fn parse_bytes(&self, bytes: &Bytes) -> Result<Payload, ProcessorError> {
        let value: T = serde_json::from_slice(bytes)
            .map_err(|e| ProcessorError::parse(self.id, format!("invalid JSON: {e}")))?;
        Ok(Arc::new(value))
    }

    fn as_sync(&self) -> Option<&dyn SyncProcessor> {
        Some(self)
    }
}

impl<T> SyncProcessor for JsonProcessor<T> where T: DeserializeOwned + Send + Sync + 'static {}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Feed {
        title: String,
        items: Vec<u32>,
    }

    #[test]
    fn test_bytes_processor_passes_body_through() {
        let payload = BytesProcessor::new(1)
            .parse_bytes(&Bytes::from_static(b"\x00\x01"))
            .unwrap();
        assert_eq!(payload.downcast_ref::<Bytes>().unwrap().as_ref(), b"\x00\x01");
    }

    #[test]
    fn test_text_processor_rejects_invalid_utf8() {
        let err = TextProcessor::new(2)
            .parse_bytes(&Bytes::from_static(b"\xff\xfe"))
            .unwrap_err();
        assert!(matches!(err, ProcessorError::Parse { processor_id: 2, .. }));
    }

    #[test]
    fn test_json_processor_typed_target() {
        let payload = JsonProcessor::<Feed>::new(3)
            .parse_bytes(&Bytes::from_static(br#"{"title":"news","items":[1,2]}"#))
            .unwrap();
        assert_eq!(
            payload.downcast_ref::<Feed>().unwrap(),
            &Feed {
                title: "news".to_string(),
                items: vec![1, 2]
            }
        );
    }

    #[test]
    fn test_json_processor_reports_parse_error() {
        let err = JsonProcessor::<serde_json::Value>::new(4)
            .parse_bytes(&Bytes::from_static(b"{not json"))
            .unwrap_err();
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[test]
    fn test_type_names_differ_between_processor_types() {
        assert_ne!(
            BytesProcessor::new(1).type_name(),
            TextProcessor::new(1).type_name()
        );
        assert_ne!(
            JsonProcessor::<Feed>::new(1).type_name(),
            JsonProcessor::<serde_json::Value>::new(1).type_name()
        );
    }
}
