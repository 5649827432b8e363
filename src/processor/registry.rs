//! Processor registry keyed by integer id.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use super::{Processor, ProcessorError};
use crate::request::{ProcessorId, Request, UNSET_PROCESSOR};

/// Concurrent map from processor id to processor.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: DashMap<ProcessorId, Arc<dyn Processor>>,
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

impl ProcessorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `processor` under its id.
    ///
    /// # Errors
    ///
    /// - [`ProcessorError::UnsetId`] if the id is the unset sentinel
    /// - [`ProcessorError::Collision`] if a different processor type owns the id
    /// - [`ProcessorError::AlreadyRegistered`] if the id is already taken by the same type
    pub fn register(&self, processor: Arc<dyn Processor>) -> Result<(), ProcessorError> {
        let id = check_id(processor.as_ref())?;
        match self.processors.entry(id) {
            Entry::Occupied(existing) => Err(conflict(existing.get().as_ref(), processor.as_ref())),
            Entry::Vacant(slot) => {
                debug!(processor_id = id, kind = processor.type_name(), "processor registered");
                slot.insert(processor);
                Ok(())
            }
        }
    }

    /// Registers `processor` unless a processor of the same type already owns
    /// its id, returning whichever instance is registered.
    ///
    /// # Errors
    ///
    /// - [`ProcessorError::UnsetId`] if the id is the unset sentinel
    /// - [`ProcessorError::Collision`] if a different processor type owns the id
    pub fn ensure_registered(
        &self,
        processor: Arc<dyn Processor>,
    ) -> Result<Arc<dyn Processor>, ProcessorError> {
        let id = check_id(processor.as_ref())?;
        match self.processors.entry(id) {
            Entry::Occupied(existing) => {
                if existing.get().type_name() == processor.type_name() {
                    Ok(Arc::clone(existing.get()))
                } else {
                    Err(conflict(existing.get().as_ref(), processor.as_ref()))
                }
            }
            Entry::Vacant(slot) => {
                debug!(processor_id = id, kind = processor.type_name(), "processor registered");
                Ok(Arc::clone(slot.insert(processor).value()))
            }
        }
    }

    /// Removes the processor for `id`, returning it.
    pub fn unregister(&self, id: ProcessorId) -> Option<Arc<dyn Processor>> {
        self.processors.remove(&id).map(|(_, processor)| processor)
    }

    #[must_use]
    pub fn is_registered(&self, id: ProcessorId) -> bool {
        self.processors.contains_key(&id)
    }

    #[must_use]
    pub fn get(&self, id: ProcessorId) -> Option<Arc<dyn Processor>> {
        self.processors.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Resolves the processor a request names.
    ///
    /// # Errors
    ///
    /// [`ProcessorError::UnsetId`] or [`ProcessorError::NotRegistered`], both
    /// naming where the request was built.
    pub fn resolve(&self, request: &Request) -> Result<Arc<dyn Processor>, ProcessorError> {
        let id = request.processor_id();
        if id == UNSET_PROCESSOR {
            return Err(ProcessorError::UnsetId {
                origin: request.origin().to_string(),
            });
        }
        self.get(id).ok_or_else(|| ProcessorError::NotRegistered {
            processor_id: id,
            origin: request.origin().to_string(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Registered ids in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<ProcessorId> {
        let mut ids: Vec<_> = self.processors.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }
}

fn check_id(processor: &dyn Processor) -> Result<ProcessorId, ProcessorError> {
    let id = processor.id();
    if id == UNSET_PROCESSOR {
        return Err(ProcessorError::UnsetId {
            origin: processor.type_name().to_string(),
        });
    }
    Ok(id)
}

fn conflict(existing: &dyn Processor, incoming: &dyn Processor) -> ProcessorError {
    if existing.type_name() == incoming.type_name() {
        ProcessorError::AlreadyRegistered {
            processor_id: incoming.id(),
        }
    } else {
        ProcessorError::Collision {
            processor_id: incoming.id(),
            existing: existing.type_name(),
            incoming: incoming.type_name(),
        }
    }
}
