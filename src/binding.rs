//! Request queuing facade over an engine that may not be reachable yet.
//!
//! The host drives an explicit state machine:
//!
//! ```text
//! Disconnected --connecting()--> Connecting --on_connected(engine)--> Connected
//!      ^                                                                  |
//!      +----------------- on_disconnected() / disconnect_now() -----------+
//! ```
//!
//! Asynchronous calls made before `Connected` are queued and replayed in
//! FIFO order on connection, registering each call's processor if needed.
//! Synchronous calls wait for `Connected` up to the binding timeout.
//!
//! Calls made after connection race with still-draining queued calls; no
//! ordering holds between the two groups.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::delivery::{Delivery, DeliverySink, ProgressListener};
use crate::engine::{EngineError, RequestEngine, RequestHandle, ResultContainer};
use crate::processor::{Processor, ProcessorError};
use crate::request::{Request, RequestId, UNSET_PROCESSOR};

/// Reachability of the engine from the facade's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Disconnected,
    Connecting,
    Connected,
}

/// What happened to an asynchronous call.
#[derive(Debug)]
pub enum Submission {
    /// Buffered until the engine connects.
    Queued(RequestId),
    /// Handed to the engine.
    Dispatched(RequestHandle),
}

impl Submission {
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        match self {
            Self::Queued(id) => *id,
            Self::Dispatched(handle) => handle.id(),
        }
    }
}

/// Result of [`EngineBinding::safe_disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// Nothing was queued; the binding is now disconnected.
    Immediate,
    /// Queued calls remain; disconnection happens once they are replayed.
    Deferred,
}

struct QueuedCall {
    request: Request,
    processor: Arc<dyn Processor>,
    sink: Arc<dyn DeliverySink>,
    progress: Option<Arc<dyn ProgressListener>>,
}

#[derive(Default)]
struct Shared {
    engine: Option<RequestEngine>,
    queue: VecDeque<QueuedCall>,
    disconnect_after_drain: bool,
}

/// Facade buffering calls until the engine is bound.
pub struct EngineBinding {
    state: watch::Sender<BindingState>,
    shared: Mutex<Shared>,
    binding_timeout: Duration,
}

impl fmt::Debug for EngineBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBinding")
            .field("state", &self.state())
            .field("queued", &self.queued_len())
            .field("binding_timeout", &self.binding_timeout)
            .finish()
    }
}

impl EngineBinding {
    /// Creates a disconnected binding whose synchronous calls wait at most `binding_timeout`.
    #[must_use]
    pub fn new(binding_timeout: Duration) -> Self {
        let (state, _) = watch::channel(BindingState::Disconnected);
        Self {
            state,
            shared: Mutex::new(Shared::default()),
            binding_timeout,
        }
    }

    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.binding_timeout())
    }

    #[must_use]
    pub fn state(&self) -> BindingState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<BindingState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// The bound engine, if connected.
    #[must_use]
    pub fn engine(&self) -> Option<RequestEngine> {
        self.lock().engine.clone()
    }

    /// Marks the start of the bind handshake.
    pub fn connecting(&self) {
        let _guard = self.lock();
        self.state.send_if_modified(|state| {
            if *state == BindingState::Disconnected {
                *state = BindingState::Connecting;
                true
            } else {
                false
            }
        });
        debug!("engine binding connecting");
    }

    /// Binds `engine` and replays queued calls in FIFO order.
    #[instrument(skip(self, engine))]
    pub fn on_connected(&self, engine: RequestEngine) {
        let (drained, disconnect_after) = {
            let mut shared = self.lock();
            shared.engine = Some(engine.clone());
            self.state.send_replace(BindingState::Connected);
            (
                std::mem::take(&mut shared.queue),
                std::mem::take(&mut shared.disconnect_after_drain),
            )
        };

        info!(replayed = drained.len(), "engine bound");
        for call in drained {
            dispatch(&engine, call);
        }

        if disconnect_after {
            info!("queue drained, completing deferred disconnect");
            self.on_disconnected();
        }
    }

    /// Records that the engine went away. Queued calls stay queued.
    pub fn on_disconnected(&self) {
        let mut shared = self.lock();
        shared.engine = None;
        self.state.send_replace(BindingState::Disconnected);
        info!(queued = shared.queue.len(), "engine unbound");
    }

    /// Runs `request` through the engine once connected, or queues it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Processor`] if the processor id is unset or
    /// collides with a different registered processor type.
    pub fn run_async(
        &self,
        request: Request,
        processor: Arc<dyn Processor>,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<Submission, EngineError> {
        self.run_async_with(request, processor, sink, None)
    }

    /// Like [`run_async`](Self::run_async) with a download progress listener.
    ///
    /// # Errors
    ///
    /// Same as [`run_async`](Self::run_async).
    pub fn run_async_with(
        &self,
        request: Request,
        processor: Arc<dyn Processor>,
        sink: Arc<dyn DeliverySink>,
        progress: Option<Arc<dyn ProgressListener>>,
    ) -> Result<Submission, EngineError> {
        if request.processor_id() == UNSET_PROCESSOR {
            return Err(ProcessorError::UnsetId {
                origin: request.origin().to_string(),
            }
            .into());
        }

        let engine = {
            let mut shared = self.lock();
            match shared.engine.clone() {
                Some(engine) => engine,
                None => {
                    let id = request.id();
                    debug!(request_id = %id, queued = shared.queue.len() + 1, "engine not bound, queueing request");
                    shared.queue.push_back(QueuedCall {
                        request,
                        processor,
                        sink,
                        progress,
                    });
                    return Ok(Submission::Queued(id));
                }
            }
        };

        let processor = engine.registry().ensure_registered(processor)?;
        debug!(processor_id = processor.id(), "processor ready");
        let handle = engine.submit(request, sink, progress)?;
        Ok(Submission::Dispatched(handle))
    }

    /// Waits up to the binding timeout for a connection, then runs `request` synchronously.
    ///
    /// # Errors
    ///
    /// - [`EngineError::BindingTimeout`] if the engine does not connect in time
    /// - [`EngineError::Disconnected`] if the binding is dropped while waiting
    /// - otherwise as [`RequestEngine::run_sync`]
    pub async fn run_sync(
        &self,
        request: Request,
        processor: Arc<dyn Processor>,
    ) -> Result<ResultContainer, EngineError> {
        let engine = self.wait_for_engine().await?;
        engine.registry().ensure_registered(processor)?;
        engine.run_sync(request).await
    }

    /// Like [`run_sync`](Self::run_sync) with a download progress listener.
    ///
    /// # Errors
    ///
    /// Same as [`run_sync`](Self::run_sync).
    pub async fn run_sync_with(
        &self,
        request: Request,
        processor: Arc<dyn Processor>,
        progress: Option<Arc<dyn ProgressListener>>,
    ) -> Result<ResultContainer, EngineError> {
        let engine = self.wait_for_engine().await?;
        engine.registry().ensure_registered(processor)?;
        engine.run_sync_with(request, progress).await
    }

    /// Disconnects once queued calls have been replayed.
    pub fn safe_disconnect(&self) -> DisconnectOutcome {
        let mut shared = self.lock();
        if shared.queue.is_empty() {
            shared.engine = None;
            self.state.send_replace(BindingState::Disconnected);
            info!("engine unbound");
            DisconnectOutcome::Immediate
        } else {
            info!(queued = shared.queue.len(), "disconnect deferred until queue drains");
            shared.disconnect_after_drain = true;
            DisconnectOutcome::Deferred
        }
    }

    /// Disconnects at once, dropping queued calls. Each dropped call's sink
    /// receives one [`EngineError::Disconnected`] failure. Returns the number dropped.
    pub fn disconnect_now(&self) -> usize {
        let dropped = {
            let mut shared = self.lock();
            shared.engine = None;
            shared.disconnect_after_drain = false;
            self.state.send_replace(BindingState::Disconnected);
            std::mem::take(&mut shared.queue)
        };
        if !dropped.is_empty() {
            warn!(dropped = dropped.len(), "immediate disconnect dropped queued requests");
        }
        let count = dropped.len();
        for call in dropped {
            call.sink.deliver(Delivery::failure(
                call.processor.id(),
                call.request.id(),
                EngineError::Disconnected,
            ));
        }
        count
    }

    /// Cancels a queued or dispatched request. Queued requests are removed
    /// without any delivery.
    pub fn cancel(&self, id: RequestId) -> bool {
        let engine = {
            let mut shared = self.lock();
            if let Some(position) = shared.queue.iter().position(|call| call.request.id() == id) {
                if let Some(call) = shared.queue.remove(position) {
                    call.request.mark_cancelled();
                }
                debug!(request_id = %id, "queued request cancelled");
                return true;
            }
            shared.engine.clone()
        };
        engine.is_some_and(|engine| engine.cancel(id))
    }

    async fn wait_for_engine(&self) -> Result<RequestEngine, EngineError> {
        let mut state = self.subscribe();
        let waited = self.binding_timeout;
        // Map away the watch guard before touching `shared`.
        let outcome = tokio::time::timeout(waited, state.wait_for(|s| *s == BindingState::Connected))
            .await
            .map(|ready| ready.map(|_| ()));
        match outcome {
            Err(_) => {
                warn!(waited_ms = waited.as_millis(), "engine binding timed out");
                Err(EngineError::BindingTimeout { waited })
            }
            Ok(Err(_)) => Err(EngineError::Disconnected),
            Ok(Ok(_)) => self.engine().ok_or(EngineError::Disconnected),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Replays one queued call against a connected engine.
fn dispatch(engine: &RequestEngine, call: QueuedCall) {
    let QueuedCall {
        request,
        processor,
        sink,
        progress,
    } = call;
    let request_id = request.id();
    let processor_id = processor.id();

    let submitted = engine
        .registry()
        .ensure_registered(processor)
        .map_err(EngineError::from)
        .and_then(|_| engine.submit(request, Arc::clone(&sink), progress));
    if let Err(error) = submitted {
        warn!(request_id = %request_id, error = %error, "queued request could not be replayed");
        sink.deliver(Delivery::failure(processor_id, request_id, error));
    }
}
