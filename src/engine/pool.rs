//! Bounded worker pool.
//!
//! Submission never waits: the work is spawned at once and acquires a
//! semaphore permit inside its task, so at most `size` units run at a time.
//! The returned [`PoolHandle`] is a future for the result; dropping it
//! aborts the work.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, instrument};

use super::EngineError;
use crate::config::MAX_POOL_SIZE;

const MIN_POOL_SIZE: usize = 1;

/// Fixed-size pool of concurrent work slots.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Creates a pool running at most `size` units at once.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidPoolSize`] if `size` is outside `1..=MAX_POOL_SIZE`.
    #[instrument(level = "debug")]
    pub fn new(size: usize) -> Result<Self, EngineError> {
        if !(MIN_POOL_SIZE..=MAX_POOL_SIZE).contains(&size) {
            return Err(EngineError::InvalidPoolSize { size });
        }
        debug!(size, "creating worker pool");
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots not currently held by running work.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Spawns `work` behind a pool slot.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F, T>(&self, work: F) -> PoolHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let handle = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| EngineError::PoolClosed)?;
            Ok(work.await)
        });
        PoolHandle { handle }
    }

    /// Stops admitting work. Units waiting for a slot fail with [`EngineError::PoolClosed`].
    pub fn close(&self) {
        self.semaphore.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

/// Handle to one unit of pool work. Awaiting it yields the result;
/// dropping it aborts the work.
#[derive(Debug)]
pub struct PoolHandle<T> {
    handle: JoinHandle<Result<T, EngineError>>,
}

impl<T> PoolHandle<T> {
    pub fn abort(&self) {
        self.handle.abort();
    }

    #[must_use]
    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.abort_handle()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Future for PoolHandle<T> {
    type Output = Result<T, EngineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(error) if error.is_cancelled() => Err(EngineError::Cancelled),
            Err(error) => Err(EngineError::WorkerPanicked {
                message: error.to_string(),
            }),
        })
    }
}

impl<T> Drop for PoolHandle<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
