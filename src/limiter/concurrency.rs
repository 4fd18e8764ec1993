//! In-flight transfer ceiling.
//!
//! A counting semaphore with cancellation-aware acquisition. Permits are
//! RAII: dropping a [`TransferPermit`] releases the slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;

/// Errors from permit acquisition.
#[derive(Debug, Error)]
pub enum ConcurrencyError {
    /// The caller was cancelled before a slot freed up.
    #[error("cancelled while waiting for a transfer slot")]
    Cancelled,

    /// The semaphore was closed (the limiter is shutting down).
    #[error("transfer limiter closed")]
    Closed,
}

/// RAII transfer slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct TransferPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for TransferPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Counting semaphore bounding simultaneous transfers per backend.
#[derive(Debug)]
pub struct TransferConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    ceiling: usize,
    in_flight: Arc<AtomicUsize>,
}

impl TransferConcurrencyLimiter {
    /// Creates a limiter with the preset ceiling for `backend`.
    #[must_use]
    pub fn for_backend(backend: Backend) -> Self {
        Self::new(backend.max_transfers())
    }

    /// Creates a limiter with an explicit ceiling.
    #[must_use]
    pub fn new(ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(ceiling)),
            ceiling,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Waits for a slot, honoring cancellation.
    ///
    /// # Errors
    ///
    /// [`ConcurrencyError::Cancelled`] when `cancel` fires first, or
    /// [`ConcurrencyError::Closed`] if the limiter was shut down.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<TransferPermit, ConcurrencyError> {
        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| ConcurrencyError::Closed)?
            }
            () = cancel.cancelled() => return Err(ConcurrencyError::Cancelled),
        };
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        Ok(TransferPermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Configured ceiling.
    #[must_use]
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Transfers currently holding a slot.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}
