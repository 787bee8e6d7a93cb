//! Resilience utilities: bounded concurrency for fan-out phases.
//!
//! - [`Bulkhead`]: Semaphore to limit concurrent operations
//! - [`run_bounded`]: Run a set of futures with at most N in flight and wait
//!   for all of them
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), container_replicator::resilience::BulkheadClosed> {
//! use container_replicator::resilience::Bulkhead;
//!
//! // Bulkhead: max 8 concurrent replications
//! let bulkhead = Bulkhead::new(8);
//! let _permit = bulkhead.acquire().await?;
//! // permit dropped = slot released
//! # Ok(())
//! # }
//! ```

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

// ═══════════════════════════════════════════════════════════════════════════════
// Bulkhead (Concurrency Limiter)
// ═══════════════════════════════════════════════════════════════════════════════

/// Error when the bulkhead semaphore has been closed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Bulkhead closed (max concurrent: {max_concurrent})")]
pub struct BulkheadClosed {
    /// Maximum concurrent operations allowed.
    pub max_concurrent: usize,
}

/// Caps how many replications or deletions a fan-out phase runs at once.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// A limit of zero is raised to one so work can always make progress.
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Wait for a slot; dropping the permit frees it.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadClosed> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadClosed {
                max_concurrent: self.max_concurrent,
            })
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

/// Run every future with at most `bulkhead.max_concurrent()` in flight, and
/// return once all of them have finished.
///
/// Outputs are returned in input order. A future whose permit cannot be
/// acquired (closed semaphore) yields `None`.
pub async fn run_bounded<F, T>(bulkhead: &Bulkhead, futures: Vec<F>) -> Vec<Option<T>>
where
    F: Future<Output = T>,
{
    let tasks = futures.into_iter().map(|fut| async move {
        let _permit = bulkhead.acquire().await.ok()?;
        Some(fut.await)
    });
    join_all(tasks).await
}
