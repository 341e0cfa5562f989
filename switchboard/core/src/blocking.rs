//! Bounded Blocking Pool
//!
//! Runs inherently blocking work (file writes, fsync, hashing large inputs)
//! on tokio's blocking threads, with a semaphore capping how many such jobs
//! run at once so they cannot exhaust the blocking thread pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;

/// Failure to run a blocking job
#[derive(Debug, Error)]
pub enum BlockingError {
    /// The pool was closed
    #[error("blocking pool closed")]
    Closed,

    /// The job panicked or was cancelled
    #[error("blocking job failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Semaphore-bounded wrapper around `spawn_blocking`
#[derive(Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    capacity: usize,
    completed: Arc<AtomicU64>,
}

impl BlockingPool {
    /// Create a pool running at most `capacity` jobs concurrently
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run `job` on a blocking thread once a slot is free
    pub async fn run<F, T>(&self, job: F) -> Result<T, BlockingError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BlockingError::Closed)?;

        let completed = Arc::clone(&self.completed);
        let output = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let output = job();
            completed.fetch_add(1, Ordering::Relaxed);
            output
        })
        .await?;

        Ok(output)
    }

    /// Maximum concurrent jobs
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots right now
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Jobs finished so far
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

impl Default for BlockingPool {
    fn default() -> Self {
        Self::new(4)
    }
}
