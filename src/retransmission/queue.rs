// Retry queue for chunks that failed during the batched phase

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::common::error::{Error, Result};
use crate::common::types::{ChunkIndex, CHUNK_RETRY_ATTEMPTS, RETRY_BACKOFF_STEP};

/// Linear backoff: the wait after failed attempt `n` (0-based) is `(n + 1) * step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_step: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_step,
        }
    }

    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        self.backoff_step * (failed_attempt + 1)
    }

    /// Run `op` until it succeeds, the attempts run out, or `cancel` fires.
    ///
    /// `op` receives the 0-based attempt number. Cancellation is also honored while
    /// sleeping between attempts. A rejected token ends the run at once. On
    /// exhaustion the last error is returned.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = Error::Cancelled;
        for attempt in 0..self.max_attempts {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(Error::Forbidden) => return Err(Error::Forbidden),
                Err(e) => {
                    debug!("Retry: attempt {} failed: {}", attempt + 1, e);
                    last_error = e;
                }
            }
            if attempt + 1 < self.max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(self.delay_after(attempt)) => {}
                }
            }
        }
        Err(last_error)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(CHUNK_RETRY_ATTEMPTS, RETRY_BACKOFF_STEP)
    }
}

/// Failed chunks waiting for their sequential retry, in the order they failed.
#[derive(Debug, Default)]
pub struct RetryQueue {
    queue: VecDeque<ChunkIndex>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk; duplicates are rejected.
    pub fn enqueue(&mut self, chunk: ChunkIndex) -> bool {
        if self.queue.contains(&chunk) {
            return false;
        }
        self.queue.push_back(chunk);
        true
    }

    pub fn enqueue_batch(&mut self, chunks: impl IntoIterator<Item = ChunkIndex>) -> usize {
        chunks
            .into_iter()
            .filter(|&chunk| self.enqueue(chunk))
            .count()
    }

    pub fn next(&mut self) -> Option<ChunkIndex> {
        self.queue.pop_front()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
