//! Work that must finish before the worker may be suspended.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Tracks background tasks registered through [`KeepAlive::wait_until`].
///
/// A response can be delivered while its cache write is still running; the
/// host calls [`KeepAlive::settle`] before it suspends or terminates the
/// worker.
#[derive(Debug, Clone, Default)]
pub struct KeepAlive {
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl KeepAlive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `future` in the background and keep the worker alive until it
    /// completes.
    pub fn wait_until<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Number of tasks that have not finished yet.
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Wait for every registered task, including ones registered while
    /// waiting. Returns how many tasks were awaited.
    pub async fn settle(&self) -> usize {
        let mut settled = 0;
        loop {
            let batch: Vec<_> = {
                let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
                pending.drain(..).collect()
            };
            if batch.is_empty() {
                break;
            }

            for handle in batch {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Background task did not complete");
                }
                settled += 1;
            }
        }
        trace!(settled, "Keep-alive settled");
        settled
    }

    /// Abort every pending task.
    pub fn abort(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        for handle in pending.drain(..) {
            handle.abort();
        }
    }
}
