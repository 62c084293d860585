use crate::ports::{OpHandle, OpValue};
use shared::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Runs blocking status queries on a bounded set of worker threads.
///
/// Each query holds one permit for as long as its thread is busy, even if
/// the caller already gave up on it, so a stuck backend can tie up at most
/// `workers` threads.
#[derive(Clone, Debug)]
pub struct QueryWorkers {
    permits: Arc<Semaphore>,
    limit: Duration,
}

impl QueryWorkers {
    pub fn new(workers: usize, limit: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            limit,
        }
    }

    /// Starts `query` in the background and returns at once. The handle
    /// completes with the query's value, or with a timeout once the limit
    /// passes. Cancelling the handle stops waiting for the query.
    pub fn submit<F>(&self, operation: &'static str, query: F) -> OpHandle
    where
        F: FnOnce() -> OpValue + Send + 'static,
    {
        let (completer, handle) = OpHandle::channel();
        let cancelled = completer.cancellation();
        let workers = self.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => debug!("'{}' query cancelled", operation),
                result = workers.run(operation, query) => {
                    if !completer.complete(result) {
                        debug!("'{}' query finished after its caller left", operation);
                    }
                }
            }
        });

        handle
    }

    /// Runs `query` and waits at most `limit` for it, queueing included.
    pub async fn run<T, F>(&self, operation: &str, query: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let job = async move {
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|_| Error::Internal("query workers closed".to_string()))?;
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                query()
            })
            .await
            .map_err(|e| Error::Internal(format!("query worker failed: {e}")))
        };

        match tokio::time::timeout(self.limit, job).await {
            Ok(result) => result,
            Err(_) => {
                warn!("'{}' query exceeded {:?}", operation, self.limit);
                Err(Error::Timeout(operation.to_string()))
            }
        }
    }
}
