use crate::backend::MokaBackend;
use carbon::ports::{CacheConnection, ConnectionFactory, OpHandle, Operation};
use shared::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// A client connection onto the [`MokaBackend`].
///
/// Every submitted operation runs on its own task and can be cancelled
/// through its handle. Optional latencies make the connection behave like
/// one talking to a remote server.
pub struct MokaConnection {
    id: usize,
    backend: Arc<MokaBackend>,
    latency: Option<Duration>,
    query_latency: Option<Duration>,
    closed: AtomicBool,
}

impl MokaConnection {
    pub fn new(id: usize, backend: Arc<MokaBackend>) -> Self {
        Self {
            id,
            backend,
            latency: None,
            query_latency: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Delay applied to every operation before it reaches the backend.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Delay applied to the blocking status and stats queries.
    pub fn with_query_latency(mut self, latency: Duration) -> Self {
        self.query_latency = Some(latency);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn pause_for_query(&self) {
        if let Some(latency) = self.query_latency {
            std::thread::sleep(latency);
        }
    }
}

impl CacheConnection for MokaConnection {
    fn submit(&self, operation: Operation) -> OpHandle {
        if self.is_closed() {
            return OpHandle::ready(Err(Error::Backend(format!(
                "connection {} is shut down",
                self.id
            ))));
        }

        let (completer, handle) = OpHandle::channel();
        let cancelled = completer.cancellation();
        let backend = Arc::clone(&self.backend);
        let latency = self.latency;
        let name = operation.name();

        tokio::spawn(async move {
            let work = async {
                if let Some(latency) = latency {
                    tokio::time::sleep(latency).await;
                }
                backend.execute(operation).await
            };

            tokio::select! {
                _ = cancelled.cancelled() => debug!("{} cancelled before it finished", name),
                result = work => {
                    if !completer.complete(result) {
                        debug!("{} finished after its caller left", name);
                    }
                }
            }
        });

        handle
    }

    fn available_servers(&self) -> Vec<String> {
        self.pause_for_query();
        self.backend.available_servers()
    }

    fn unavailable_servers(&self) -> Vec<String> {
        self.pause_for_query();
        self.backend.unavailable_servers()
    }

    fn stats(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.pause_for_query();
        self.backend.stats()
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Connection {} shut down", self.id);
        }
    }
}

/// Opens [`MokaConnection`]s that share one backend.
pub struct MokaConnectionFactory {
    backend: Arc<MokaBackend>,
    latency: Option<Duration>,
    query_latency: Option<Duration>,
}

impl MokaConnectionFactory {
    pub fn new(backend: Arc<MokaBackend>) -> Self {
        Self {
            backend,
            latency: None,
            query_latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_query_latency(mut self, latency: Duration) -> Self {
        self.query_latency = Some(latency);
        self
    }
}

impl ConnectionFactory for MokaConnectionFactory {
    fn connect(&self, index: usize) -> Result<Arc<dyn CacheConnection>> {
        let mut connection = MokaConnection::new(index, Arc::clone(&self.backend));
        if let Some(latency) = self.latency {
            connection = connection.with_latency(latency);
        }
        if let Some(latency) = self.query_latency {
            connection = connection.with_query_latency(latency);
        }
        debug!("Opened connection {}", index);
        Ok(Arc::new(connection))
    }
}
