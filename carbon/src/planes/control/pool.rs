use crate::ports::{CacheConnection, ConnectionFactory, Operation};
use rand::Rng;
use shared::{Error, Result};
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const PROBE_KEY: &str = "carbon:probe";

/// Fixed set of backend connections, picked uniformly at random per request.
pub struct ConnectionPool {
    connections: Vec<Arc<dyn CacheConnection>>,
    shut_down: AtomicBool,
}

impl Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.connections.len())
            .field("shut_down", &self.shut_down.load(Ordering::SeqCst))
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(connections: Vec<Arc<dyn CacheConnection>>) -> Result<Self> {
        if connections.is_empty() {
            return Err(Error::PoolUnavailable(
                "no connection could be established".to_string(),
            ));
        }
        Ok(Self {
            connections,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Opens `size` connections (at least one). Connections that fail to open
    /// are skipped. With `probe` set, the pool must also answer a GET within
    /// that time on at least one connection.
    pub async fn connect(
        factory: &dyn ConnectionFactory,
        size: usize,
        probe: Option<Duration>,
    ) -> Result<Self> {
        let size = size.max(1);
        let mut connections = Vec::with_capacity(size);
        for index in 0..size {
            match factory.connect(index) {
                Ok(connection) => connections.push(connection),
                Err(e) => warn!("Connection {} could not be opened: {}", index, e),
            }
        }

        let pool = Self::new(connections)?;
        if let Some(limit) = probe
            && let Err(e) = pool.validate(limit).await
        {
            pool.shutdown_all();
            return Err(e);
        }

        info!("Connection pool ready with {} connection(s)", pool.size());
        Ok(pool)
    }

    pub async fn validate(&self, limit: Duration) -> Result<()> {
        let mut last_failure = String::from("no connection answered");
        for (index, connection) in self.connections.iter().enumerate() {
            let probe = connection.submit(Operation::Get {
                key: PROBE_KEY.to_string(),
            });
            match probe.wait_for(limit).await {
                Some(Ok(_)) => {
                    debug!("Connection {} answered the probe", index);
                    return Ok(());
                }
                Some(Err(e)) => {
                    warn!("Connection {} failed the probe: {}", index, e);
                    last_failure = e.to_string();
                }
                None => {
                    warn!("Connection {} did not answer the probe in {:?}", index, limit);
                    last_failure = format!("probe timed out after {limit:?}");
                }
            }
        }
        Err(Error::PoolUnavailable(last_failure))
    }

    pub fn acquire(&self) -> Arc<dyn CacheConnection> {
        if self.connections.len() == 1 {
            return Arc::clone(&self.connections[0]);
        }
        let index = rand::rng().random_range(0..self.connections.len());
        Arc::clone(&self.connections[index])
    }

    pub fn size(&self) -> usize {
        self.connections.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Shuts every connection down. Later calls do nothing.
    pub fn shutdown_all(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for connection in &self.connections {
            connection.shutdown();
        }
        info!("Connection pool shut down");
    }
}
