#![deny(clippy::all)]

use crate::domain::{CacheValue, CasValue};
use shared::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio_util::sync::CancellationToken;

// Ports are the pluggable extension points for memcached client implementations

/// A single memcached request, already validated and typed.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    Get { key: String },
    GetBulk { keys: Vec<String> },
    GetAndTouch { key: String, exp: i64 },
    Set { key: String, exp: i64, value: CacheValue },
    Add { key: String, exp: i64, value: CacheValue },
    Replace { key: String, exp: i64, value: CacheValue },
    Append { key: String, cas: u64, value: CacheValue },
    Prepend { key: String, cas: u64, value: CacheValue },
    Touch { key: String, exp: i64 },
    Incr { key: String, by: u64 },
    Decr { key: String, by: u64 },
    Delete { key: String },
    Flush { delay: i64 },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Get { .. } => "get",
            Operation::GetBulk { .. } => "getbulk",
            Operation::GetAndTouch { .. } => "gat",
            Operation::Set { .. } => "set",
            Operation::Add { .. } => "add",
            Operation::Replace { .. } => "replace",
            Operation::Append { .. } => "append",
            Operation::Prepend { .. } => "prepend",
            Operation::Touch { .. } => "touch",
            Operation::Incr { .. } => "incr",
            Operation::Decr { .. } => "decr",
            Operation::Delete { .. } => "delete",
            Operation::Flush { .. } => "flush",
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            Operation::Get { key }
            | Operation::GetAndTouch { key, .. }
            | Operation::Set { key, .. }
            | Operation::Add { key, .. }
            | Operation::Replace { key, .. }
            | Operation::Append { key, .. }
            | Operation::Prepend { key, .. }
            | Operation::Touch { key, .. }
            | Operation::Incr { key, .. }
            | Operation::Decr { key, .. }
            | Operation::Delete { key } => Some(key),
            Operation::GetBulk { .. } | Operation::Flush { .. } => None,
        }
    }
}

/// What a finished operation produced.
#[derive(Clone, Debug, PartialEq)]
pub enum OpValue {
    /// Storage commands, touch, delete and flush.
    Stored(bool),
    /// New counter value, `None` when the key did not exist.
    Counter(Option<u64>),
    Fetched(Option<CacheValue>),
    CasFetched(Option<CasValue>),
    /// Only the keys that were found.
    Bulk(BTreeMap<String, CacheValue>),
    /// Server reachability as seen by the client.
    Servers {
        available: Vec<String>,
        unavailable: Vec<String>,
    },
    /// Raw statistics per server address.
    Stats(BTreeMap<String, BTreeMap<String, String>>),
}

pub type OpResult = Result<OpValue>;

/// Caller side of an in-flight operation.
///
/// The result can be polled without blocking, which is what the dispatcher's
/// reconciliation pass relies on.
pub struct OpHandle {
    outcome: Option<oneshot::Receiver<OpResult>>,
    cancel: CancellationToken,
}

/// Backend side of an in-flight operation.
pub struct OpCompleter {
    outcome: oneshot::Sender<OpResult>,
    cancel: CancellationToken,
}

impl OpHandle {
    pub fn channel() -> (OpCompleter, OpHandle) {
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        (
            OpCompleter {
                outcome: tx,
                cancel: cancel.clone(),
            },
            OpHandle {
                outcome: Some(rx),
                cancel,
            },
        )
    }

    /// A handle that is already done.
    pub fn ready(result: OpResult) -> Self {
        let (completer, handle) = Self::channel();
        completer.complete(result);
        handle
    }

    /// Takes the result if the operation has finished. Yields `Some` once.
    pub fn try_take(&mut self) -> Option<OpResult> {
        let receiver = self.outcome.as_mut()?;
        let taken = match receiver.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Closed) => Err(abandoned()),
        };
        self.outcome = None;
        Some(taken)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn wait(mut self) -> OpResult {
        match self.outcome.take() {
            Some(receiver) => receiver.await.unwrap_or_else(|_| Err(abandoned())),
            None => Err(Error::Internal("operation result already taken".to_string())),
        }
    }

    /// Waits at most `limit`; on expiry the operation is cancelled and `None`
    /// is returned.
    pub async fn wait_for(self, limit: Duration) -> Option<OpResult> {
        let cancel = self.cancel.clone();
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(result) => Some(result),
            Err(_) => {
                cancel.cancel();
                None
            }
        }
    }
}

impl fmt::Debug for OpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpHandle")
            .field("taken", &self.outcome.is_none())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl OpCompleter {
    /// Returns false when nobody is listening any more.
    pub fn complete(self, result: OpResult) -> bool {
        self.outcome.send(result).is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

fn abandoned() -> Error {
    Error::Backend("operation abandoned before completion".to_string())
}

/// Port for a live memcached client connection.
///
/// `submit` must not block. The status and stats queries may block and are
/// only ever called from blocking worker threads.
pub trait CacheConnection: Send + Sync + 'static {
    fn submit(&self, operation: Operation) -> OpHandle;
    fn available_servers(&self) -> Vec<String>;
    fn unavailable_servers(&self) -> Vec<String>;
    fn stats(&self) -> BTreeMap<String, BTreeMap<String, String>>;
    fn shutdown(&self);
}

/// Port for opening connections against the configured servers.
pub trait ConnectionFactory: Send + Sync + 'static {
    fn connect(&self, index: usize) -> Result<Arc<dyn CacheConnection>>;
}
