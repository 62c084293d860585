//! Scripted connection used by the unit tests of this crate.

use crate::ports::{
    CacheConnection, ConnectionFactory, OpCompleter, OpHandle, OpResult, OpValue, Operation,
};
use shared::Result;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub enum Behaviour {
    /// Handles are done before `submit` returns.
    Immediate,
    /// Handles complete on a spawned task after the delay.
    Deferred(Duration),
    /// Handles never complete; completers are kept for inspection.
    Park,
}

type Responder = Box<dyn Fn(&Operation) -> OpResult + Send + Sync>;

pub struct ScriptedConnection {
    behaviour: Behaviour,
    responder: Responder,
    query_delay: Duration,
    submitted: Mutex<Vec<Operation>>,
    parked: Mutex<Vec<OpCompleter>>,
    shutdowns: AtomicUsize,
}

impl ScriptedConnection {
    pub fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            responder: Box::new(default_response),
            query_delay: Duration::ZERO,
            submitted: Mutex::new(Vec::new()),
            parked: Mutex::new(Vec::new()),
            shutdowns: AtomicUsize::new(0),
        }
    }

    pub fn responding(mut self, responder: impl Fn(&Operation) -> OpResult + Send + Sync + 'static) -> Self {
        self.responder = Box::new(responder);
        self
    }

    /// Makes the blocking status queries take this long.
    pub fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = delay;
        self
    }

    pub fn submitted(&self) -> Vec<Operation> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn parked_cancelled(&self) -> Vec<bool> {
        self.parked
            .lock()
            .unwrap()
            .iter()
            .map(OpCompleter::is_cancelled)
            .collect()
    }

    /// Hands the parked completers to the caller, as if the backend were
    /// about to answer them.
    pub fn take_parked(&self) -> Vec<OpCompleter> {
        std::mem::take(&mut *self.parked.lock().unwrap())
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    fn pause(&self) {
        if !self.query_delay.is_zero() {
            std::thread::sleep(self.query_delay);
        }
    }
}

fn default_response(operation: &Operation) -> OpResult {
    Ok(match operation {
        Operation::Get { .. } => OpValue::Fetched(None),
        Operation::GetAndTouch { .. } => OpValue::CasFetched(None),
        Operation::GetBulk { .. } => OpValue::Bulk(BTreeMap::new()),
        Operation::Incr { .. } | Operation::Decr { .. } => OpValue::Counter(None),
        _ => OpValue::Stored(true),
    })
}

impl CacheConnection for ScriptedConnection {
    fn submit(&self, operation: Operation) -> OpHandle {
        let result = (self.responder)(&operation);
        self.submitted.lock().unwrap().push(operation);

        match self.behaviour {
            Behaviour::Immediate => OpHandle::ready(result),
            Behaviour::Deferred(delay) => {
                let (completer, handle) = OpHandle::channel();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    completer.complete(result);
                });
                handle
            }
            Behaviour::Park => {
                let (completer, handle) = OpHandle::channel();
                self.parked.lock().unwrap().push(completer);
                handle
            }
        }
    }

    fn available_servers(&self) -> Vec<String> {
        self.pause();
        vec!["10.0.0.1:11211".to_string()]
    }

    fn unavailable_servers(&self) -> Vec<String> {
        self.pause();
        vec!["10.0.0.2:11211".to_string()]
    }

    fn stats(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.pause();
        let mut node = BTreeMap::new();
        node.insert("curr_items".to_string(), "3".to_string());
        BTreeMap::from([("10.0.0.1:11211".to_string(), node)])
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct ScriptedFactory {
    behaviour: Behaviour,
}

impl ScriptedFactory {
    pub fn new(behaviour: Behaviour) -> Self {
        Self { behaviour }
    }
}

impl ConnectionFactory for ScriptedFactory {
    fn connect(&self, _index: usize) -> Result<Arc<dyn CacheConnection>> {
        Ok(Arc::new(ScriptedConnection::new(self.behaviour)))
    }
}
