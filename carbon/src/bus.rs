//! In-process message bus.
//!
//! Each registered address owns an inbox drained by a single task, so a
//! handler sees its messages and timer ticks one at a time and never needs a
//! lock around its own state.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use shared::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const INBOX_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

pub type ReplyReceiver = oneshot::Receiver<Value>;

/// A message delivered to a handler. Replying consumes the message, so at
/// most one reply can ever be sent.
#[derive(Debug)]
pub struct BusMessage {
    address: String,
    body: Value,
    reply_to: Option<oneshot::Sender<Value>>,
}

impl BusMessage {
    pub fn new(address: impl Into<String>, body: Value) -> Self {
        Self {
            address: address.into(),
            body,
            reply_to: None,
        }
    }

    pub fn with_reply(address: impl Into<String>, body: Value) -> (Self, ReplyReceiver) {
        let (tx, rx) = oneshot::channel();
        let message = Self {
            address: address.into(),
            body,
            reply_to: Some(tx),
        };
        (message, rx)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn expects_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    /// Returns false if the sender did not ask for a reply or stopped waiting.
    pub fn reply(self, body: Value) -> bool {
        match self.reply_to {
            Some(reply_to) => reply_to.send(body).is_ok(),
            None => false,
        }
    }
}

enum Delivery {
    Message(BusMessage),
    Tick(TimerId),
    Stop,
}

/// Per-handler context: the handler's own address and its timers.
pub struct BusContext {
    address: String,
    inbox: mpsc::Sender<Delivery>,
    timers: HashMap<TimerId, JoinHandle<()>>,
    next_timer: u64,
}

impl BusContext {
    fn new(address: String, inbox: mpsc::Sender<Delivery>) -> Self {
        Self {
            address,
            inbox,
            timers: HashMap::new(),
            next_timer: 0,
        }
    }

    /// A context whose ticks go nowhere, for driving a handler by hand.
    #[cfg(test)]
    pub(crate) fn detached(address: &str) -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self::new(address.to_string(), tx)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Starts a timer whose ticks are delivered to `BusHandler::on_timer`
    /// until cancelled. The first tick arrives after one period.
    pub fn set_periodic(&mut self, period: Duration) -> TimerId {
        self.next_timer += 1;
        let id = TimerId(self.next_timer);
        let period = period.max(Duration::from_millis(1));
        let inbox = self.inbox.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if inbox.send(Delivery::Tick(id)).await.is_err() {
                    break;
                }
            }
        });

        self.timers.insert(id, task);
        id
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        match self.timers.remove(&id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_timer_active(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    fn cancel_all_timers(&mut self) {
        for (_, task) in self.timers.drain() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait BusHandler: Send + 'static {
    async fn handle(&mut self, ctx: &mut BusContext, message: BusMessage);

    async fn on_timer(&mut self, _ctx: &mut BusContext, _timer: TimerId) {}

    async fn on_stop(&mut self, _ctx: &mut BusContext) {}
}

#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<DashMap<String, mpsc::Sender<Delivery>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler<H: BusHandler>(
        &self,
        address: impl Into<String>,
        handler: H,
    ) -> Result<Registration> {
        let address = address.into();
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);

        match self.handlers.entry(address.clone()) {
            Entry::Occupied(_) => return Err(Error::AddressInUse(address)),
            Entry::Vacant(slot) => {
                slot.insert(tx.clone());
            }
        }

        let ctx = BusContext::new(address.clone(), tx);
        let task = tokio::spawn(run_handler(handler, ctx, rx));
        info!("Handler registered at '{}'", address);

        Ok(Registration {
            address,
            bus: self.clone(),
            task: Some(task),
        })
    }

    pub fn is_registered(&self, address: &str) -> bool {
        self.handlers.contains_key(address)
    }

    /// Fire-and-forget delivery.
    pub async fn send(&self, address: &str, body: Value) -> Result<()> {
        self.deliver(BusMessage::new(address, body)).await
    }

    pub async fn request(&self, address: &str, body: Value) -> Result<ReplyReceiver> {
        let (message, reply) = BusMessage::with_reply(address, body);
        self.deliver(message).await?;
        Ok(reply)
    }

    pub async fn request_timeout(
        &self,
        address: &str,
        body: Value,
        limit: Duration,
    ) -> Result<Value> {
        let reply = self.request(address, body).await?;
        match tokio::time::timeout(limit, reply).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(Error::NoReply(address.to_string())),
            Err(_) => Err(Error::ReplyTimeout {
                address: address.to_string(),
                limit,
            }),
        }
    }

    async fn deliver(&self, message: BusMessage) -> Result<()> {
        let address = message.address().to_string();
        let inbox = self
            .handlers
            .get(&address)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NoHandler(address.clone()))?;

        inbox
            .send(Delivery::Message(message))
            .await
            .map_err(|_| Error::NoHandler(address))
    }
}

/// Keeps a handler registered. Dropping it stops the handler after the
/// messages already queued; [`Registration::unregister`] also waits for that.
pub struct Registration {
    address: String,
    bus: EventBus,
    task: Option<JoinHandle<()>>,
}

impl Registration {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Removes the address and waits for the handler to drain what was
    /// already queued.
    pub async fn unregister(mut self) {
        if let Some((_, inbox)) = self.bus.handlers.remove(&self.address) {
            let _ = inbox.send(Delivery::Stop).await;
        }
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!("Handler at '{}' ended abnormally: {}", self.address, e);
        }
        info!("Handler unregistered from '{}'", self.address);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        if let Some((_, inbox)) = self.bus.handlers.remove(&self.address)
            && inbox.try_send(Delivery::Stop).is_ok()
        {
            debug!("Handler at '{}' asked to stop", self.address);
            return;
        }
        // inbox full or already gone
        task.abort();
    }
}

async fn run_handler<H: BusHandler>(
    mut handler: H,
    mut ctx: BusContext,
    mut inbox: mpsc::Receiver<Delivery>,
) {
    while let Some(delivery) = inbox.recv().await {
        match delivery {
            Delivery::Message(message) => handler.handle(&mut ctx, message).await,
            Delivery::Tick(timer) => {
                // ticks queued before a cancel are dropped here
                if ctx.is_timer_active(timer) {
                    handler.on_timer(&mut ctx, timer).await;
                }
            }
            Delivery::Stop => break,
        }
    }

    handler.on_stop(&mut ctx).await;
    ctx.cancel_all_timers();
    debug!("Handler at '{}' stopped", ctx.address());
}
