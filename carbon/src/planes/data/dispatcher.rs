use super::command::Command;
use crate::bus::{BusContext, BusHandler, BusMessage, TimerId};
use crate::domain::Envelope;
use crate::domain::response::{error_reply, ok_reply};
use crate::planes::control::{ConnectionPool, QueryWorkers};
use crate::ports::{OpHandle, OpResult};
use async_trait::async_trait;
use shared::Error;
use shared::config::MemcachedConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug)]
pub struct DispatchSettings {
    /// How long an operation may stay in flight before it is abandoned.
    pub operation_timeout: Duration,
    /// Period of the reconciliation scan.
    pub task_check_interval: Duration,
}

impl From<&MemcachedConfig> for DispatchSettings {
    fn from(config: &MemcachedConfig) -> Self {
        Self {
            operation_timeout: config.operation_timeout,
            task_check_interval: config.task_check_interval,
        }
    }
}

struct PendingOperation {
    id: u64,
    command: Command,
    envelope: Envelope,
    message: BusMessage,
    handle: OpHandle,
    submitted_at: Instant,
}

/// Bus handler that validates envelopes, submits commands and answers them
/// once their operations settle.
///
/// In-flight operations are not awaited. A periodic scan, armed only while
/// something is pending, polls each handle and expires the ones older than
/// the operation timeout.
pub struct Dispatcher {
    pool: Arc<ConnectionPool>,
    workers: QueryWorkers,
    settings: DispatchSettings,
    pending: Vec<PendingOperation>,
    next_id: u64,
    timer: Option<TimerId>,
}

impl Dispatcher {
    pub fn new(pool: Arc<ConnectionPool>, workers: QueryWorkers, settings: DispatchSettings) -> Self {
        Self {
            pool,
            workers,
            settings,
            pending: Vec::new(),
            next_id: 0,
            timer: None,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_scanning(&self) -> bool {
        self.timer.is_some()
    }

    fn dispatch(&mut self, ctx: &mut BusContext, message: BusMessage) {
        let envelope = match Envelope::from_body(message.body()) {
            Ok(envelope) => envelope,
            Err(e) => {
                reject(message, None, &e);
                return;
            }
        };

        let command = match envelope.command().and_then(str::parse::<Command>) {
            Ok(command) => command,
            Err(e) => {
                reject(message, envelope.raw_command(), &e);
                return;
            }
        };

        let connection = self.pool.acquire();
        match command.submit(connection, &envelope, &self.workers) {
            Err(e) => reject(message, envelope.raw_command(), &e),
            Ok(mut handle) => match handle.try_take() {
                Some(result) => settle(command, &envelope, message, Some(result)),
                None => self.track(ctx, command, envelope, message, handle),
            },
        }
    }

    fn track(
        &mut self,
        ctx: &mut BusContext,
        command: Command,
        envelope: Envelope,
        message: BusMessage,
        handle: OpHandle,
    ) {
        self.next_id += 1;
        debug!("Tracking {} as operation #{}", command, self.next_id);
        self.pending.push(PendingOperation {
            id: self.next_id,
            command,
            envelope,
            message,
            handle,
            submitted_at: Instant::now(),
        });

        if self.timer.is_none() {
            self.timer = Some(ctx.set_periodic(self.settings.task_check_interval));
        }
    }

    /// One reconciliation pass. Finished operations are answered with their
    /// result; operations older than the timeout are cancelled and answered
    /// with a timeout. A result that is ready wins over an expired deadline.
    pub(crate) fn reconcile(&mut self, ctx: &mut BusContext, now: Instant) {
        let mut index = 0;
        while index < self.pending.len() {
            let entry = &mut self.pending[index];
            let outcome = match entry.handle.try_take() {
                Some(result) => Some(Some(result)),
                None if now.saturating_duration_since(entry.submitted_at)
                    >= self.settings.operation_timeout =>
                {
                    Some(None)
                }
                None => None,
            };

            match outcome {
                Some(outcome) => {
                    let entry = self.pending.swap_remove(index);
                    self.finish(entry, outcome);
                }
                None => index += 1,
            }
        }

        if self.pending.is_empty()
            && let Some(timer) = self.timer.take()
        {
            ctx.cancel_timer(timer);
            debug!("No operations in flight, reconciliation paused");
        }
    }

    fn finish(&self, entry: PendingOperation, outcome: Option<OpResult>) {
        if outcome.is_none() {
            entry.handle.cancel();
            if entry.command.is_idempotent() {
                warn!("Operation #{} ({}) timed out", entry.id, entry.command);
            } else {
                warn!(
                    "Operation #{} ({}) timed out, its effect on the backend is unknown",
                    entry.id, entry.command
                );
            }
        }
        settle(entry.command, &entry.envelope, entry.message, outcome);
    }
}

/// Replies to a submitted command, unless the caller opted out.
fn settle(command: Command, envelope: &Envelope, message: BusMessage, outcome: Option<OpResult>) {
    if !command.always_replies() && !envelope.should_reply() {
        debug!("{} settled without reply", command);
        return;
    }

    let reply = match command.build_response(envelope, outcome) {
        Ok(body) => ok_reply(envelope.raw_command(), &body),
        Err(e) => error_reply(envelope.raw_command(), &e),
    };
    if !message.reply(reply) {
        debug!("Nobody waiting for the {} reply", command);
    }
}

/// Failures before anything reached the backend are always answered.
fn reject(message: BusMessage, command: Option<&str>, error: &Error) {
    debug!("Rejecting request: {}", error);
    message.reply(error_reply(command, error));
}

#[async_trait]
impl BusHandler for Dispatcher {
    async fn handle(&mut self, ctx: &mut BusContext, message: BusMessage) {
        self.dispatch(ctx, message);
    }

    async fn on_timer(&mut self, ctx: &mut BusContext, timer: TimerId) {
        if self.timer == Some(timer) {
            self.reconcile(ctx, Instant::now());
        }
    }

    async fn on_stop(&mut self, _ctx: &mut BusContext) {
        let abandoned = self.pending.len();
        for entry in self.pending.drain(..) {
            entry.handle.cancel();
        }
        self.timer = None;
        info!("Dispatcher stopped with {} operation(s) abandoned", abandoned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, Registration};
    use crate::domain::CacheValue;
    use crate::ports::{CacheConnection, OpValue, Operation};
    use crate::testkit::{Behaviour, ScriptedConnection};
    use serde_json::{Value, json};

    const ADDRESS: &str = "test.memcached";
    const WAIT: Duration = Duration::from_secs(2);

    fn settings(timeout_ms: u64) -> DispatchSettings {
        DispatchSettings {
            operation_timeout: Duration::from_millis(timeout_ms),
            task_check_interval: Duration::from_millis(5),
        }
    }

    fn dispatcher(connection: Arc<ScriptedConnection>, timeout_ms: u64) -> Dispatcher {
        let pool = ConnectionPool::new(vec![connection as Arc<dyn CacheConnection>]).unwrap();
        Dispatcher::new(
            Arc::new(pool),
            QueryWorkers::new(1, Duration::from_millis(100)),
            settings(timeout_ms),
        )
    }

    fn serve(connection: Arc<ScriptedConnection>, timeout_ms: u64) -> (EventBus, Registration) {
        let bus = EventBus::new();
        let registration = bus
            .register_handler(ADDRESS, dispatcher(connection, timeout_ms))
            .unwrap();
        (bus, registration)
    }

    async fn ask(bus: &EventBus, body: Value) -> Value {
        bus.request_timeout(ADDRESS, body, WAIT).await.unwrap()
    }

    #[tokio::test]
    async fn test_missing_command_is_rejected() {
        let connection = Arc::new(ScriptedConnection::new(Behaviour::Immediate));
        let (bus, _registration) = serve(connection.clone(), 1_000);

        for body in [json!({"key": "k"}), json!({"command": ""}), json!("set")] {
            let reply = ask(&bus, body).await;
            assert_eq!(reply["status"], json!("error"));
            assert_eq!(
                reply["message"],
                json!("\"command\" property is mandatory for request")
            );
        }
        assert!(connection.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_command_is_rejected() {
        let connection = Arc::new(ScriptedConnection::new(Behaviour::Immediate));
        let (bus, _registration) = serve(connection.clone(), 1_000);

        let reply = ask(&bus, json!({"command": "frob"})).await;
        assert_eq!(
            reply,
            json!({"status": "error", "command": "frob", "message": "unknown command: 'frob'"})
        );
        assert!(connection.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_validation_errors_reply_even_without_should_reply() {
        let connection = Arc::new(ScriptedConnection::new(Behaviour::Immediate));
        let (bus, _registration) = serve(connection.clone(), 1_000);

        let reply = ask(&bus, json!({"command": "set", "value": 1})).await;
        assert_eq!(reply["status"], json!("error"));
        assert!(reply["message"].as_str().unwrap().contains("'key'"));

        let reply = ask(&bus, json!({"command": "INCR", "key": "n"})).await;
        assert!(reply["message"].as_str().unwrap().contains("'by'"));
        assert!(connection.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_mutation_replies_only_when_asked() {
        let connection = Arc::new(ScriptedConnection::new(Behaviour::Immediate));
        let (bus, _registration) = serve(connection.clone(), 1_000);

        let reply = ask(
            &bus,
            json!({"command": "set", "key": "k", "value": "v", "shouldReply": true}),
        )
        .await;
        assert_eq!(
            reply,
            json!({"status": "ok", "command": "set", "response": {"data": {}, "success": true}})
        );

        let silent = bus
            .request_timeout(
                ADDRESS,
                json!({"command": "set", "key": "k", "value": "v"}),
                WAIT,
            )
            .await;
        assert_eq!(silent, Err(Error::NoReply(ADDRESS.to_string())));
        assert_eq!(connection.submitted().len(), 2);
    }

    #[tokio::test]
    async fn test_reads_always_reply() {
        let connection = Arc::new(ScriptedConnection::new(Behaviour::Immediate).responding(
            |operation| match operation {
                Operation::Get { .. } => Ok(OpValue::Fetched(Some(CacheValue::Int(9)))),
                _ => Ok(OpValue::Stored(true)),
            },
        ));
        let (bus, _registration) = serve(connection, 1_000);

        let reply = ask(&bus, json!({"command": "get", "key": "k", "shouldReply": false})).await;
        assert_eq!(reply["response"]["data"], json!({"key": "k", "value": 9}));
    }

    #[tokio::test]
    async fn test_deferred_result_arrives_through_reconciliation() {
        let connection = Arc::new(
            ScriptedConnection::new(Behaviour::Deferred(Duration::from_millis(30))).responding(
                |_| Ok(OpValue::Counter(Some(5))),
            ),
        );
        let (bus, _registration) = serve(connection, 1_000);

        let reply = ask(&bus, json!({"command": "incr", "key": "n", "by": 1, "shouldReply": true})).await;
        assert_eq!(reply["response"]["data"], json!({"new_value": 5}));
    }

    #[tokio::test]
    async fn test_stuck_operation_times_out_once() {
        let connection = Arc::new(ScriptedConnection::new(Behaviour::Park));
        let (bus, _registration) = serve(connection.clone(), 40);

        let reply = ask(&bus, json!({"command": "get", "key": "slow"})).await;
        assert_eq!(
            reply,
            json!({"status": "error", "command": "get", "message": "operation 'get' timed out"})
        );
        assert_eq!(connection.parked_cancelled(), vec![true]);
    }

    #[tokio::test]
    async fn test_late_result_after_timeout_is_never_delivered() {
        let connection = Arc::new(
            ScriptedConnection::new(Behaviour::Deferred(Duration::from_millis(150)))
                .responding(|_| Ok(OpValue::Counter(Some(8)))),
        );
        let (bus, _registration) = serve(connection, 40);

        let reply = ask(
            &bus,
            json!({"command": "incr", "key": "n", "by": 1, "shouldReply": true}),
        )
        .await;
        assert_eq!(reply["message"], json!("operation 'incr' timed out"));

        // the backend finishes after the deadline; the address keeps working
        tokio::time::sleep(Duration::from_millis(200)).await;
        let reply = ask(&bus, json!({"command": "status"})).await;
        assert_eq!(reply["status"], json!("ok"));
    }

    #[tokio::test]
    async fn test_completion_after_timeout_finds_nobody() {
        let connection = Arc::new(ScriptedConnection::new(Behaviour::Park));
        let mut dispatcher = dispatcher(connection.clone(), 10);
        let mut ctx = BusContext::detached(ADDRESS);

        let (message, reply) = BusMessage::with_reply(
            ADDRESS,
            json!({"command": "incr", "key": "n", "by": 1, "shouldReply": true}),
        );
        dispatcher.dispatch(&mut ctx, message);
        dispatcher.reconcile(&mut ctx, Instant::now() + Duration::from_secs(1));

        assert_eq!(dispatcher.pending_len(), 0);
        assert!(!dispatcher.is_scanning());
        let reply = reply.await.unwrap();
        assert_eq!(reply["message"], json!("operation 'incr' timed out"));

        let completers = connection.take_parked();
        assert_eq!(completers.len(), 1);
        for completer in completers {
            assert!(completer.is_cancelled());
            assert!(!completer.complete(Ok(OpValue::Counter(Some(2)))));
        }

        dispatcher.reconcile(&mut ctx, Instant::now() + Duration::from_secs(2));
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_slow_status_does_not_stall_the_bus() {
        let connection = Arc::new(
            ScriptedConnection::new(Behaviour::Immediate)
                .with_query_delay(Duration::from_millis(400)),
        );
        let (bus, _registration) = serve(connection, 1_000);

        let mut statuses = Vec::new();
        for _ in 0..4 {
            statuses.push(bus.request(ADDRESS, json!({"command": "status"})).await.unwrap());
        }

        let started = Instant::now();
        let reply = ask(&bus, json!({"command": "get", "key": "k"})).await;
        assert_eq!(reply["status"], json!("ok"));
        assert!(started.elapsed() < Duration::from_millis(80));

        for status in statuses {
            let reply = tokio::time::timeout(WAIT, status).await.unwrap().unwrap();
            assert_eq!(reply["message"], json!("operation 'status' timed out"));
        }
    }

    #[tokio::test]
    async fn test_reconcile_prefers_result_over_deadline() {
        let connection = Arc::new(ScriptedConnection::new(Behaviour::Park));
        let mut dispatcher = dispatcher(connection, 10);
        let mut ctx = BusContext::detached(ADDRESS);

        let (message, reply) = BusMessage::with_reply(
            ADDRESS,
            json!({"command": "delete", "key": "k", "shouldReply": true}),
        );
        dispatcher.dispatch(&mut ctx, message);
        assert_eq!(dispatcher.pending_len(), 1);
        assert!(dispatcher.is_scanning());

        // finish the parked operation by hand, then scan long after the deadline
        let (completer, handle) = OpHandle::channel();
        completer.complete(Ok(OpValue::Stored(true)));
        dispatcher.pending[0].handle = handle;
        dispatcher.reconcile(&mut ctx, Instant::now() + Duration::from_secs(60));

        assert_eq!(dispatcher.pending_len(), 0);
        assert!(!dispatcher.is_scanning());
        let reply = reply.await.unwrap();
        assert_eq!(reply["response"]["success"], json!(true));
    }

    #[tokio::test]
    async fn test_reconcile_keeps_operations_within_deadline() {
        let connection = Arc::new(ScriptedConnection::new(Behaviour::Park));
        let mut dispatcher = dispatcher(connection.clone(), 10_000);
        let mut ctx = BusContext::detached(ADDRESS);

        for key in ["a", "b", "c"] {
            let message = BusMessage::new(ADDRESS, json!({"command": "touch", "key": key, "exp": 5}));
            dispatcher.dispatch(&mut ctx, message);
        }
        dispatcher.reconcile(&mut ctx, Instant::now());
        assert_eq!(dispatcher.pending_len(), 3);

        dispatcher.reconcile(&mut ctx, Instant::now() + Duration::from_secs(11));
        assert_eq!(dispatcher.pending_len(), 0);
        assert_eq!(connection.parked_cancelled(), vec![true, true, true]);
    }
}
