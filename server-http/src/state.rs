use carbon::bus::EventBus;
use std::time::Duration;

/// Server state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub bus: EventBus,
    /// How long a request waits for the handler's reply.
    pub reply_timeout: Duration,
}

impl AppState {
    pub fn new(bus: EventBus, reply_timeout: Duration) -> Self {
        Self { bus, reply_timeout }
    }
}
