//! Observer fan-out for push events

use tokio::sync::broadcast;
use tracing::debug;

use crate::event::PushEvent;
use crate::protocol::PUSH_BUFFER_CAPACITY;

/// Broadcast bus for UI-facing push events.
///
/// Publishing never blocks and never fails: with no subscribers the event
/// is dropped, and a slow subscriber sees `Lagged` rather than stalling
/// the control path.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PushEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(PUSH_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: PushEvent) {
        let name = event.name();
        match self.tx.send(event) {
            Ok(n) => debug!(event = name, subscribers = n, "Published push event"),
            Err(_) => debug!(event = name, "No subscribers for push event"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
