//! Fan-out event bus for push observers

use media_sync_core::MediaEvent;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Default number of events buffered per observer before it starts lagging
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Best-effort broadcaster for device, sync and download events.
///
/// Delivery is at-most-once with no replay: an observer only sees events
/// published after it subscribed. Events from one publisher reach each
/// observer in publish order. Dropped observers are removed by the channel
/// itself on the next send.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MediaEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to every current observer, returning how many received it
    pub fn publish(&self, event: MediaEvent) -> usize {
        let name = event.name();
        match self.sender.send(event) {
            Ok(observers) => {
                trace!(event = name, observers, "Event published");
                observers
            }
            // No observers connected
            Err(_) => 0,
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// One observer's view of the bus
#[derive(Debug)]
pub struct EventSubscription {
    receiver: broadcast::Receiver<MediaEvent>,
}

impl EventSubscription {
    /// Next event, skipping over anything lost while this observer lagged.
    /// Returns `None` once every publisher is gone.
    pub async fn next(&mut self) -> Option<MediaEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event observer lagged, some events were dropped");
                    continue;
                }
            }
        }
    }

    /// Non-blocking poll, used by tests and drain loops
    pub fn try_next(&mut self) -> Option<MediaEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
