//! Event bus for progress reporting
//!
//! Tokio broadcast channel. Publishing never blocks and never fails for lack
//! of receivers; slow receivers lag and lose the oldest events instead of
//! holding up the request.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::{Phase, ProgressEvent};

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

pub struct EventBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish to all current subscribers. Returns the number reached.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        let phase = event.phase;
        match self.sender.send(event) {
            Ok(count) => {
                debug!(phase = %phase, receivers = count, "Progress published");
                count
            }
            Err(_) => {
                debug!(phase = %phase, "Progress published (no receivers)");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub source_name: Option<String>,
    pub phases: Option<Vec<Phase>>,
}

impl EventFilter {
    /// Matches everything
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, source_name: &str) -> Self {
        self.source_name = Some(source_name.to_string());
        self
    }

    pub fn phases(mut self, phases: Vec<Phase>) -> Self {
        self.phases = Some(phases);
        self
    }

    pub fn matches(&self, event: &ProgressEvent) -> bool {
        if let Some(ref name) = self.source_name {
            if &event.source_name != name {
                return false;
            }
        }

        if let Some(ref phases) = self.phases {
            if !phases.contains(&event.phase) {
                return false;
            }
        }

        true
    }
}

/// Receiver that only yields events matching its filter
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<ProgressEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    pub fn new(receiver: broadcast::Receiver<ProgressEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    pub async fn recv(&mut self) -> Result<ProgressEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}
