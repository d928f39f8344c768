//! Event bus — broadcast channel carrying protocol events to the transport.
//!
//! The bus connects the flow executor (producer) to the request handler and
//! SSE streams (consumers). Delivery order is publish order; the bus imposes
//! no ordering of its own. Once [`finished`](EventBus::finished) is called,
//! further publishes are dropped with a warning and consumers observe the
//! closed channel after draining buffered events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::types::StreamResponse;

/// Default channel capacity for the event bus.
const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast bus for A2A protocol events (`task`, `status-update`,
/// `message`, `artifact-update`).
///
/// Cloning is cheap; all clones publish into and close the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StreamResponse>,
    finished: Arc<AtomicBool>,
}

impl EventBus {
    /// Create a bus with the given buffered capacity.
    ///
    /// The capacity bounds how far a slow consumer can lag before it starts
    /// missing events (`RecvError::Lagged`).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be greater than 0");
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a bus with the default capacity (1024).
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Subscribe to events published after this call. Multiple subscribers
    /// each receive an independent copy.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamResponse> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers.
    ///
    /// Events published after [`finished`](EventBus::finished) are silently
    /// dropped (with a warning). A publish with no live subscribers is not
    /// an error — the consumer may not have attached yet or may have
    /// disconnected.
    pub fn publish(&self, event: StreamResponse) {
        if self.finished.load(Ordering::Acquire) {
            warn!("Event bus is finished. Event will not be published.");
            return;
        }

        match self.tx.send(event) {
            Ok(count) => {
                debug!(subscriber_count = count, "Published event to bus");
            }
            Err(_) => {
                debug!("Published event with no subscribers");
            }
        }
    }

    /// Signal that no further events will be published, letting the
    /// transport close its stream after draining.
    pub fn finished(&self) {
        debug!("Event bus finished");
        self.finished.store(true, Ordering::Release);
    }

    /// Whether [`finished`](EventBus::finished) has been called.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
