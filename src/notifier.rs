//! Per-topic listener registry
//!
//! A [`Notifier`] exists for every topic the connector subscribes to. The
//! embedding application registers listeners on it; inbound messages are
//! delivered to a snapshot of the listener list, so listeners may add or remove
//! listeners (including themselves) while a delivery is in progress.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Event handed to listeners when a message arrives from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReceivedEvent {
    /// Topic of the notifier delivering the event
    pub topic: String,
    /// Routing key as reported by the broker. Differs from `topic` when the
    /// topic is a pattern such as `plant.*`.
    pub routing_key: String,
    pub payload: Bytes,
}

/// Failure reported by a listener
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ListenerError {
    message: String,
}

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// One or more listeners failed while a message was delivered
#[derive(Debug, Error)]
#[error("{} listener(s) failed for topic \"{topic}\": {}", .failures.len(), summarize(.failures))]
pub struct DeliveryError {
    pub topic: String,
    pub failures: Vec<ListenerError>,
}

fn summarize(failures: &[ListenerError]) -> String {
    failures
        .iter()
        .map(ListenerError::message)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Listener callback
pub type Listener = Arc<dyn Fn(&MessageReceivedEvent) -> Result<(), ListenerError> + Send + Sync>;

/// Handle returned by [`Notifier::add_listener`], used to remove the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Listener registry for one topic
pub struct Notifier {
    topic: String,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl Notifier {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Register a listener. Listeners are invoked in registration order.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&MessageReceivedEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock_listeners().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock_listeners();
        match listeners.iter().position(|(existing, _)| *existing == id) {
            Some(index) => {
                listeners.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock_listeners().len()
    }

    /// Deliver a message to every listener registered when the call started.
    ///
    /// A failing listener does not stop the others; all failures are returned
    /// together.
    pub fn deliver(&self, routing_key: &str, payload: Bytes) -> Result<(), DeliveryError> {
        let snapshot: Vec<Listener> = self
            .lock_listeners()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        let event = MessageReceivedEvent {
            topic: self.topic.clone(),
            routing_key: routing_key.to_string(),
            payload,
        };

        let failures: Vec<ListenerError> = snapshot
            .iter()
            .filter_map(|listener| listener(&event).err())
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DeliveryError {
                topic: self.topic.clone(),
                failures,
            })
        }
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<(ListenerId, Listener)>> {
        // A panicking listener never runs under this lock
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("topic", &self.topic)
            .field("listeners", &self.listener_count())
            .finish()
    }
}
