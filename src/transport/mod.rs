//! Transport layer for broker communication
//!
//! The connector only talks to the message bus through the narrow capability
//! set defined here: open a session, declare an exchange and queues, bind,
//! consume, publish and close. [`amqp`] implements it on top of `lapin`; the
//! testing module provides an in-memory implementation.

use crate::notifier::DeliveryError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod amqp;

/// Boxed error from the underlying client library
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Broker transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] BoxError),
    #[error("Declaring {what} failed: {source}")]
    DeclarationFailed {
        what: String,
        #[source]
        source: BoxError,
    },
    #[error("Consuming from queue {queue} failed: {source}")]
    ConsumeFailed {
        queue: String,
        #[source]
        source: BoxError,
    },
    #[error("Publishing failed: {0}")]
    PublishFailed(#[source] BoxError),
    #[error("Connection is already closed")]
    AlreadyClosed,
}

impl TransportError {
    /// Whether the error means the session is gone and must be reopened
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, TransportError::AlreadyClosed)
    }
}

/// Exchange declaration parameters. The exchange kind is always `topic`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
}

/// Queue declaration parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Empty name lets the broker generate one
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    /// Server-named queue private to this connection, removed when unused
    pub fn exclusive_temporary() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// A message delivered by the broker to one of our consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Routing key as reported by the broker
    pub routing_key: String,
    pub payload: Bytes,
}

/// Callback invoked for every inbound delivery on a consumed queue
pub type DeliveryHandler = Arc<dyn Fn(InboundMessage) -> Result<(), DeliveryError> + Send + Sync>;

/// Events posted by a session to the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The connection or channel shut down without being asked to
    Lost { generation: u64, reason: String },
}

/// Shutdown hook handed to a session when it is opened.
///
/// The client library may call [`ShutdownHook::notify`] from any thread; the
/// event is queued and handled by the driver on its next tick.
#[derive(Debug, Clone)]
pub struct ShutdownHook {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ShutdownHook {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { generation, tx }
    }

    /// Generation of the session this hook belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report that the session has shut down
    pub fn notify(&self, reason: impl Into<String>) {
        // The driver may already be gone, in which case nobody cares
        let _ = self.tx.send(SessionEvent::Lost {
            generation: self.generation,
            reason: reason.into(),
        });
    }
}

/// Factory for broker sessions
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Session: BrokerSession;

    /// Open a connection and a channel on it, registering `hook` for
    /// unexpected shutdowns of either
    async fn open(&self, hook: ShutdownHook) -> Result<Self::Session, TransportError>;
}

/// An open connection/channel pair
#[async_trait]
pub trait BrokerSession: Send + Sync + 'static {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError>;

    /// Declare a queue and return its (possibly broker-generated) name
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String, TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Start consuming with automatic acknowledgement
    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<(), TransportError>;

    /// Publish a message with the given time-to-live
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        ttl: Duration,
    ) -> Result<(), TransportError>;

    /// Close channel and connection, ignoring errors
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_temporary_queue_spec() {
        let spec = QueueSpec::exclusive_temporary();
        assert!(spec.name.is_empty());
        assert!(!spec.durable);
        assert!(spec.exclusive);
        assert!(spec.auto_delete);
    }

    #[test]
    fn test_only_already_closed_means_connection_closed() {
        assert!(TransportError::AlreadyClosed.is_connection_closed());
        assert!(!TransportError::PublishFailed("boom".into()).is_connection_closed());
        assert!(!TransportError::ConnectionFailed("refused".into()).is_connection_closed());
    }

    #[tokio::test]
    async fn test_shutdown_hook_posts_event_with_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hook = ShutdownHook::new(7, tx);

        hook.notify("broker went away");

        assert_eq!(hook.generation(), 7);
        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::Lost {
                generation: 7,
                reason: "broker went away".to_string(),
            })
        );
    }

    #[test]
    fn test_shutdown_hook_survives_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        ShutdownHook::new(1, tx).notify("nobody listening");
    }
}
