//! In-memory broker for testing
//!
//! [`MockBroker`] implements [`Broker`] without any network I/O. Tests can make
//! it refuse connections, drop the live connection, fail publishes and push
//! inbound messages to the consumers of the live session. Queues are routed
//! with AMQP topic-exchange semantics.

use crate::notifier::DeliveryError;
use crate::transport::{
    Broker, BrokerSession, DeliveryHandler, ExchangeSpec, InboundMessage, QueueSpec, ShutdownHook,
    TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A message the connector published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
    pub ttl: Duration,
}

/// A queue binding made by the connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Scripted publish failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishFailure {
    /// The connection dies during the publish
    ConnectionClosed,
    /// The publish fails but the connection stays up
    Transient,
}

struct Consumer {
    session: u64,
    queue: String,
    handler: DeliveryHandler,
}

#[derive(Default)]
struct BrokerInner {
    unreachable: bool,
    fail_setup: bool,
    publish_failures: VecDeque<PublishFailure>,
    next_session: u64,
    next_queue: u64,
    live: Option<(u64, ShutdownHook)>,
    opens: usize,
    closed_sessions: usize,
    exchanges: Vec<ExchangeSpec>,
    queues: Vec<(String, QueueSpec)>,
    bindings: Vec<Binding>,
    consumers: Vec<Consumer>,
    published: Vec<PublishedMessage>,
}

impl BrokerInner {
    fn is_live(&self, session: u64) -> bool {
        matches!(&self.live, Some((id, _)) if *id == session)
    }

    fn require_live(&self, session: u64) -> Result<(), TransportError> {
        if self.is_live(session) {
            Ok(())
        } else {
            Err(TransportError::AlreadyClosed)
        }
    }
}

/// Scriptable in-memory broker. Clones share state.
#[derive(Clone, Default)]
pub struct MockBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse (or accept again) new connections
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Make exchange declaration fail, after the connection itself opened
    pub fn set_fail_setup(&self, fail: bool) {
        self.lock().fail_setup = fail;
    }

    /// Fail the next publish in the given way
    pub fn fail_next_publish(&self, failure: PublishFailure) {
        self.lock().publish_failures.push_back(failure);
    }

    /// Kill the live connection as the broker would, firing its shutdown hook.
    /// Returns false if no connection was live.
    pub fn drop_connection(&self, reason: &str) -> bool {
        let live = self.lock().live.take();
        match live {
            Some((_, hook)) => {
                hook.notify(reason);
                true
            }
            None => false,
        }
    }

    /// Route a message to the consumers of the live session whose binding
    /// matches `routing_key`, returning one result per consumer invoked
    pub fn deliver(
        &self,
        routing_key: &str,
        payload: impl Into<Bytes>,
    ) -> Vec<Result<(), DeliveryError>> {
        let payload = payload.into();

        let handlers: Vec<DeliveryHandler> = {
            let inner = self.lock();
            let Some((live, _)) = &inner.live else {
                return Vec::new();
            };

            inner
                .consumers
                .iter()
                .filter(|consumer| consumer.session == *live)
                .filter(|consumer| {
                    inner.bindings.iter().any(|binding| {
                        binding.queue == consumer.queue
                            && topic_matches(&binding.routing_key, routing_key)
                    })
                })
                .map(|consumer| Arc::clone(&consumer.handler))
                .collect()
        };

        // Handlers run without the broker lock, as they would on a client thread
        handlers
            .iter()
            .map(|handler| {
                handler(InboundMessage {
                    routing_key: routing_key.to_string(),
                    payload: payload.clone(),
                })
            })
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().live.is_some()
    }

    /// Number of successful connection opens
    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    /// Number of sessions closed by the connector
    pub fn closed_count(&self) -> usize {
        self.lock().closed_sessions
    }

    pub fn exchanges(&self) -> Vec<ExchangeSpec> {
        self.lock().exchanges.clone()
    }

    pub fn queues(&self) -> Vec<(String, QueueSpec)> {
        self.lock().queues.clone()
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.lock().bindings.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Payloads of published messages, as UTF-8 text
    pub fn published_payloads(&self) -> Vec<String> {
        self.lock()
            .published
            .iter()
            .map(|message| String::from_utf8_lossy(&message.payload).into_owned())
            .collect()
    }
}

#[async_trait]
impl Broker for MockBroker {
    type Session = MockSession;

    async fn open(&self, hook: ShutdownHook) -> Result<MockSession, TransportError> {
        let mut inner = self.lock();
        if inner.unreachable {
            return Err(TransportError::ConnectionFailed(
                "Connection refused (mock broker unreachable)".into(),
            ));
        }

        inner.next_session += 1;
        let id = inner.next_session;
        inner.live = Some((id, hook));
        inner.opens += 1;

        Ok(MockSession {
            id,
            inner: Arc::clone(&self.inner),
        })
    }
}

/// Session handed out by [`MockBroker`]
pub struct MockSession {
    id: u64,
    inner: Arc<Mutex<BrokerInner>>,
}

impl MockSession {
    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BrokerSession for MockSession {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.require_live(self.id)?;
        if inner.fail_setup {
            return Err(TransportError::DeclarationFailed {
                what: format!("exchange {}", spec.name),
                source: "PRECONDITION_FAILED - inequivalent arg 'durable'".into(),
            });
        }
        inner.exchanges.push(spec.clone());
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String, TransportError> {
        let mut inner = self.lock();
        inner.require_live(self.id)?;

        let name = if spec.name.is_empty() {
            inner.next_queue += 1;
            format!("amq.gen-{}", inner.next_queue)
        } else {
            spec.name.clone()
        };
        inner.queues.push((name.clone(), spec.clone()));
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.require_live(self.id)?;
        inner.bindings.push(Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.require_live(self.id)?;
        inner.consumers.push(Consumer {
            session: self.id,
            queue: queue.to_string(),
            handler,
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        ttl: Duration,
    ) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.require_live(self.id)?;

        match inner.publish_failures.pop_front() {
            Some(PublishFailure::ConnectionClosed) => {
                // The client library notices the dead connection on publish
                inner.live = None;
                return Err(TransportError::AlreadyClosed);
            }
            Some(PublishFailure::Transient) => {
                return Err(TransportError::PublishFailed("channel flow paused".into()));
            }
            None => {}
        }

        inner.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: Bytes::copy_from_slice(payload),
            ttl,
        });
        Ok(())
    }

    async fn close(&self) {
        let mut inner = self.lock();
        if inner.is_live(self.id) {
            inner.live = None;
        }
        inner.consumers.retain(|consumer| consumer.session != self.id);
        inner.closed_sessions += 1;
    }
}

/// AMQP topic matching: `*` matches exactly one word, `#` zero or more
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) if word == "*" || word == first => {
                match_words(rest, key_rest)
            }
            _ => false,
        },
    }
}
