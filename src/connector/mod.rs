//! Publish/subscribe connector
//!
//! [`Connector`] is the handle the embedding application holds. It queues
//! outgoing messages, hands out the per-topic [`Notifier`]s and requests
//! shutdown. All broker I/O happens on the background [`driver::Driver`] task.

pub mod driver;
pub mod queue;
pub mod state;

pub use driver::{Driver, TickOutcome};
pub use queue::{OutgoingMessage, OutgoingQueue};
pub use state::{ConnectorState, ConnectorStatus, SharedState, TickAction};

use crate::config::{BridgeConfig, ConnectionConfig, DriverSettings};
use crate::error::{ConnectorError, ConnectorResult};
use crate::notifier::Notifier;
use crate::transport::amqp::AmqpBroker;
use crate::transport::{Broker, ExchangeSpec};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle to a running connector.
///
/// Creating one spawns the driver on the current tokio runtime; no network
/// I/O happens before the first tick. Dropping the handle requests shutdown.
pub struct Connector<B: Broker = AmqpBroker> {
    state: SharedState,
    notifiers: Arc<BTreeMap<String, Arc<Notifier>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    _broker: PhantomData<fn() -> B>,
}

impl Connector<AmqpBroker> {
    /// Connector for an AMQP endpoint with default driver timing
    pub fn new<I, S>(config: ConnectionConfig, topics: I) -> ConnectorResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let exchange = config.exchange_spec();
        Self::with_broker(
            AmqpBroker::new(config),
            exchange,
            DriverSettings::default(),
            topics,
        )
    }

    /// Connector described by a configuration file
    pub fn from_config(config: &BridgeConfig) -> ConnectorResult<Self> {
        let connection = config.connection_config()?;
        let exchange = connection.exchange_spec();
        Self::with_broker(
            AmqpBroker::new(connection),
            exchange,
            config.driver_settings(),
            config.connector.topics.iter().cloned(),
        )
    }
}

impl<B: Broker> Connector<B> {
    /// Connector on top of any [`Broker`] implementation
    pub fn with_broker<I, S>(
        broker: B,
        exchange: ExchangeSpec,
        settings: DriverSettings,
        topics: I,
    ) -> ConnectorResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let runtime = Handle::try_current().map_err(|_| ConnectorError::NoRuntime)?;

        let notifiers: BTreeMap<String, Arc<Notifier>> = topics
            .into_iter()
            .map(Into::into)
            .map(|topic: String| (topic.clone(), Arc::new(Notifier::new(topic))))
            .collect();
        let notifiers = Arc::new(notifiers);

        info!(
            exchange = %exchange.name,
            topics = ?notifiers.keys().collect::<Vec<_>>(),
            "Starting connector"
        );

        let state = SharedState::default();
        let driver = Driver::new(
            broker,
            exchange,
            settings,
            Arc::clone(&notifiers),
            state.clone(),
        );
        let handle = runtime.spawn(driver.run());

        Ok(Self {
            state,
            notifiers,
            driver: Mutex::new(Some(handle)),
            _broker: PhantomData,
        })
    }

    /// Queue a message for publishing. Returns immediately; the driver sends
    /// one queued message per tick while connected.
    pub fn send_message(&self, topic: &str, payload: impl Into<Bytes>) -> ConnectorResult<()> {
        let message = OutgoingMessage::new(topic, payload);
        let bytes = message.payload.len();
        self.state.lock().enqueue(message)?;
        debug!(topic = %topic, bytes, "Message queued");
        Ok(())
    }

    /// Listener registry for a topic given at construction
    pub fn notifier(&self, topic: &str) -> ConnectorResult<Arc<Notifier>> {
        if self.state.lock().is_closed() {
            return Err(ConnectorError::Closed);
        }

        self.notifiers
            .get(topic)
            .cloned()
            .ok_or_else(|| ConnectorError::UnknownTopic(topic.to_string()))
    }

    /// Request shutdown. The driver closes the connection on its next tick.
    pub fn close(&self) {
        if self.state.lock().request_close() {
            info!("Connector close requested");
        }
    }

    /// Wait until the driver has stopped. Requires [`Connector::close`] to
    /// have been called, otherwise it waits forever.
    pub async fn wait_closed(&self) {
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Connector driver ended abnormally");
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().is_closed()
    }

    pub fn status(&self) -> ConnectorStatus {
        self.state.lock().status()
    }

    /// Topics in sorted order
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.notifiers.keys().map(String::as_str)
    }
}

impl<B: Broker> Drop for Connector<B> {
    fn drop(&mut self) {
        self.state.lock().request_close();
    }
}

impl<B: Broker> std::fmt::Debug for Connector<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("topics", &self.notifiers.keys().collect::<Vec<_>>())
            .field("status", &self.status())
            .finish()
    }
}
