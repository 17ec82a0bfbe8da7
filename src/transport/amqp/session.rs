//! Impure I/O operations for the AMQP transport
//!
//! Opens connections and channels with `lapin`, wires the shutdown hook into
//! the library's error callbacks and turns consumer deliveries into
//! [`InboundMessage`]s for the connector.

use super::options::{
    consume_options, exchange_declare_options, is_closed_error, publish_error, publish_properties,
    queue_declare_options, CLOSE_REPLY_SUCCESS, CLOSE_REPLY_TEXT,
};
use crate::config::ConnectionConfig;
use crate::error::redact_credentials;
use crate::transport::{
    Broker, BrokerSession, DeliveryHandler, ExchangeSpec, InboundMessage, QueueSpec, ShutdownHook,
    TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use lapin::message::DeliveryResult;
use lapin::options::{BasicPublishOptions, QueueBindOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use std::time::Duration;
use tracing::{debug, warn};

/// Opens `lapin` sessions for one broker endpoint
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    config: ConnectionConfig,
}

impl AmqpBroker {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    type Session = AmqpSession;

    async fn open(&self, hook: ShutdownHook) -> Result<AmqpSession, TransportError> {
        let url = self
            .config
            .url()
            .map_err(|e| TransportError::ConnectionFailed(Box::new(e)))?;

        debug!(
            url = %redact_credentials(&url),
            generation = hook.generation(),
            "Opening AMQP connection"
        );

        let connection = Connection::connect(&url, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::ConnectionFailed(Box::new(e)))?;

        let connection_hook = hook.clone();
        connection.on_error(move |err| {
            connection_hook.notify(format!("connection error: {err}"));
        });

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(CLOSE_REPLY_SUCCESS, CLOSE_REPLY_TEXT).await;
                return Err(TransportError::ConnectionFailed(Box::new(e)));
            }
        };

        let channel_hook = hook;
        channel.on_error(move |err| {
            channel_hook.notify(format!("channel error: {err}"));
        });

        Ok(AmqpSession {
            connection,
            channel,
        })
    }
}

/// One `lapin` connection with a single channel on it
pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

impl AmqpSession {
    /// Turn a raw consumer delivery into a handler call
    async fn dispatch(delivery: DeliveryResult, handler: DeliveryHandler, queue: String) {
        let delivery = match delivery {
            Ok(Some(delivery)) => delivery,
            // Consumer cancelled
            Ok(None) => {
                debug!(queue = %queue, "Consumer cancelled");
                return;
            }
            Err(e) => {
                // The shutdown hook reports connection loss; nothing else to do here
                debug!(queue = %queue, error = %e, "Consumer stopped");
                return;
            }
        };

        let message = InboundMessage {
            routing_key: delivery.routing_key.as_str().to_string(),
            payload: Bytes::from(delivery.data),
        };

        if let Err(e) = handler(message) {
            // Auto-ack consumption has no negative acknowledgement to send back
            warn!(queue = %queue, error = %e, "Delivery failed in listener");
        }
    }
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError> {
        self.channel
            .exchange_declare(
                &spec.name,
                ExchangeKind::Topic,
                exchange_declare_options(spec),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::DeclarationFailed {
                what: format!("exchange {}", spec.name),
                source: Box::new(e),
            })
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String, TransportError> {
        let queue = self
            .channel
            .queue_declare(&spec.name, queue_declare_options(spec), FieldTable::default())
            .await
            .map_err(|e| TransportError::DeclarationFailed {
                what: "queue".to_string(),
                source: Box::new(e),
            })?;

        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::DeclarationFailed {
                what: format!("binding {queue} -> {exchange} ({routing_key})"),
                source: Box::new(e),
            })
    }

    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<(), TransportError> {
        let consumer = self
            .channel
            .basic_consume(queue, "", consume_options(), FieldTable::default())
            .await
            .map_err(|e| TransportError::ConsumeFailed {
                queue: queue.to_string(),
                source: Box::new(e),
            })?;

        let queue = queue.to_string();
        consumer.set_delegate(move |delivery: DeliveryResult| {
            Self::dispatch(delivery, handler.clone(), queue.clone())
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
        // Publisher confirms are not enabled, so the returned confirmation is
        // not awaited. A message published just before the connection dies
        // may or may not have reached the broker.
        let _confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                publish_properties(ttl),
            )
            .await
            .map_err(publish_error)?;

        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self
            .channel
            .close(CLOSE_REPLY_SUCCESS, CLOSE_REPLY_TEXT)
            .await
        {
            if !is_closed_error(&e) {
                debug!(error = %e, "Ignoring error while closing channel");
            }
        }

        if let Err(e) = self
            .connection
            .close(CLOSE_REPLY_SUCCESS, CLOSE_REPLY_TEXT)
            .await
        {
            if !is_closed_error(&e) {
                debug!(error = %e, "Ignoring error while closing connection");
            }
        }
    }
}
