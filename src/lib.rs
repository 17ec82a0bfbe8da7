//! AMQP Math Connector
//!
//! A resilient publish/subscribe bridge between an application and an AMQP
//! 0-9-1 topic exchange (RabbitMQ).
//!
//! # Overview
//!
//! - [`Connector`] queues outgoing messages and publishes them one per driver
//!   tick, reconnecting on its own after failures
//! - [`Notifier`] fans inbound messages for one topic out to listeners
//! - [`ConnectionConfig`] describes the broker endpoint and builds its URL
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use amqp_math_connector::{ConnectionConfig, Connector};
//!
//! # tokio_test::block_on(async {
//! let config = ConnectionConfig::new("localhost", "math", "guest", "guest");
//! let connector = Connector::new(config, ["plant.temperature"])?;
//!
//! connector
//!     .notifier("plant.temperature")?
//!     .add_listener(|event| {
//!         println!("{}: {:?}", event.routing_key, event.payload);
//!         Ok(())
//!     });
//!
//! connector.send_message("plant.temperature", "21.5")?;
//!
//! connector.close();
//! connector.wait_closed().await;
//! # Ok::<(), amqp_math_connector::ConnectorError>(())
//! # });
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod notifier;
pub mod observability;
pub mod testing;
pub mod transport;

pub use config::{BridgeConfig, ConfigError, ConnectionConfig, DriverSettings};
pub use connector::{Connector, ConnectorStatus};
pub use error::{ConnectorError, ConnectorResult};
pub use notifier::{DeliveryError, ListenerError, ListenerId, MessageReceivedEvent, Notifier};
pub use transport::amqp::AmqpBroker;
