//! Integration tests for connector startup when the broker is down
//!
//! Uses the real AMQP transport against a port nothing listens on:
//! - construction succeeds without touching the network
//! - sending keeps working and queues messages
//! - the driver keeps retrying and never surfaces the failure to callers


use amqp_math_connector::transport::amqp::AmqpBroker;
use amqp_math_connector::{ConnectionConfig, Connector};
use std::time::Duration;
use test_helpers::{eventually, fast_settings};
use tokio::time::timeout;

fn unreachable_config() -> ConnectionConfig {
    let mut config = ConnectionConfig::new("127.0.0.1", "math", "guest", "guest");
    config.set_secure(false);
    config.set_port(1);
    config
}

#[tokio::test]
async fn test_connector_starts_and_queues_when_broker_unavailable() {
    // Arrange
    let config = unreachable_config();
    let exchange = config.exchange_spec();

    // Act: creating the connector does no network I/O
    let connector = Connector::with_broker(
        AmqpBroker::new(config),
        exchange,
        fast_settings(),
        ["plant.temperature"],
    )
    .expect("Construction should succeed even if the broker is down");

    connector
        .send_message("plant.temperature", "21.5")
        .expect("Sending should succeed even if the broker is down");

    // Assert: attempts fail, the message waits
    eventually("a failed connection attempt", || {
        let status = connector.status();
        status.connect_attempts >= 1 && status.retry_countdown > 0
    })
    .await;

    let status = connector.status();
    assert!(!status.is_open);
    assert_eq!(status.queued_messages, 1);
    assert_eq!(status.messages_published, 0);
    assert!(connector.notifier("plant.temperature").is_ok());

    connector.close();
    timeout(Duration::from_secs(5), connector.wait_closed())
        .await
        .expect("Close should finish while disconnected");
}

#[tokio::test]
async fn test_default_connector_uses_real_settings() {
    let connector = Connector::new(unreachable_config(), ["a", "b"]).unwrap();

    assert_eq!(connector.topics().collect::<Vec<_>>(), vec!["a", "b"]);
    assert!(!connector.is_open());

    connector.close();
    // First tick fires immediately and sees the close request
    timeout(Duration::from_secs(5), connector.wait_closed())
        .await
        .expect("Close should finish on the first tick");
}
