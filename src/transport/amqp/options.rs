//! Pure option mapping for the `lapin` transport
//!
//! Nothing in here touches the network, so every decision about how exchanges,
//! queues and messages are declared can be unit tested.

use crate::transport::{ExchangeSpec, QueueSpec, TransportError};
use lapin::options::{BasicConsumeOptions, ExchangeDeclareOptions, QueueDeclareOptions};
use lapin::types::ShortString;
use lapin::BasicProperties;
use std::time::Duration;

/// Reply code sent with a normal channel/connection close
pub const CLOSE_REPLY_SUCCESS: u16 = 200;
pub const CLOSE_REPLY_TEXT: &str = "Connector closing";

/// Exchange options for a declaration spec
pub fn exchange_declare_options(spec: &ExchangeSpec) -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: spec.durable,
        auto_delete: spec.auto_delete,
        ..ExchangeDeclareOptions::default()
    }
}

/// Queue options for a declaration spec
pub fn queue_declare_options(spec: &QueueSpec) -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: spec.durable,
        exclusive: spec.exclusive,
        auto_delete: spec.auto_delete,
        ..QueueDeclareOptions::default()
    }
}

/// Consumers acknowledge automatically; there is no manual ack/nack
pub fn consume_options() -> BasicConsumeOptions {
    BasicConsumeOptions {
        no_ack: true,
        ..BasicConsumeOptions::default()
    }
}

/// AMQP `expiration` value: the TTL in whole milliseconds, as a string
pub fn expiration_millis(ttl: Duration) -> String {
    ttl.as_millis().to_string()
}

/// Publish properties carrying the message TTL
pub fn publish_properties(ttl: Duration) -> BasicProperties {
    BasicProperties::default().with_expiration(ShortString::from(expiration_millis(ttl)))
}

/// Whether a `lapin` error means the channel or connection is no longer usable
pub fn is_closed_error(error: &lapin::Error) -> bool {
    matches!(
        error,
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_)
    )
}

/// Map a publish error, keeping "already closed" distinguishable
pub fn publish_error(error: lapin::Error) -> TransportError {
    if is_closed_error(&error) {
        TransportError::AlreadyClosed
    } else {
        TransportError::PublishFailed(Box::new(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_options_follow_spec() {
        let options = exchange_declare_options(&ExchangeSpec {
            name: "ex".to_string(),
            durable: true,
            auto_delete: false,
        });
        assert!(options.durable);
        assert!(!options.auto_delete);
        assert!(!options.passive);

        let options = exchange_declare_options(&ExchangeSpec {
            name: "ex".to_string(),
            durable: false,
            auto_delete: true,
        });
        assert!(!options.durable);
        assert!(options.auto_delete);
    }

    #[test]
    fn test_temporary_queue_options() {
        let options = queue_declare_options(&QueueSpec::exclusive_temporary());
        assert!(!options.durable);
        assert!(options.exclusive);
        assert!(options.auto_delete);
        assert!(!options.passive);
    }

    #[test]
    fn test_consume_is_auto_ack() {
        assert!(consume_options().no_ack);
    }

    #[test]
    fn test_expiration_is_fifteen_minutes_in_millis() {
        assert_eq!(expiration_millis(Duration::from_secs(15 * 60)), "900000");
        assert_eq!(expiration_millis(Duration::from_millis(1500)), "1500");
    }

    #[test]
    fn test_publish_properties_carry_expiration() {
        let props = publish_properties(Duration::from_secs(900));
        let expiration = props.expiration().as_ref().map(|e| e.as_str().to_string());
        assert_eq!(expiration.as_deref(), Some("900000"));
    }

    #[test]
    fn test_io_error_is_not_closed_error() {
        let error = lapin::Error::IOError(std::sync::Arc::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert!(!is_closed_error(&error));
        assert!(matches!(publish_error(error), TransportError::PublishFailed(_)));
    }
}
