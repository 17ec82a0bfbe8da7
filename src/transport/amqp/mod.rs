//! AMQP 0-9-1 transport built on `lapin`
//!
//! - [`options`] - pure mapping from our declaration specs to `lapin` options,
//!   publish properties and error classification
//! - [`session`] - impure I/O: connection, channel, consumers and publishing

pub mod options;
pub mod session;

pub use session::{AmqpBroker, AmqpSession};
