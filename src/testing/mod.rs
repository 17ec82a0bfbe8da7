//! Testing utilities and mock implementations
//!
//! An in-memory broker for exercising the connector without a RabbitMQ
//! server.

pub mod mocks;

pub use mocks::*;
