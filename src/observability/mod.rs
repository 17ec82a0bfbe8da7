//! Observability: structured logging setup and span macros

pub mod logging;

pub use logging::{init_default_logging, init_env_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{connector_span, delivery_span};
