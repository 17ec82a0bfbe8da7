//! Error types for connector operations
//!
//! Only caller misuse is surfaced synchronously through [`ConnectorError`].
//! Broker and network failures stay inside the driver, which logs them through
//! [`redact_credentials`] and retries.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Errors returned to the embedding application
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Connector has already been closed")]
    Closed,

    #[error("Unknown topic \"{0}\" - topics must be given when the connector is created")]
    UnknownTopic(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("No tokio runtime available to drive the connector")]
    NoRuntime,
}

/// Result type for connector operations
pub type ConnectorResult<T> = Result<T, ConnectorError>;

static URL_CREDENTIALS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<prefix>[a-zA-Z][a-zA-Z0-9+.-]*://[^:/@\s]*:)[^@\s]*@")
        .expect("credential pattern is valid")
});

static SECRET_PAIRS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?P<key>password|passwd|pwd)(?P<sep>\s*[=:]\s*)\S+")
        .expect("secret pattern is valid")
});

/// Mask passwords in connection URLs and `password=...` pairs before logging
pub fn redact_credentials(message: &str) -> String {
    let redacted = URL_CREDENTIALS.replace_all(message, "${prefix}***@");
    SECRET_PAIRS
        .replace_all(&redacted, "${key}${sep}***")
        .into_owned()
}
