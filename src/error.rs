//! Error taxonomy for `redfleet` operations.

use thiserror::Error;

/// Error type for all `redfleet` operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Transport or protocol failure from the log service.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Payload encode/decode failure.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Invalid configuration supplied by the caller.
    #[error("configuration error: {0}")]
    Config(String),

    /// A stream entry does not carry a well-formed payload field.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Fleet reconciliation could not converge on the desired consumer count.
    #[error(
        "reconciliation failed for stream '{stream}' group '{group}': {reason} (run `XINFO CONSUMERS {stream} {group}` to inspect)"
    )]
    Reconciliation {
        stream: String,
        group: String,
        reason: String,
    },
}

/// Result type for all `redfleet` operations.
pub type BrokerResult<T> = Result<T, BrokerError>;
