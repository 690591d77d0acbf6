//! The producer (spec §4.3): the only component that appends to a stream.

use redis::Commands;
use serde::Serialize;
use tracing::{debug, error};

use crate::error::BrokerResult;
use crate::log::LogCommands;
use crate::naming::stream_name;
use crate::state::StateManagerCommands;

/// The field name under which a message's JSON payload is stored.
pub const MSG_KEY_FIELD: &str = "msgKey";

/// Configuration for a single producer (spec §4.3).
#[derive(Clone)]
pub struct ProducerConfig {
    msg_key: String,
    max_length: Option<i64>,
    state_initializer: bool,
}

impl ProducerConfig {
    /// `max_length <= 0` is treated as "no trim", matching the source's
    /// convention for an unset optional bound.
    pub fn new(msg_key: &str, max_length: i64, state_initializer: bool) -> ProducerConfig {
        ProducerConfig {
            msg_key: msg_key.to_owned(),
            max_length: if max_length > 0 { Some(max_length) } else { None },
            state_initializer,
        }
    }

    pub fn stream_name(&self) -> String {
        stream_name(&self.msg_key)
    }
}

/// The id and stream a message was appended to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub stream: String,
    pub msg_id: String,
}

/// Appends JSON-serialized values to a single stream.
pub struct Producer {
    config: ProducerConfig,
}

impl Producer {
    pub fn new(config: ProducerConfig) -> Producer {
        Producer { config }
    }

    /// Serialize `value`, append it to the configured stream, record it as
    /// known in the state manager (if configured), and trim the stream to
    /// `maxLength` (if configured). Any failure at any of these stages
    /// propagates as a single error; the producer does not retry internally.
    pub fn send<C, T>(&self, conn: &mut C, value: &T) -> BrokerResult<SendOutcome>
    where
        C: Commands + redis::ConnectionLike,
        T: Serialize,
    {
        let stream = self.config.stream_name();
        let payload = serde_json::to_string(value)?;

        let msg_id = conn.append(&stream, MSG_KEY_FIELD, payload)?;

        if self.config.state_initializer {
            if let Err(e) = conn.init_message_status(&stream, &msg_id) {
                error!(%stream, %msg_id, error = %e, "failed to record known message status");
                return Err(e);
            }
        }

        if let Some(max_length) = self.config.max_length {
            conn.trim_max_len(&stream, max_length)?;
        }

        debug!(%stream, %msg_id, "produced message");
        Ok(SendOutcome { stream, msg_id })
    }
}
