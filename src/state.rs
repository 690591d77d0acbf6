//! The state manager (spec §4.2): per-message processing ownership, backed by
//! the same key-value store as the log service. Keys are plain strings so the
//! same [`redis::Connection`] used for streams can serve both roles, mirroring
//! how this corpus treats Redis as a single multi-purpose backing store rather
//! than standing up a second client.

use redis::{Commands, RedisError};
use tracing::{debug, warn};

use crate::error::BrokerResult;

/// Default TTL, in seconds, for the "known" marker written by the producer.
pub const DEFAULT_KNOWN_TTL_SECONDS: u64 = 300;

/// Default TTL, in seconds, for an in-flight record. Per §4.2 this SHOULD
/// exceed the reclaim idle threshold so a crashed worker's record expires
/// only after other workers have had a chance to reclaim the message through
/// the log service instead.
pub const DEFAULT_PROCESSING_TTL_SECONDS: u64 = 30;

/// Bounded retries for the optimistic `WATCH`/`MULTI` counter increment.
pub const DEFAULT_COUNTER_RETRIES: u32 = 3;

fn known_key(stream: &str, msg_id: &str) -> String {
    format!("state:known:{stream}:{msg_id}")
}

fn processing_key(stream: &str, msg_id: &str) -> String {
    format!("state:processing:{stream}:{msg_id}")
}

fn ack_key(stream: &str, group: &str, msg_id: &str) -> String {
    format!("state:ack:{stream}:{group}:{msg_id}")
}

fn counter_key(stream: &str, group: &str) -> String {
    format!("state:pending_counter:{stream}:{group}")
}

/// Per-(stream, msg-id) processing ownership and terminal-status bookkeeping.
pub trait StateManagerCommands {
    /// Record `msgID` as known, with a short TTL, so consumers downstream can
    /// distinguish a lost message from one that was never published. A no-op
    /// by design is fine for callers who don't configure this.
    fn init_message_status(&mut self, stream: &str, msg_id: &str) -> BrokerResult<()>;

    /// Return the owning consumer of an in-flight record, if one exists.
    fn is_processing(&mut self, stream: &str, msg_id: &str) -> BrokerResult<Option<String>>;

    /// Atomically create the in-flight record if absent. Returns `true` if
    /// this call won the race and created the record, `false` if an existing
    /// owner was seen (the caller SHOULD defer to it per §4.2).
    fn mark_processing(&mut self, stream: &str, msg_id: &str, consumer: &str) -> BrokerResult<bool>;

    /// Delete the in-flight record.
    fn clear_processing(&mut self, stream: &str, msg_id: &str) -> BrokerResult<()>;

    /// Record a terminal ACK outcome for `(stream, group, msgID)`.
    fn update_ack_status(
        &mut self,
        stream: &str,
        group: &str,
        msg_id: &str,
        succeeded: bool,
    ) -> BrokerResult<()>;

    /// Atomically increment a per-(stream, group) pending-message counter,
    /// retrying on a concurrent write up to `DEFAULT_COUNTER_RETRIES` times.
    fn incr_pending_counter(&mut self, stream: &str, group: &str, delta: i64) -> BrokerResult<i64>;
}

impl<C> StateManagerCommands for C
where
    C: Commands + redis::ConnectionLike,
{
    fn init_message_status(&mut self, stream: &str, msg_id: &str) -> BrokerResult<()> {
        let key = known_key(stream, msg_id);
        let _: () = self.set_ex(&key, "known", DEFAULT_KNOWN_TTL_SECONDS)?;
        Ok(())
    }

    fn is_processing(&mut self, stream: &str, msg_id: &str) -> BrokerResult<Option<String>> {
        let key = processing_key(stream, msg_id);
        let owner: Option<String> = self.get(&key)?;
        Ok(owner)
    }

    fn mark_processing(&mut self, stream: &str, msg_id: &str, consumer: &str) -> BrokerResult<bool> {
        let key = processing_key(stream, msg_id);
        let won: bool = redis::cmd("SET")
            .arg(&key)
            .arg(consumer)
            .arg("NX")
            .arg("EX")
            .arg(DEFAULT_PROCESSING_TTL_SECONDS)
            .query(self)
            .map(|reply: Option<String>| reply.is_some())?;

        if won {
            debug!(%stream, %msg_id, %consumer, "claimed in-flight ownership");
        } else {
            warn!(%stream, %msg_id, %consumer, "lost the in-flight ownership race, deferring to existing owner");
        }

        Ok(won)
    }

    fn clear_processing(&mut self, stream: &str, msg_id: &str) -> BrokerResult<()> {
        let key = processing_key(stream, msg_id);
        let _: i64 = self.del(&key)?;
        Ok(())
    }

    fn update_ack_status(
        &mut self,
        stream: &str,
        group: &str,
        msg_id: &str,
        succeeded: bool,
    ) -> BrokerResult<()> {
        let key = ack_key(stream, group, msg_id);
        let value = if succeeded { "success" } else { "failure" };
        let _: () = self.set_ex(&key, value, DEFAULT_KNOWN_TTL_SECONDS)?;
        Ok(())
    }

    fn incr_pending_counter(&mut self, stream: &str, group: &str, delta: i64) -> BrokerResult<i64> {
        let key = counter_key(stream, group);

        let mut last_error: Option<RedisError> = None;
        for attempt in 1..=DEFAULT_COUNTER_RETRIES {
            let result: Result<(i64,), RedisError> = redis::transaction(self, &[&key], |conn, pipe| {
                let current: i64 = conn.get(&key).unwrap_or(0);
                pipe.set(&key, current + delta).ignore().get(&key).query(conn)
            });

            match result {
                Ok((value,)) => return Ok(value),
                Err(e) => {
                    warn!(%stream, %group, attempt, error = %e, "pending counter transaction aborted, retrying");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.expect("loop runs at least once").into())
    }
}
