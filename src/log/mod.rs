//! The log service adapter (spec §4.1 / §6): a thin, typed wrapper around the
//! handful of Redis Streams commands this crate depends on. Every operation
//! is exposed as a trait blanket-implemented over anything that satisfies
//! [`redis::Commands`], so both a live [`redis::Connection`] and a
//! [`redis_test::MockRedisConnection`] can drive it in tests.

use redis::streams::{
    StreamClaimOptions, StreamClaimReply, StreamId, StreamInfoConsumersReply,
    StreamInfoGroupsReply, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::{Commands, ErrorKind, ToRedisArgs, Value};
use tracing::{debug, warn};

use crate::error::{BrokerError, BrokerResult};

/// Summary view of a group's Pending Entries List, as reported by `XPENDING`
/// with no range arguments.
#[derive(Debug, Clone, Default)]
pub struct PendingOverview {
    pub count: usize,
    pub min_id: Option<String>,
    pub max_id: Option<String>,
    /// `(consumer name, pending count)` pairs.
    pub consumers: Vec<(String, usize)>,
}

/// A single entry returned by a ranged `XPENDING` scan.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_milliseconds: usize,
    pub delivery_count: usize,
}

/// Consumer-group level information from `XINFO GROUPS`.
#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub name: String,
    pub consumers: usize,
    pub pending: usize,
    pub last_delivered_id: String,
}

/// Per-consumer information from `XINFO CONSUMERS`.
#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub name: String,
    pub pending: usize,
    pub idle_milliseconds: usize,
    pub inactive_milliseconds: i64,
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::BulkString(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok(),
        Value::SimpleString(s) => s.parse().ok(),
        _ => None,
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Parse a raw `XPENDING <stream> <group>` (summary form) reply into a
/// [`PendingOverview`].
fn parse_pending_overview(value: &Value) -> PendingOverview {
    let Value::Array(parts) = value else {
        return PendingOverview::default();
    };

    let count = parts.first().and_then(value_as_i64).unwrap_or(0).max(0) as usize;
    let min_id = parts.get(1).and_then(value_as_string);
    let max_id = parts.get(2).and_then(value_as_string);

    let consumers = match parts.get(3) {
        Some(Value::Array(rows)) => rows
            .iter()
            .filter_map(|row| {
                let Value::Array(pair) = row else {
                    return None;
                };
                let name = pair.first().and_then(value_as_string)?;
                let pending = pair.get(1).and_then(value_as_i64).unwrap_or(0).max(0) as usize;
                Some((name, pending))
            })
            .collect(),
        _ => Vec::new(),
    };

    PendingOverview {
        count,
        min_id,
        max_id,
        consumers,
    }
}

fn unwrap_read_reply_by_key(reply: &StreamReadReply, key: &str) -> Vec<StreamId> {
    let mut ids = Vec::new();
    for stream in reply.keys.iter() {
        if stream.key == key {
            ids.extend(stream.ids.to_owned());
        } else {
            warn!(unexpected_stream = %stream.key, expected_stream = %key, "unexpected stream name in read reply");
        }
    }
    ids
}

/// A trait bundling every operation this crate needs from the log service.
pub trait LogCommands<K>
where
    K: ToRedisArgs + ToString,
{
    /// Append a single field/value pair to `key` with an auto-assigned id.
    /// Returns the assigned message id.
    fn append<F, V>(&mut self, key: &K, field: F, value: V) -> BrokerResult<String>
    where
        F: ToRedisArgs,
        V: ToRedisArgs;

    /// Retain at most `max_len` of the newest entries in the stream.
    fn trim_max_len(&mut self, key: &K, max_len: i64) -> BrokerResult<()>;

    /// Idempotently create a consumer group at `start_id`, creating the stream
    /// if it does not yet exist. Returns `true` if the group was created by
    /// this call, `false` if it already existed.
    fn ensure_group<G, ID>(&mut self, key: &K, group: G, start_id: ID) -> BrokerResult<bool>
    where
        G: ToRedisArgs,
        ID: ToRedisArgs;

    /// Idempotently create a named consumer within a group.
    fn ensure_consumer<G, N>(&mut self, key: &K, group: G, consumer: N) -> BrokerResult<bool>
    where
        G: ToRedisArgs,
        N: ToRedisArgs;

    /// Read new (`>`) messages for `consumer` in `group`, blocking up to
    /// `block_milliseconds`.
    fn read_as_group<G, N>(
        &mut self,
        key: &K,
        group: &G,
        consumer: &N,
        count: usize,
        block_milliseconds: usize,
    ) -> BrokerResult<Vec<StreamId>>
    where
        G: ToRedisArgs,
        N: ToRedisArgs;

    /// Summary view of the group's pending entries list.
    fn pending_overview<G>(&mut self, key: &K, group: &G) -> BrokerResult<PendingOverview>
    where
        G: ToRedisArgs;

    /// A bounded window of pending entries across every consumer in the group.
    fn pending_list<G>(&mut self, key: &K, group: &G, count: usize) -> BrokerResult<Vec<PendingEntry>>
    where
        G: ToRedisArgs;

    /// Transfer ownership of `ids` to `new_consumer`, gated server-side by
    /// `min_idle_milliseconds`.
    fn claim<G, N>(
        &mut self,
        key: &K,
        group: &G,
        new_consumer: &N,
        min_idle_milliseconds: usize,
        ids: &[String],
    ) -> BrokerResult<Vec<StreamId>>
    where
        G: ToRedisArgs,
        N: ToRedisArgs;

    /// Acknowledge and remove an entry from the group's pending list.
    fn ack<G>(&mut self, key: &K, group: &G, id: &str) -> BrokerResult<bool>
    where
        G: ToRedisArgs;

    /// List the consumer groups attached to a stream.
    fn group_info(&mut self, key: &K) -> BrokerResult<Vec<GroupInfo>>;

    /// List the consumers within a group.
    fn consumers_info<G>(&mut self, key: &K, group: &G) -> BrokerResult<Vec<ConsumerInfo>>
    where
        G: ToRedisArgs;

    /// Remove a consumer from a group.
    fn delete_consumer<G, N>(&mut self, key: &K, group: &G, consumer: &N) -> BrokerResult<()>
    where
        G: ToRedisArgs,
        N: ToRedisArgs;
}

impl<C, K> LogCommands<K> for C
where
    C: Commands,
    K: ToRedisArgs + ToString,
{
    fn append<F, V>(&mut self, key: &K, field: F, value: V) -> BrokerResult<String>
    where
        F: ToRedisArgs,
        V: ToRedisArgs,
    {
        let id: String = self.xadd(key, "*", &[(field, value)])?;
        debug!(stream = %key.to_string(), id = %id, "appended message to stream");
        Ok(id)
    }

    fn trim_max_len(&mut self, key: &K, max_len: i64) -> BrokerResult<()> {
        let _: i64 = self.xtrim(key, redis::streams::StreamMaxlen::Equals(max_len as usize))?;
        Ok(())
    }

    fn ensure_group<G, ID>(&mut self, key: &K, group: G, start_id: ID) -> BrokerResult<bool>
    where
        G: ToRedisArgs,
        ID: ToRedisArgs,
    {
        match self.xgroup_create_mkstream::<_, _, _, String>(key, group, start_id) {
            Ok(_) => {
                debug!(stream = %key.to_string(), "consumer group created");
                Ok(true)
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %key.to_string(), "consumer group already exists");
                Ok(false)
            }
            Err(e) => Err(BrokerError::Redis(e)),
        }
    }

    fn ensure_consumer<G, N>(&mut self, key: &K, group: G, consumer: N) -> BrokerResult<bool>
    where
        G: ToRedisArgs,
        N: ToRedisArgs,
    {
        let created: bool = self.xgroup_createconsumer(key, group, consumer)?;
        Ok(created)
    }

    fn read_as_group<G, N>(
        &mut self,
        key: &K,
        group: &G,
        consumer: &N,
        count: usize,
        block_milliseconds: usize,
    ) -> BrokerResult<Vec<StreamId>>
    where
        G: ToRedisArgs,
        N: ToRedisArgs,
    {
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_milliseconds);

        match self.xread_options::<_, _, StreamReadReply>(&[key], &[">"], &opts) {
            Ok(reply) => Ok(unwrap_read_reply_by_key(&reply, &key.to_string())),
            Err(e) if e.kind() == ErrorKind::TypeError => {
                // A nil reply (blocking timeout with no new messages) decodes
                // as a type error against StreamReadReply; treat as empty.
                Ok(Vec::new())
            }
            Err(e) => Err(BrokerError::Redis(e)),
        }
    }

    fn pending_overview<G>(&mut self, key: &K, group: &G) -> BrokerResult<PendingOverview>
    where
        G: ToRedisArgs,
    {
        let raw: Value = redis::cmd("XPENDING").arg(key).arg(group).query(self)?;
        Ok(parse_pending_overview(&raw))
    }

    fn pending_list<G>(&mut self, key: &K, group: &G, count: usize) -> BrokerResult<Vec<PendingEntry>>
    where
        G: ToRedisArgs,
    {
        if count == 0 {
            return Ok(Vec::new());
        }

        let reply: StreamPendingCountReply = self.xpending_count(key, group, "-", "+", count)?;

        Ok(reply
            .ids
            .into_iter()
            .map(|entry| PendingEntry {
                id: entry.id,
                consumer: entry.consumer,
                idle_milliseconds: entry.last_delivered_ms,
                delivery_count: entry.times_delivered,
            })
            .collect())
    }

    fn claim<G, N>(
        &mut self,
        key: &K,
        group: &G,
        new_consumer: &N,
        min_idle_milliseconds: usize,
        ids: &[String],
    ) -> BrokerResult<Vec<StreamId>>
    where
        G: ToRedisArgs,
        N: ToRedisArgs,
    {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let reply: StreamClaimReply = self.xclaim_options(
            key,
            group,
            new_consumer,
            min_idle_milliseconds,
            ids,
            StreamClaimOptions::default(),
        )?;

        Ok(reply.ids)
    }

    fn ack<G>(&mut self, key: &K, group: &G, id: &str) -> BrokerResult<bool>
    where
        G: ToRedisArgs,
    {
        let acked: bool = self.xack(key, group, &[id])?;
        Ok(acked)
    }

    fn group_info(&mut self, key: &K) -> BrokerResult<Vec<GroupInfo>> {
        let reply: StreamInfoGroupsReply = self.xinfo_groups(key)?;
        Ok(reply
            .groups
            .into_iter()
            .map(|g| GroupInfo {
                name: g.name,
                consumers: g.consumers,
                pending: g.pending,
                last_delivered_id: g.last_delivered_id,
            })
            .collect())
    }

    fn consumers_info<G>(&mut self, key: &K, group: &G) -> BrokerResult<Vec<ConsumerInfo>>
    where
        G: ToRedisArgs,
    {
        let reply: StreamInfoConsumersReply = self.xinfo_consumers(key, group)?;
        Ok(reply
            .consumers
            .into_iter()
            .map(|c| ConsumerInfo {
                name: c.name,
                pending: c.pending,
                idle_milliseconds: c.idle,
                inactive_milliseconds: c.inactive,
            })
            .collect())
    }

    fn delete_consumer<G, N>(&mut self, key: &K, group: &G, consumer: &N) -> BrokerResult<()>
    where
        G: ToRedisArgs,
        N: ToRedisArgs,
    {
        let _: i64 = self.xgroup_delconsumer(key, group, consumer)?;
        Ok(())
    }
}

#[cfg(test)]
mod test_append {
    use redis::{cmd, Value};
    use redis_test::{MockCmd, MockRedisConnection};

    use super::*;

    #[test]
    fn append_returns_assigned_id() {
        let key = "stream:demo";
        let mut conn = MockRedisConnection::new(vec![MockCmd::new::<_, Value>(
            cmd("XADD").arg(key).arg("*").arg(&[("msgKey", "{}")]),
            Ok(Value::SimpleString("1-0".to_string())),
        )]);

        let id = LogCommands::<&str>::append(&mut conn, &key, "msgKey", "{}").unwrap();
        assert_eq!(id, "1-0");
    }
}

#[cfg(test)]
mod test_ensure_group {
    use redis::{cmd, ErrorKind, RedisError, Value};
    use redis_test::{MockCmd, MockRedisConnection};

    use super::*;

    #[test]
    fn creates_new_group() {
        let key = "stream:demo";
        let mut conn = MockRedisConnection::new(vec![MockCmd::new::<_, Value>(
            cmd("XGROUP")
                .arg("CREATE")
                .arg(key)
                .arg("group:demo")
                .arg("$")
                .arg("MKSTREAM"),
            Ok(Value::Okay),
        )]);

        let created = LogCommands::<&str>::ensure_group(&mut conn, &key, "group:demo", "$").unwrap();
        assert!(created);
    }

    #[test]
    fn tolerates_busygroup() {
        let key = "stream:demo";
        let mut conn = MockRedisConnection::new(vec![MockCmd::new::<_, Value>(
            cmd("XGROUP")
                .arg("CREATE")
                .arg(key)
                .arg("group:demo")
                .arg("$")
                .arg("MKSTREAM"),
            Err(RedisError::from((
                ErrorKind::ResponseError,
                "BUSYGROUP Consumer Group name already exists",
            ))),
        )]);

        let created = LogCommands::<&str>::ensure_group(&mut conn, &key, "group:demo", "$").unwrap();
        assert!(!created);
    }
}

#[cfg(test)]
mod test_ack {
    use redis::cmd;
    use redis_test::{MockCmd, MockRedisConnection};

    use super::*;

    #[test]
    fn ack_true() {
        let key = "stream:demo";
        let mut conn = MockRedisConnection::new(vec![MockCmd::new::<_, i64>(
            cmd("XACK").arg(key).arg("group:demo").arg(&["1-0"]),
            Ok(1),
        )]);

        let acked = LogCommands::<&str>::ack(&mut conn, &key, &"group:demo", "1-0").unwrap();
        assert!(acked);
    }
}

#[cfg(test)]
mod test_parse_pending_overview {
    use super::*;

    #[test]
    fn empty_pel_parses_to_zero_count() {
        let raw = Value::Array(vec![Value::Int(0), Value::Nil, Value::Nil, Value::Nil]);
        let overview = parse_pending_overview(&raw);
        assert_eq!(overview.count, 0);
        assert!(overview.min_id.is_none());
        assert!(overview.max_id.is_none());
        assert!(overview.consumers.is_empty());
    }

    #[test]
    fn non_empty_pel_parses_consumers() {
        let raw = Value::Array(vec![
            Value::Int(3),
            Value::BulkString(b"1-0".to_vec()),
            Value::BulkString(b"3-0".to_vec()),
            Value::Array(vec![Value::Array(vec![
                Value::BulkString(b"consumer:demo0000".to_vec()),
                Value::BulkString(b"3".to_vec()),
            ])]),
        ]);

        let overview = parse_pending_overview(&raw);
        assert_eq!(overview.count, 3);
        assert_eq!(overview.min_id.as_deref(), Some("1-0"));
        assert_eq!(overview.max_id.as_deref(), Some("3-0"));
        assert_eq!(
            overview.consumers,
            vec![("consumer:demo0000".to_string(), 3)]
        );
    }
}
