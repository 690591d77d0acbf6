//! The consumer fleet manager (spec §4.5): reconciles the actual number of
//! consumers in a group to a desired target, naming and launching each as an
//! independent background task.

use std::sync::Arc;

use redis::Client;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::consumer::{Consumer, ConsumerConfig, MessageHandler};
use crate::error::{BrokerError, BrokerResult};
use crate::log::LogCommands;
use crate::naming::{
    consumer_name, group_name, stream_name, GROUP_START_ID, MAX_CONSUMERS,
    MIN_REMOVABLE_IDLE_MILLISECONDS, MIN_CONSUMERS, NEVER_PROCESSED_INACTIVE_MILLISECONDS,
    REMOVAL_ATTEMPT_CAP, UNIQUE_NAME_RETRY_CAP,
};

/// Configuration for a consumer fleet (spec §4.5, §9).
#[derive(Clone)]
pub struct FleetConfig {
    msg_key: String,
    group_key: String,
    desired_count: usize,
}

impl FleetConfig {
    /// `desired_count` MUST be in `[1, 100]`; any other value is a
    /// configuration error surfaced to the startup caller.
    pub fn new(msg_key: &str, group_key: &str, desired_count: usize) -> BrokerResult<FleetConfig> {
        if msg_key.is_empty() {
            return Err(BrokerError::Config("msgKey must not be empty".to_string()));
        }
        if !(MIN_CONSUMERS..=MAX_CONSUMERS).contains(&desired_count) {
            return Err(BrokerError::Config(format!(
                "desired consumer count {desired_count} is outside [{MIN_CONSUMERS}, {MAX_CONSUMERS}]"
            )));
        }

        Ok(FleetConfig {
            msg_key: msg_key.to_owned(),
            group_key: group_key.to_owned(),
            desired_count,
        })
    }

    pub fn stream_name(&self) -> String {
        stream_name(&self.msg_key)
    }

    pub fn group_name(&self) -> String {
        group_name(&self.group_key)
    }
}

/// Creates the group, reconciles consumer count, and launches one
/// long-lived worker task per consumer.
pub struct FleetManager<T, H> {
    client: Client,
    fleet: FleetConfig,
    handler: Arc<H>,
    _marker: std::marker::PhantomData<T>,
}

impl<T, H> FleetManager<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T> + 'static,
{
    pub fn new(client: Client, fleet: FleetConfig, handler: Arc<H>) -> FleetManager<T, H> {
        FleetManager {
            client,
            fleet,
            handler,
            _marker: std::marker::PhantomData,
        }
    }

    /// Run the startup sequence (spec §4.5.4): ensure the group, reconcile
    /// the desired consumer count, then spawn one worker task per listed
    /// consumer. Resolves only once `token` is cancelled and every spawned
    /// worker has returned.
    pub async fn start(&self, token: CancellationToken) -> BrokerResult<()> {
        let stream = self.fleet.stream_name();
        let group = self.fleet.group_name();

        let mut conn = self.client.get_connection()?;
        conn.ensure_group(&stream, &group, GROUP_START_ID)?;

        reconcile(&mut conn, &stream, &group, &self.fleet.msg_key, self.fleet.desired_count)?;

        let consumers = conn.consumers_info(&stream, &group)?;
        drop(conn);

        let mut handles: Vec<JoinHandle<BrokerResult<()>>> = Vec::with_capacity(consumers.len());

        for consumer_info in consumers {
            let config = ConsumerConfig::new(&stream, &group, &consumer_info.name);
            let worker = Consumer::new(self.client.clone(), config, self.handler.clone());
            let worker_token = token.clone();

            info!(consumer = %consumer_info.name, %stream, %group, "launching consumer worker");
            handles.push(tokio::spawn(async move { worker.run(worker_token).await }));
        }

        for handle in handles {
            handle
                .await
                .map_err(|e| BrokerError::Config(format!("consumer worker task panicked: {e}")))??;
        }

        Ok(())
    }
}

/// Reconcile the actual consumer count of `group` to `desired` (spec §4.5.1).
fn reconcile<C>(
    conn: &mut C,
    stream: &str,
    group: &str,
    msg_key: &str,
    desired: usize,
) -> BrokerResult<()>
where
    C: LogCommands<String>,
{
    let mut current = conn.consumers_info(&stream.to_string(), &group.to_string())?;

    if current.len() == desired {
        return Ok(());
    }

    if current.len() < desired {
        // Consumer indices are 1-based: the first worker in a group is
        // `consumer:<msgKey>0001`, matching the literal names in the fleet
        // scale-up acceptance scenario.
        for i in current.len()..desired {
            let name = create_unique_consumer(conn, stream, group, msg_key, i + 1, &current)?;
            current.push(crate::log::ConsumerInfo {
                name,
                pending: 0,
                idle_milliseconds: 0,
                inactive_milliseconds: NEVER_PROCESSED_INACTIVE_MILLISECONDS,
            });
        }
        return Ok(());
    }

    let mut attempts = 0;
    let mut index = 0;
    while current.len() > desired {
        if attempts >= REMOVAL_ATTEMPT_CAP {
            return Err(BrokerError::Reconciliation {
                stream: stream.to_string(),
                group: group.to_string(),
                reason: format!("exceeded {REMOVAL_ATTEMPT_CAP} removal attempts while reducing to {desired} consumers"),
            });
        }
        attempts += 1;

        if index >= current.len() {
            index = 0;
        }

        let candidate = current[index].clone();
        if is_removable(&candidate) {
            conn.delete_consumer(&stream.to_string(), &group.to_string(), &candidate.name)?;
            info!(consumer = %candidate.name, %stream, %group, "removed idle consumer during scale-down");
            current.remove(index);
        } else {
            info!(consumer = %candidate.name, %stream, %group, "skipping busy consumer during scale-down");
            index += 1;
        }
    }

    Ok(())
}

/// Build a unique consumer name starting at `start_index`, retrying against
/// `existing` up to [`UNIQUE_NAME_RETRY_CAP`] times (spec §4.5.2).
fn create_unique_consumer<C>(
    conn: &mut C,
    stream: &str,
    group: &str,
    msg_key: &str,
    start_index: usize,
    existing: &[crate::log::ConsumerInfo],
) -> BrokerResult<String>
where
    C: LogCommands<String>,
{
    let mut index = start_index;
    for _ in 0..UNIQUE_NAME_RETRY_CAP {
        let candidate = consumer_name(msg_key, index);
        if !existing.iter().any(|c| c.name == candidate) {
            conn.ensure_consumer(&stream.to_string(), &group.to_string(), &candidate)?;
            info!(consumer = %candidate, %stream, %group, "created consumer");
            return Ok(candidate);
        }
        index += 1;
    }

    Err(BrokerError::Reconciliation {
        stream: stream.to_string(),
        group: group.to_string(),
        reason: format!("exceeded {UNIQUE_NAME_RETRY_CAP} attempts to find a free consumer name"),
    })
}

/// Consumer deletion predicate (spec §4.5.3).
fn is_removable(consumer: &crate::log::ConsumerInfo) -> bool {
    if consumer.pending != 0 {
        return false;
    }
    if (consumer.idle_milliseconds as i64) <= MIN_REMOVABLE_IDLE_MILLISECONDS {
        return false;
    }
    consumer.inactive_milliseconds == NEVER_PROCESSED_INACTIVE_MILLISECONDS
        || consumer.inactive_milliseconds > MIN_REMOVABLE_IDLE_MILLISECONDS
}

#[cfg(test)]
mod test_fleet_config {
    use super::*;

    #[test]
    fn rejects_out_of_range_desired_count() {
        assert!(FleetConfig::new("orders", "billing", 0).is_err());
        assert!(FleetConfig::new("orders", "billing", 101).is_err());
    }

    #[test]
    fn rejects_empty_msg_key() {
        assert!(FleetConfig::new("", "billing", 3).is_err());
    }

    #[test]
    fn accepts_boundary_values() {
        assert!(FleetConfig::new("orders", "billing", 1).is_ok());
        assert!(FleetConfig::new("orders", "billing", 100).is_ok());
    }
}

#[cfg(test)]
mod test_create_unique_consumer {
    use redis::{cmd, Value};
    use redis_test::{MockCmd, MockRedisConnection};

    use super::*;

    #[test]
    fn first_slot_in_a_group_is_index_one() {
        // Pins spec §8 scenario 3: the first consumer created in a group is
        // `consumer:demo0001`, not `consumer:demo0000`.
        let mut conn = MockRedisConnection::new(vec![MockCmd::new::<_, Value>(
            cmd("XGROUP")
                .arg("CREATECONSUMER")
                .arg("stream:demo")
                .arg("group:billing")
                .arg("consumer:demo0001"),
            Ok(Value::Int(1)),
        )]);

        let name = create_unique_consumer(&mut conn, "stream:demo", "group:billing", "demo", 1, &[]).unwrap();
        assert_eq!(name, "consumer:demo0001");
    }

    #[test]
    fn skips_names_already_present() {
        let mut conn = MockRedisConnection::new(vec![MockCmd::new::<_, Value>(
            cmd("XGROUP")
                .arg("CREATECONSUMER")
                .arg("stream:demo")
                .arg("group:billing")
                .arg("consumer:demo0002"),
            Ok(Value::Int(1)),
        )]);

        let existing = vec![crate::log::ConsumerInfo {
            name: "consumer:demo0001".to_string(),
            pending: 0,
            idle_milliseconds: 5000,
            inactive_milliseconds: NEVER_PROCESSED_INACTIVE_MILLISECONDS,
        }];

        let name =
            create_unique_consumer(&mut conn, "stream:demo", "group:billing", "demo", 1, &existing).unwrap();
        assert_eq!(name, "consumer:demo0002");
    }
}
