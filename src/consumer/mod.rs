//! The consumer worker (spec §4.4): a long-lived task bound to a specific
//! `(stream, group, consumerName)` triple, running an online read loop and a
//! reclaim loop under a shared cancellation token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::streams::StreamId;
use redis::Client;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::log::LogCommands;
use crate::naming::{DEFAULT_BATCH_SIZE, DEFAULT_MIN_IDLE_MILLISECONDS, DEFAULT_ONLINE_DEADLINE_SECONDS, DEFAULT_RECLAIM_POLL_SECONDS};
use crate::state::StateManagerCommands;

/// A business handler invoked once per dispatched message. `T` is the
/// handler's expected payload type, deserialized from the message's JSON
/// `msgKey` field.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync
where
    T: DeserializeOwned + Send + 'static,
{
    async fn handle(&self, value: &T) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Configuration for a single consumer worker (spec §4.4).
#[derive(Clone)]
pub struct ConsumerConfig {
    stream: String,
    group: String,
    consumer: String,
    batch_size: usize,
    online_deadline: Duration,
    reclaim_poll_period: Duration,
    min_idle: Duration,
}

impl ConsumerConfig {
    pub fn new(stream: &str, group: &str, consumer: &str) -> ConsumerConfig {
        ConsumerConfig {
            stream: stream.to_owned(),
            group: group.to_owned(),
            consumer: consumer.to_owned(),
            batch_size: DEFAULT_BATCH_SIZE,
            online_deadline: Duration::from_secs(DEFAULT_ONLINE_DEADLINE_SECONDS),
            reclaim_poll_period: Duration::from_secs(DEFAULT_RECLAIM_POLL_SECONDS),
            min_idle: Duration::from_millis(DEFAULT_MIN_IDLE_MILLISECONDS as u64),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_online_deadline(mut self, deadline: Duration) -> Self {
        self.online_deadline = deadline;
        self
    }

    pub fn with_reclaim_poll_period(mut self, period: Duration) -> Self {
        self.reclaim_poll_period = period;
        self
    }

    pub fn with_min_idle(mut self, min_idle: Duration) -> Self {
        self.min_idle = min_idle;
        self
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }
}

/// A single consumer worker. Each worker owns one `(stream, group,
/// consumer)` triple and should never be shared by reference across tasks;
/// the fleet manager gives each spawned task its own copy.
pub struct Consumer<T, H> {
    client: Client,
    config: ConsumerConfig,
    handler: Arc<H>,
    _marker: std::marker::PhantomData<T>,
}

impl<T, H> Consumer<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T> + 'static,
{
    pub fn new(client: Client, config: ConsumerConfig, handler: Arc<H>) -> Consumer<T, H> {
        Consumer {
            client,
            config,
            handler,
            _marker: std::marker::PhantomData,
        }
    }

    /// Returns `true` if no other worker has taken over ownership of
    /// `msg_id` since it was delivered to this consumer, per the state
    /// manager's in-flight record.
    pub fn is_still_mine(&self, conn: &mut redis::Connection, msg_id: &str) -> BrokerResult<bool> {
        match conn.is_processing(&self.config.stream, msg_id)? {
            Some(owner) => Ok(owner == self.config.consumer),
            None => Ok(true),
        }
    }

    /// Run both sub-loops until `token` is cancelled. Resolves only after
    /// both have exited, so a caller can await a clean stop.
    pub async fn run(self, token: CancellationToken) -> BrokerResult<()> {
        let online = OnlineLoop {
            client: self.client.clone(),
            config: self.config.clone(),
            handler: self.handler.clone(),
            _marker: std::marker::PhantomData::<T>,
        };
        let reclaim = ReclaimLoop {
            client: self.client.clone(),
            config: self.config.clone(),
            handler: self.handler.clone(),
            _marker: std::marker::PhantomData::<T>,
        };

        let online_token = token.clone();
        let reclaim_token = token.clone();

        let online_handle: JoinHandle<BrokerResult<()>> =
            tokio::spawn(async move { online.run(online_token).await });
        let reclaim_handle: JoinHandle<BrokerResult<()>> =
            tokio::spawn(async move { reclaim.run(reclaim_token).await });

        let (online_result, reclaim_result) = tokio::join!(online_handle, reclaim_handle);

        online_result.map_err(|e| BrokerError::Config(format!("online loop task panicked: {e}")))??;
        reclaim_result.map_err(|e| BrokerError::Config(format!("reclaim loop task panicked: {e}")))??;

        Ok(())
    }
}

struct OnlineLoop<T, H> {
    client: Client,
    config: ConsumerConfig,
    handler: Arc<H>,
    _marker: std::marker::PhantomData<T>,
}

impl<T, H> OnlineLoop<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T> + 'static,
{
    async fn run(self, token: CancellationToken) -> BrokerResult<()> {
        loop {
            if token.is_cancelled() {
                debug!(consumer = %self.config.consumer, "online loop cancelled");
                return Ok(());
            }

            let config = self.config.clone();
            let client = self.client.clone();
            let handler = self.handler.clone();

            let blocking_config = config.clone();
            let blocking_client = client.clone();

            let poll = tokio::task::spawn_blocking(move || -> BrokerResult<Vec<StreamId>> {
                let mut conn = blocking_client.get_connection()?;
                conn.read_as_group(
                    &blocking_config.stream,
                    &blocking_config.group,
                    &blocking_config.consumer,
                    blocking_config.batch_size,
                    blocking_config.online_deadline.as_millis() as usize,
                )
            });

            tokio::select! {
                _ = token.cancelled() => {
                    debug!(consumer = %self.config.consumer, "online loop cancelled mid-poll");
                    return Ok(());
                }
                result = poll => {
                    let ids = match result {
                        Ok(Ok(ids)) => ids,
                        Ok(Err(e)) => {
                            error!(consumer = %self.config.consumer, error = %e, "online loop read failed");
                            return Err(e);
                        }
                        Err(e) => {
                            return Err(BrokerError::Config(format!("online loop blocking task panicked: {e}")));
                        }
                    };

                    for id in ids {
                        dispatch(&client, &config, &handler, id).await?;
                    }
                }
            }
        }
    }
}

struct ReclaimLoop<T, H> {
    client: Client,
    config: ConsumerConfig,
    handler: Arc<H>,
    _marker: std::marker::PhantomData<T>,
}

impl<T, H> ReclaimLoop<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T> + 'static,
{
    async fn run(self, token: CancellationToken) -> BrokerResult<()> {
        let mut ticker = tokio::time::interval(self.config.reclaim_poll_period);
        ticker.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(consumer = %self.config.consumer, "reclaim loop cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.reclaim_once().await?;
                }
            }
        }
    }

    async fn reclaim_once(&self) -> BrokerResult<()> {
        let config = self.config.clone();
        let client = self.client.clone();

        let claimed = tokio::task::spawn_blocking(move || -> BrokerResult<Vec<StreamId>> {
            let mut conn = client.get_connection()?;

            let pending = conn.pending_list(&config.stream, &config.group, config.batch_size)?;

            let mut claimable = Vec::new();
            for entry in pending {
                if entry.consumer == config.consumer {
                    continue;
                }
                if (entry.idle_milliseconds as u128) < config.min_idle.as_millis() {
                    continue;
                }
                if conn.is_processing(&config.stream, &entry.id)?.is_some() {
                    continue;
                }
                claimable.push(entry.id);
            }

            if claimable.is_empty() {
                return Ok(Vec::new());
            }

            conn.claim(
                &config.stream,
                &config.group,
                &config.consumer,
                config.min_idle.as_millis() as usize,
                &claimable,
            )
        })
        .await
        .map_err(|e| BrokerError::Config(format!("reclaim loop blocking task panicked: {e}")))??;

        for id in claimed {
            info!(consumer = %self.config.consumer, msg_id = %id.id, "reclaimed abandoned message");
            dispatch(&self.client, &self.config, &self.handler, id).await?;
        }

        Ok(())
    }
}

/// Whether [`dispatch`] should proceed after `mark_processing`, or defer to
/// whichever worker already won the in-flight ownership race.
enum MarkOutcome {
    Skip,
    Proceed(Option<String>),
}

/// The dispatch pipeline (spec §4.4.3), shared by both loops.
async fn dispatch<T, H>(
    client: &Client,
    config: &ConsumerConfig,
    handler: &Arc<H>,
    message: StreamId,
) -> BrokerResult<()>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T> + 'static,
{
    let msg_id = message.id.clone();
    let stream = config.stream.clone();
    let group = config.group.clone();
    let consumer = config.consumer.clone();
    let client = client.clone();

    let decision = tokio::task::spawn_blocking({
        let stream = stream.clone();
        let msg_id = msg_id.clone();
        let consumer = consumer.clone();
        let client = client.clone();
        move || -> BrokerResult<MarkOutcome> {
            let mut conn = client.get_connection()?;

            match conn.mark_processing(&stream, &msg_id, &consumer) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(%consumer, %stream, %msg_id, "lost the in-flight ownership race, deferring to existing owner");
                    return Ok(MarkOutcome::Skip);
                }
                Err(e) => {
                    warn!(%consumer, %stream, %msg_id, error = %e, "mark_processing failed, proceeding anyway");
                }
            }

            let payload: Option<redis::Value> = message.map.get(crate::producer::MSG_KEY_FIELD).cloned();
            Ok(MarkOutcome::Proceed(payload.and_then(|v| match v {
                redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(&bytes).to_string()),
                redis::Value::SimpleString(s) => Some(s),
                _ => None,
            })))
        }
    })
    .await
    .map_err(|e| BrokerError::Config(format!("dispatch blocking task panicked: {e}")))??;

    let raw_payload = match decision {
        MarkOutcome::Skip => return Ok(()),
        MarkOutcome::Proceed(payload) => payload,
    };

    let outcome = match raw_payload {
        None => {
            error!(%consumer, %stream, %msg_id, "message missing msgKey field, acking as failure");
            Err(BrokerError::MalformedMessage(format!(
                "stream '{stream}' message '{msg_id}' has no usable msgKey field"
            )))
        }
        Some(raw) => match serde_json::from_str::<T>(&raw) {
            Err(e) => {
                error!(%consumer, %stream, %msg_id, raw = %raw, error = %e, "failed to deserialize payload");
                Err(BrokerError::Serde(e))
            }
            Ok(value) => match handler.handle(&value).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    error!(%consumer, %stream, %msg_id, error = %e, "handler returned an error");
                    Err(BrokerError::MalformedMessage(format!("handler failed: {e}")))
                }
            },
        },
    };

    let succeeded = outcome.is_ok();

    let finalize_stream = stream.clone();
    let finalize_group = group.clone();
    let finalize_msg_id = msg_id.clone();
    let finalize_client = client.clone();

    tokio::task::spawn_blocking(move || -> BrokerResult<()> {
        let mut conn = finalize_client.get_connection()?;
        conn.ack(&finalize_stream, &finalize_group, &finalize_msg_id)?;
        conn.update_ack_status(&finalize_stream, &finalize_group, &finalize_msg_id, succeeded)?;
        conn.clear_processing(&finalize_stream, &finalize_msg_id)?;
        Ok(())
    })
    .await
    .map_err(|e| BrokerError::Config(format!("finalize blocking task panicked: {e}")))??;

    // Dispatch errors are logged with full context above and do not abort the
    // worker loop: the message has already been ACKed. Only propagate loop-
    // fatal errors (none here; per-message failures are swallowed by design).
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl MessageHandler<serde_json::Value> for EchoHandler {
        async fn handle(
            &self,
            _value: &serde_json::Value,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
    }

    #[test]
    fn consumer_config_defaults_match_spec() {
        let config = ConsumerConfig::new("stream:orders", "group:billing", "consumer:orders0000");
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.online_deadline, Duration::from_secs(DEFAULT_ONLINE_DEADLINE_SECONDS));
        assert_eq!(config.reclaim_poll_period, Duration::from_secs(DEFAULT_RECLAIM_POLL_SECONDS));
        assert_eq!(config.min_idle, Duration::from_millis(DEFAULT_MIN_IDLE_MILLISECONDS as u64));
    }

    #[test]
    fn consumer_config_builder_overrides() {
        let config = ConsumerConfig::new("stream:orders", "group:billing", "consumer:orders0000")
            .with_batch_size(25)
            .with_min_idle(Duration::from_millis(500));
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.min_idle, Duration::from_millis(500));
    }
}
