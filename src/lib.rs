//! A distributed, at-least-once task queue built on Redis Streams consumer
//! groups. With **redfleet** you can:
//!
//! - **Produce** JSON-serialized messages onto a named stream, optionally
//!   capping the stream's length.
//! - **Consume** messages with a fleet of named workers per consumer group,
//!   each running an online read loop and a reclaim loop so abandoned work
//!   is automatically picked up by another worker.
//! - **Reconcile** the number of consumers in a group to a desired target,
//!   creating or removing workers as that target changes.
//!
//! ## Basic usage
//!
//! #### Produce a message:
//!
//! ```rust,no_run
//! use redfleet::prelude::*;
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct OrderPlaced {
//!     id: u32,
//! }
//!
//! fn main() -> BrokerResult<()> {
//!     let args = ClientArgs::from_env()?;
//!     let client = args.build()?;
//!     let mut conn = client.get_connection()?;
//!
//!     let producer = Producer::new(ProducerConfig::new("orders", 10_000, true));
//!     let outcome = producer.send(&mut conn, &OrderPlaced { id: 1 })?;
//!
//!     println!("produced {} on {}", outcome.msg_id, outcome.stream);
//!     Ok(())
//! }
//! ```
//!
//! #### Run a consumer fleet:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use redfleet::prelude::*;
//! use serde::Deserialize;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Deserialize)]
//! struct OrderPlaced {
//!     id: u32,
//! }
//!
//! struct PrintHandler;
//!
//! #[async_trait]
//! impl MessageHandler<OrderPlaced> for PrintHandler {
//!     async fn handle(&self, value: &OrderPlaced) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!         println!("order {} received", value.id);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> BrokerResult<()> {
//!     let args = ClientArgs::from_env()?;
//!     let client = args.build()?;
//!
//!     let fleet = FleetConfig::new("orders", "fulfillment", 3)?;
//!     let manager = FleetManager::new(client, fleet, Arc::new(PrintHandler));
//!
//!     let token = CancellationToken::new();
//!     manager.start(token).await
//! }
//! ```
//!
//! The payload type is generic over anything implementing
//! [`serde::Serialize`] / [`serde::de::DeserializeOwned`]; JSON encoding on
//! the producer side is symmetric with JSON decoding on the consumer side.
//!
//! ## Contributing
//!
//! Bug reports and pull requests are welcome. Please make sure new code
//! follows the existing style and that `cargo test` passes before opening a
//! pull request.

mod client;
mod consumer;
mod error;
mod fleet;
mod log;
mod naming;
mod producer;
mod state;

pub mod prelude {
    //! A global import for crate resources.
    pub use crate::client::{ClientArgs, ClientBuilder, ClientCredentials, VerifyConnection};
    pub use crate::consumer::{Consumer, ConsumerConfig, MessageHandler};
    pub use crate::error::{BrokerError, BrokerResult};
    pub use crate::fleet::{FleetConfig, FleetManager};
    pub use crate::log::{ConsumerInfo, GroupInfo, LogCommands, PendingEntry, PendingOverview};
    pub use crate::naming::{consumer_name, group_name, stream_name};
    pub use crate::producer::{Producer, ProducerConfig, SendOutcome};
    pub use crate::state::StateManagerCommands;
}
