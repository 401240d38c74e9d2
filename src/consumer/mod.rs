//! Consumer group management for raw-data topics.
//!
//! The manager opens one subscription per topic through a
//! [`ConsumerFactory`], drives each [`RecordStream`] on its own task, and
//! hands every record to a [`RecordHandler`]. The Kafka implementation of
//! the factory lives in [`kafka`]; tests plug in in-memory streams.

pub mod config;
pub mod kafka;
pub mod manager;

pub use config::{GroupOptions, SubscriptionOptions};
pub use kafka::KafkaConsumerFactory;
pub use manager::{ConsumerGroupManager, Subscription, SubscriptionState, Subscriptions};

use async_trait::async_trait;
use thiserror::Error;

use crate::error::IngestError;

/// Errors that can occur during consumer operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// Error from the Kafka client.
    #[error("Kafka error: {0}")]
    Kafka(String),

    /// The consumer could not be configured.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// One record delivered by a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Raw payload; empty when the record carried none.
    pub payload: Vec<u8>,
}

/// Live subscription to a single topic.
#[async_trait]
pub trait RecordStream: Send {
    /// Next record or transport error; `None` once the stream has ended.
    async fn next(&mut self) -> Option<Result<ConsumedRecord, ConsumerError>>;

    /// Whether the group has assigned partitions to this member.
    fn is_assigned(&self) -> bool;

    /// Leaves the consumer group.
    fn close(&mut self);
}

/// Opens subscriptions.
pub trait ConsumerFactory: Send + Sync {
    /// Joins the subscription's consumer group for its topic.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError` if the client cannot be created or subscribed.
    fn subscribe(&self, options: &SubscriptionOptions)
        -> Result<Box<dyn RecordStream>, ConsumerError>;
}

/// Receives what subscriptions deliver.
///
/// Records arrive in offset order per subscription; `handle` is awaited
/// before the next record of the same subscription is pulled.
#[async_trait]
pub trait RecordHandler: Send + Sync + 'static {
    /// Processes one record. An error drops the record; the subscription
    /// carries on.
    async fn handle(&self, record: ConsumedRecord) -> Result<(), IngestError>;

    /// Called for every transport or session error of a subscription.
    fn on_error(&self, topic: &str, error: &ConsumerError) {
        tracing::warn!(topic, error = %error, "Subscription error");
    }

    /// Waits for work started by `handle` to finish.
    async fn drain(&self) {}

    /// Gives up on work started by `handle`.
    fn abandon(&self) {}
}
