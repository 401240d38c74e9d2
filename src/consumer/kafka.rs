//! Kafka-backed subscriptions.
//!
//! Each subscription owns its own `StreamConsumer`, and with it its own
//! broker connection and group membership. Reconnection after transport
//! errors is left to librdkafka; errors are surfaced, never fatal.

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::Message;
use tracing::{debug, info};

use super::{ConsumedRecord, ConsumerError, ConsumerFactory, RecordStream, SubscriptionOptions};

/// Opens rdkafka stream consumers.
#[derive(Debug, Clone, Default)]
pub struct KafkaConsumerFactory;

impl KafkaConsumerFactory {
    /// Creates a new factory.
    pub fn new() -> Self {
        Self
    }
}

impl ConsumerFactory for KafkaConsumerFactory {
    fn subscribe(
        &self,
        options: &SubscriptionOptions,
    ) -> Result<Box<dyn RecordStream>, ConsumerError> {
        info!(
            topic = %options.topic,
            group_id = %options.group_id,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = options
            .client_config()
            .create()
            .map_err(|e| ConsumerError::Config(format!("Failed to create consumer: {}", e)))?;

        consumer
            .subscribe(&[options.topic.as_str()])
            .map_err(|e| ConsumerError::Kafka(format!("Failed to subscribe to topic: {}", e)))?;

        Ok(Box::new(KafkaRecordStream {
            consumer,
            topic: options.topic.clone(),
        }))
    }
}

/// Subscription backed by a `StreamConsumer`.
pub struct KafkaRecordStream {
    consumer: StreamConsumer,
    topic: String,
}

#[async_trait]
impl RecordStream for KafkaRecordStream {
    async fn next(&mut self) -> Option<Result<ConsumedRecord, ConsumerError>> {
        let result = match self.consumer.recv().await {
            Ok(message) => Ok(ConsumedRecord {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            }),
            Err(e) => Err(ConsumerError::Kafka(e.to_string())),
        };
        Some(result)
    }

    fn is_assigned(&self) -> bool {
        self.consumer
            .assignment()
            .map(|partitions| partitions.count() > 0)
            .unwrap_or(false)
    }

    fn close(&mut self) {
        debug!(topic = %self.topic, "Leaving consumer group");
        self.consumer.unsubscribe();
    }
}
