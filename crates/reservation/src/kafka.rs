//! Kafka transport for outbound events and inbound order signals.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use inventory_store::InventoryStore;
use rdkafka::ClientConfig;
use rdkafka::Message;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::watch;

use crate::events::ReservationEvent;
use crate::listener::{ORDER_TOPICS, OrderEventListener};
use crate::publisher::{EventPublisher, PublishError};

/// Publishes reservation events to Kafka, keyed by order id.
#[derive(Clone)]
pub struct KafkaEventPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaEventPublisher {
    pub fn new(brokers: &str) -> Result<Self, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .create()?;

        tracing::info!(%brokers, "kafka event publisher created");
        Ok(Self {
            producer,
            timeout: Duration::from_secs(5),
        })
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish(&self, event: &ReservationEvent) -> Result<(), PublishError> {
        let topic = event.topic();
        let payload = event.payload()?;
        let key = event.key().as_str();

        let record = FutureRecord::to(topic).payload(&payload).key(key);

        match self.producer.send(record, self.timeout).await {
            Ok((partition, offset)) => {
                tracing::debug!(topic, partition, offset, %key, "event published");
                Ok(())
            }
            Err((e, _)) => Err(PublishError::Transport {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Consumes order lifecycle topics until `shutdown` flips to true.
///
/// Offsets are committed manually after each message has been handled, so a
/// crash mid-message means redelivery rather than loss.
pub async fn run_kafka_listener<S: InventoryStore + 'static>(
    brokers: &str,
    group_id: &str,
    listener: Arc<OrderEventListener<S>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), KafkaError> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("group.id", group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("session.timeout.ms", "6000")
        .set("enable.partition.eof", "false")
        .create()?;

    consumer.subscribe(&ORDER_TOPICS)?;
    tracing::info!(topics = ?ORDER_TOPICS, %group_id, "order signal listener started");

    loop {
        tokio::select! {
            received = consumer.recv() => {
                let message = match received {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::error!(error = %e, "error receiving order signal");
                        continue;
                    }
                };

                let key = message.key().and_then(|k| std::str::from_utf8(k).ok());
                let payload = message.payload().unwrap_or_default();
                listener.handle(message.topic(), key, payload).await;

                if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                    tracing::warn!(error = %e, "offset commit failed, message may be redelivered");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("order signal listener stopped");
                    return Ok(());
                }
            }
        }
    }
}
