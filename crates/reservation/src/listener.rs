//! Inbound order lifecycle signals.
//!
//! Business rejections (unknown order, duplicate reservation, illegal
//! transition) are acknowledged and logged so a bad message cannot loop
//! forever. Infrastructure failures are retried a bounded number of times and
//! then handed to a [`DeadLetterSink`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, RequestContext};
use inventory_store::InventoryStore;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::error::{ErrorKind, ServiceError};
use crate::service::ReservationService;

pub const TOPIC_ORDER_CREATED: &str = "order.created";
pub const TOPIC_ORDER_PAYMENT_CONFIRMED: &str = "order.payment-confirmed";
pub const TOPIC_ORDER_CANCELLED: &str = "order.cancelled";

/// Every topic the listener consumes.
pub const ORDER_TOPICS: [&str; 3] = [
    TOPIC_ORDER_CREATED,
    TOPIC_ORDER_PAYMENT_CONFIRMED,
    TOPIC_ORDER_CANCELLED,
];

/// Errors raised while decoding an inbound message.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Malformed {topic} payload: {source}")]
    Malformed {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

/// An order lifecycle signal, reduced to the fields the ledger needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderSignal {
    Created {
        order_id: OrderId,
        product_id: ProductId,
        quantity: u32,
    },
    PaymentConfirmed {
        order_id: OrderId,
    },
    Cancelled {
        order_id: OrderId,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderCreatedPayload {
    order_id: OrderId,
    product_id: ProductId,
    quantity: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderRefPayload {
    order_id: OrderId,
}

impl OrderSignal {
    /// Decodes a JSON message received on `topic`.
    pub fn parse(topic: &str, payload: &[u8]) -> Result<Self, ListenerError> {
        let malformed = |source| ListenerError::Malformed {
            topic: topic.to_string(),
            source,
        };

        match topic {
            TOPIC_ORDER_CREATED => {
                let p: OrderCreatedPayload = serde_json::from_slice(payload).map_err(malformed)?;
                Ok(OrderSignal::Created {
                    order_id: p.order_id,
                    product_id: p.product_id,
                    quantity: p.quantity,
                })
            }
            TOPIC_ORDER_PAYMENT_CONFIRMED => {
                let p: OrderRefPayload = serde_json::from_slice(payload).map_err(malformed)?;
                Ok(OrderSignal::PaymentConfirmed {
                    order_id: p.order_id,
                })
            }
            TOPIC_ORDER_CANCELLED => {
                let p: OrderRefPayload = serde_json::from_slice(payload).map_err(malformed)?;
                Ok(OrderSignal::Cancelled {
                    order_id: p.order_id,
                })
            }
            other => Err(ListenerError::UnknownTopic(other.to_string())),
        }
    }

    /// Short name used as a metric label.
    pub fn name(&self) -> &'static str {
        match self {
            OrderSignal::Created { .. } => "created",
            OrderSignal::PaymentConfirmed { .. } => "payment_confirmed",
            OrderSignal::Cancelled { .. } => "cancelled",
        }
    }

    pub fn order_id(&self) -> &OrderId {
        match self {
            OrderSignal::Created { order_id, .. }
            | OrderSignal::PaymentConfirmed { order_id }
            | OrderSignal::Cancelled { order_id } => order_id,
        }
    }
}

/// A message that could not be handled, kept for operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub error: String,
    pub deliveries: u32,
    pub failed_at: DateTime<Utc>,
}

/// Destination for messages the listener gives up on.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, letter: DeadLetter);
}

/// Dead-letter sink that logs each message at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn send(&self, letter: DeadLetter) {
        tracing::error!(
            topic = %letter.topic,
            key = ?letter.key,
            payload = %String::from_utf8_lossy(&letter.payload),
            error = %letter.error,
            deliveries = letter.deliveries,
            "order signal dead-lettered"
        );
    }
}

/// In-memory dead-letter sink for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeadLetterSink {
    letters: Arc<RwLock<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn letters(&self) -> Vec<DeadLetter> {
        self.letters.read().await.clone()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn send(&self, letter: DeadLetter) {
        self.letters.write().await.push(letter);
    }
}

/// What happened to one inbound message. Every disposition means the message
/// may be acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The signal was applied, or was a harmless duplicate.
    Applied,
    /// The signal was refused by a business rule.
    Rejected,
    /// The signal was handed to the dead-letter sink.
    DeadLettered,
}

/// Drives the reservation service from order lifecycle signals.
pub struct OrderEventListener<S: InventoryStore> {
    service: Arc<ReservationService<S>>,
    dead_letters: Arc<dyn DeadLetterSink>,
    max_deliveries: u32,
    redelivery_delay: Duration,
}

impl<S: InventoryStore> OrderEventListener<S> {
    pub fn new(service: Arc<ReservationService<S>>, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            service,
            dead_letters,
            max_deliveries: 5,
            redelivery_delay: Duration::from_millis(200),
        }
    }

    /// Sets how many times a message is attempted before it is dead-lettered.
    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// Handles one raw message.
    #[tracing::instrument(skip(self, key, payload), fields(key = ?key))]
    pub async fn handle(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Disposition {
        let signal = match OrderSignal::parse(topic, payload) {
            Ok(signal) => signal,
            Err(e) => {
                metrics::counter!(
                    "order_signals_total",
                    "signal" => "unparseable",
                    "result" => "dead_lettered"
                )
                .increment(1);
                tracing::warn!(error = %e, "undecodable order signal");
                self.dead_letter(topic, key, payload, e.to_string(), 1).await;
                return Disposition::DeadLettered;
            }
        };

        let ctx = RequestContext::system("order-listener");
        let mut delivery = 1;

        loop {
            let result = self.dispatch(&ctx, &signal).await;
            let disposition = match result {
                Ok(()) => Disposition::Applied,
                Err(e) => match e.kind() {
                    ErrorKind::NotFound | ErrorKind::Conflict | ErrorKind::Validation => {
                        tracing::info!(
                            order_id = %signal.order_id(),
                            code = e.code(),
                            error = %e,
                            "order signal rejected"
                        );
                        Disposition::Rejected
                    }
                    ErrorKind::IllegalBookkeeping => {
                        self.dead_letter(topic, key, payload, e.to_string(), delivery)
                            .await;
                        Disposition::DeadLettered
                    }
                    ErrorKind::LockContention | ErrorKind::Internal => {
                        if delivery >= self.max_deliveries {
                            self.dead_letter(topic, key, payload, e.to_string(), delivery)
                                .await;
                            Disposition::DeadLettered
                        } else {
                            tracing::warn!(
                                order_id = %signal.order_id(),
                                delivery,
                                error = %e,
                                "order signal failed, redelivering"
                            );
                            tokio::time::sleep(self.redelivery_delay).await;
                            delivery += 1;
                            continue;
                        }
                    }
                },
            };

            let result = match disposition {
                Disposition::Applied => "applied",
                Disposition::Rejected => "rejected",
                Disposition::DeadLettered => "dead_lettered",
            };
            metrics::counter!("order_signals_total", "signal" => signal.name(), "result" => result)
                .increment(1);
            return disposition;
        }
    }

    async fn dispatch(
        &self,
        ctx: &RequestContext,
        signal: &OrderSignal,
    ) -> Result<(), ServiceError> {
        match signal {
            OrderSignal::Created {
                order_id,
                product_id,
                quantity,
            } => {
                self.service
                    .reserve_stock(ctx, order_id.clone(), product_id.clone(), *quantity)
                    .await?;
            }
            OrderSignal::PaymentConfirmed { order_id } => {
                self.service.confirm_reservation(ctx, order_id).await?;
            }
            OrderSignal::Cancelled { order_id } => {
                self.service.release_reservation(ctx, order_id).await?;
            }
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
        error: String,
        deliveries: u32,
    ) {
        self.dead_letters
            .send(DeadLetter {
                topic: topic.to_string(),
                key: key.map(str::to_string),
                payload: payload.to_vec(),
                error,
                deliveries,
                failed_at: Utc::now(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use domain::ReservationStatus;
    use inventory_store::InMemoryInventoryStore;

    use super::*;
    use crate::config::ReservationConfig;
    use crate::publisher::InMemoryEventPublisher;

    fn created(order: &str, product: &str, quantity: u32) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "orderId": order,
            "productId": product,
            "quantity": quantity,
        }))
        .unwrap()
    }

    fn order_ref(order: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({ "orderId": order })).unwrap()
    }

    async fn listener(
        store: InMemoryInventoryStore,
    ) -> (OrderEventListener<InMemoryInventoryStore>, InMemoryDeadLetterSink) {
        let service = ReservationService::new(store, Arc::new(InMemoryEventPublisher::new()))
            .with_config(ReservationConfig {
                max_attempts: 2,
                retry_base_delay: Duration::from_millis(1),
            });
        service
            .create_inventory(&RequestContext::anonymous(), ProductId::new("P1"), 5)
            .await
            .unwrap();

        let sink = InMemoryDeadLetterSink::new();
        let listener = OrderEventListener::new(Arc::new(service), Arc::new(sink.clone()))
            .with_max_deliveries(3)
            .with_redelivery_delay(Duration::from_millis(1));
        (listener, sink)
    }

    #[test]
    fn parses_each_topic() {
        let signal = OrderSignal::parse("order.created", &created("o-1", "P1", 2)).unwrap();
        assert_eq!(
            signal,
            OrderSignal::Created {
                order_id: OrderId::new("o-1"),
                product_id: ProductId::new("P1"),
                quantity: 2,
            }
        );

        let signal = OrderSignal::parse("order.payment-confirmed", &order_ref("o-1")).unwrap();
        assert_eq!(signal.name(), "payment_confirmed");

        let signal = OrderSignal::parse("order.cancelled", &order_ref("o-1")).unwrap();
        assert_eq!(signal.order_id(), &OrderId::new("o-1"));
    }

    #[test]
    fn rejects_unknown_topic_and_bad_json() {
        assert!(matches!(
            OrderSignal::parse("order.shipped", &order_ref("o-1")),
            Err(ListenerError::UnknownTopic(_))
        ));
        assert!(matches!(
            OrderSignal::parse("order.created", b"{\"orderId\": 1}"),
            Err(ListenerError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn full_lifecycle_is_applied() {
        let (listener, sink) = listener(InMemoryInventoryStore::new()).await;

        let d = listener
            .handle("order.created", Some("o-1"), &created("o-1", "P1", 2))
            .await;
        assert_eq!(d, Disposition::Applied);

        let d = listener
            .handle("order.payment-confirmed", Some("o-1"), &order_ref("o-1"))
            .await;
        assert_eq!(d, Disposition::Applied);

        // Redelivered confirm is a harmless duplicate.
        let d = listener
            .handle("order.payment-confirmed", Some("o-1"), &order_ref("o-1"))
            .await;
        assert_eq!(d, Disposition::Applied);

        assert!(sink.letters().await.is_empty());
    }

    #[tokio::test]
    async fn business_rejections_are_acknowledged() {
        let (listener, sink) = listener(InMemoryInventoryStore::new()).await;

        let d = listener
            .handle("order.cancelled", Some("ghost"), &order_ref("ghost"))
            .await;
        assert_eq!(d, Disposition::Rejected);

        listener
            .handle("order.created", Some("o-1"), &created("o-1", "P1", 1))
            .await;
        let d = listener
            .handle("order.created", Some("o-1"), &created("o-1", "P1", 1))
            .await;
        assert_eq!(d, Disposition::Rejected);

        assert!(sink.letters().await.is_empty());
    }

    #[tokio::test]
    async fn created_redelivered_after_cancel_holds_nothing() {
        let store = InMemoryInventoryStore::new();
        let (listener, sink) = listener(store.clone()).await;

        let dispositions = [
            listener
                .handle("order.created", Some("o-1"), &created("o-1", "P1", 4))
                .await,
            listener
                .handle("order.cancelled", Some("o-1"), &order_ref("o-1"))
                .await,
            listener
                .handle("order.created", Some("o-1"), &created("o-1", "P1", 4))
                .await,
        ];
        assert_eq!(
            dispositions,
            [
                Disposition::Applied,
                Disposition::Applied,
                Disposition::Rejected
            ]
        );

        let entry = store.get_entry(&ProductId::new("P1")).await.unwrap().unwrap();
        assert_eq!(entry.reserved_quantity(), 0);
        let latest = store.find_by_order(&OrderId::new("o-1")).await.unwrap().unwrap();
        assert_eq!(latest.status, ReservationStatus::Released);
        assert!(sink.letters().await.is_empty());
    }

    #[tokio::test]
    async fn created_redelivered_after_failure_is_rejected() {
        let store = InMemoryInventoryStore::new();
        let (listener, _sink) = listener(store.clone()).await;

        let d = listener
            .handle("order.created", Some("o-1"), &created("o-1", "P1", 9))
            .await;
        assert_eq!(d, Disposition::Applied);
        let d = listener
            .handle("order.created", Some("o-1"), &created("o-1", "P1", 2))
            .await;
        assert_eq!(d, Disposition::Rejected);

        let entry = store.get_entry(&ProductId::new("P1")).await.unwrap().unwrap();
        assert_eq!(entry.reserved_quantity(), 0);
        let latest = store.find_by_order(&OrderId::new("o-1")).await.unwrap().unwrap();
        assert_eq!(latest.status, ReservationStatus::Failed);
    }

    #[tokio::test]
    async fn undecodable_message_is_dead_lettered_once() {
        let (listener, sink) = listener(InMemoryInventoryStore::new()).await;

        let d = listener.handle("order.created", None, b"not json").await;
        assert_eq!(d, Disposition::DeadLettered);

        let letters = sink.letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].deliveries, 1);
        assert_eq!(letters[0].payload, b"not json".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_contention_is_dead_lettered_after_max_deliveries() {
        let store = InMemoryInventoryStore::new().with_lock_timeout(Duration::from_millis(5));
        let (listener, sink) = listener(store.clone()).await;

        let _held = store.lock_product(&ProductId::new("P1")).await.unwrap();
        let d = listener
            .handle("order.created", Some("o-1"), &created("o-1", "P1", 1))
            .await;
        assert_eq!(d, Disposition::DeadLettered);

        let letters = sink.letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].deliveries, 3);
        assert_eq!(letters[0].key.as_deref(), Some("o-1"));
        assert!(letters[0].error.contains("conflict"));
    }
}
