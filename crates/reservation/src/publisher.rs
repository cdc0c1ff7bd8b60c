//! Event publisher trait and in-process implementations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use domain::ReservationRecord;
use inventory_store::InventoryStore;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::events::ReservationEvent;

/// Errors that can occur while publishing an event.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to publish to {topic}: {reason}")]
    Transport { topic: String, reason: String },
}

/// Sends reservation events to downstream subscribers.
///
/// Delivery is at-least-once: the same event may be published more than once,
/// for instance by the reconciliation sweep after a lost acknowledgement.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &ReservationEvent) -> Result<(), PublishError>;
}

/// Publishes the event owed for `record` and stamps its publish marker.
///
/// Failures are logged and counted, never returned: the record has already
/// been committed and the reconciler will pick it up again.
pub(crate) async fn publish_record<S: InventoryStore>(
    store: &S,
    publisher: &dyn EventPublisher,
    record: &ReservationRecord,
) -> bool {
    let Some(event) = ReservationEvent::from_record(record) else {
        return false;
    };
    let topic = event.topic();

    if let Err(e) = publisher.publish(&event).await {
        metrics::counter!("reservation_event_publish_failures_total", "topic" => topic)
            .increment(1);
        tracing::warn!(
            topic,
            order_id = %record.order_id,
            reservation_id = %record.id,
            error = %e,
            "event publish failed, left for reconciliation"
        );
        return false;
    }
    metrics::counter!("reservation_events_published_total", "topic" => topic).increment(1);

    match store
        .mark_published(record.id, record.status, Utc::now())
        .await
    {
        Ok(true) => {}
        Ok(false) => tracing::debug!(
            reservation_id = %record.id,
            "record moved on before publish marker was set"
        ),
        Err(e) => tracing::warn!(
            reservation_id = %record.id,
            error = %e,
            "failed to stamp publish marker, event may be republished"
        ),
    }
    true
}

/// Publisher that only writes events to the log.
///
/// Used when no message broker is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventPublisher;

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: &ReservationEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_string(event)?;
        tracing::info!(topic = event.topic(), key = %event.key(), %payload, "reservation event");
        Ok(())
    }
}

/// In-memory publisher for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventPublisher {
    events: Arc<RwLock<Vec<ReservationEvent>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryEventPublisher {
    /// Creates a new in-memory publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent publish fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns every event published so far, in order.
    pub async fn published(&self) -> Vec<ReservationEvent> {
        self.events.read().await.clone()
    }

    /// Returns the published events for one topic.
    pub async fn published_to(&self, topic: &str) -> Vec<ReservationEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.topic() == topic)
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, event: &ReservationEvent) -> Result<(), PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Transport {
                topic: event.topic().to_string(),
                reason: "publisher unavailable".to_string(),
            });
        }
        self.events.write().await.push(event.clone());
        Ok(())
    }
}
