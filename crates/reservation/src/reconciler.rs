//! Republishes events whose publish was never confirmed.
//!
//! The orchestrator publishes after commit and stamps `event_published_at`
//! on success. A crash or broker outage between the two leaves the marker
//! empty; the sweep finds those records and publishes again. Subscribers see
//! at-least-once delivery.
//!
//! Each republish happens under the record's ledger entry lock, after a
//! re-read. A record that changed since the sweep listed it is skipped, so a
//! stale event can never follow the event of a later transition.

use std::sync::Arc;

use chrono::Utc;
use domain::ReservationRecord;
use inventory_store::{InventoryStore, LedgerTransaction, StoreError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ReconcilerConfig;
use crate::publisher::{EventPublisher, publish_record};

pub struct Reconciler<S: InventoryStore> {
    store: S,
    publisher: Arc<dyn EventPublisher>,
    config: ReconcilerConfig,
}

impl<S: InventoryStore + 'static> Reconciler<S> {
    pub fn new(store: S, publisher: Arc<dyn EventPublisher>, config: ReconcilerConfig) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// Runs one sweep and returns how many events went out.
    pub async fn run_once(&self) -> Result<usize, StoreError> {
        let grace =
            chrono::Duration::from_std(self.config.grace).unwrap_or(chrono::Duration::zero());
        let cutoff = Utc::now() - grace;

        let owed = self
            .store
            .unpublished_reservations(cutoff, self.config.batch_size)
            .await?;

        let mut republished = 0;
        for record in &owed {
            if self.republish(record).await {
                republished += 1;
            }
        }

        if republished > 0 {
            metrics::counter!("reconciliation_republished_total").increment(republished as u64);
            tracing::info!(
                republished,
                owed = owed.len(),
                "reconciliation sweep republished events"
            );
        } else if !owed.is_empty() {
            tracing::warn!(owed = owed.len(), "reconciliation sweep could not publish");
        }
        Ok(republished)
    }

    /// Publishes the event owed for `listed` while holding its entry lock.
    async fn republish(&self, listed: &ReservationRecord) -> bool {
        let mut tx = match self.store.lock_entry(listed.ledger_entry_id).await {
            Ok(tx) => tx,
            Err(e) => {
                tracing::debug!(
                    reservation_id = %listed.id,
                    error = %e,
                    "ledger entry busy, left for next sweep"
                );
                return false;
            }
        };

        let current = match tx.find_by_order(&listed.order_id).await {
            Ok(Some(current))
                if current.id == listed.id
                    && current.status == listed.status
                    && current.updated_at == listed.updated_at
                    && current.owes_event() =>
            {
                current
            }
            Ok(_) => {
                tracing::debug!(
                    reservation_id = %listed.id,
                    "record moved on since the sweep read it, skipped"
                );
                return false;
            }
            Err(e) => {
                tracing::warn!(reservation_id = %listed.id, error = %e, "re-read failed");
                return false;
            }
        };

        // Nothing is staged; dropping `tx` afterwards only releases the lock.
        publish_record(&self.store, self.publisher.as_ref(), &current).await
    }

    /// Sweeps on the configured interval until `shutdown` flips to true.
    ///
    /// Returns `None` when the interval is zero.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if !self.config.is_enabled() {
            tracing::info!("reconciliation sweep disabled");
            return None;
        }

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            tracing::error!(error = %e, "reconciliation sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("reconciliation sweep stopped");
                            break;
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::DateTime;
    use common::{LedgerEntryId, OrderId, ProductId, RequestContext, ReservationId};
    use domain::{ReservationStatus, StockLedgerEntry};
    use inventory_store::InMemoryInventoryStore;
    use inventory_store::memory::InMemoryLedgerTransaction;

    use super::*;
    use crate::publisher::InMemoryEventPublisher;
    use crate::service::ReservationService;

    /// Store that cancels an order right after the sweep has listed the
    /// records owing events, before any of them is republished.
    struct CancelAfterListing {
        inner: InMemoryInventoryStore,
        service: Arc<ReservationService<InMemoryInventoryStore>>,
        order_id: OrderId,
    }

    #[async_trait]
    impl InventoryStore for CancelAfterListing {
        type Tx = InMemoryLedgerTransaction;

        async fn create_entry(
            &self,
            entry: StockLedgerEntry,
        ) -> inventory_store::Result<StockLedgerEntry> {
            self.inner.create_entry(entry).await
        }

        async fn get_entry(
            &self,
            product_id: &ProductId,
        ) -> inventory_store::Result<Option<StockLedgerEntry>> {
            self.inner.get_entry(product_id).await
        }

        async fn lock_product(&self, product_id: &ProductId) -> inventory_store::Result<Self::Tx> {
            self.inner.lock_product(product_id).await
        }

        async fn lock_entry(&self, entry_id: LedgerEntryId) -> inventory_store::Result<Self::Tx> {
            self.inner.lock_entry(entry_id).await
        }

        async fn find_by_order(
            &self,
            order_id: &OrderId,
        ) -> inventory_store::Result<Option<ReservationRecord>> {
            self.inner.find_by_order(order_id).await
        }

        async fn reservations_for_entry(
            &self,
            entry_id: LedgerEntryId,
        ) -> inventory_store::Result<Vec<ReservationRecord>> {
            self.inner.reservations_for_entry(entry_id).await
        }

        async fn unpublished_reservations(
            &self,
            updated_before: DateTime<Utc>,
            limit: usize,
        ) -> inventory_store::Result<Vec<ReservationRecord>> {
            let listed = self
                .inner
                .unpublished_reservations(updated_before, limit)
                .await?;
            self.service
                .release_reservation(&RequestContext::system("test"), &self.order_id)
                .await
                .unwrap();
            Ok(listed)
        }

        async fn mark_published(
            &self,
            id: ReservationId,
            status: ReservationStatus,
            at: DateTime<Utc>,
        ) -> inventory_store::Result<bool> {
            self.inner.mark_published(id, status, at).await
        }
    }

    fn no_grace() -> ReconcilerConfig {
        ReconcilerConfig {
            interval: Duration::from_secs(1),
            grace: Duration::ZERO,
            batch_size: 10,
        }
    }

    #[tokio::test]
    async fn republishes_after_failed_publish_and_then_settles() {
        let store = InMemoryInventoryStore::new();
        let publisher = InMemoryEventPublisher::new();
        let service = ReservationService::new(store.clone(), Arc::new(publisher.clone()));
        let ctx = RequestContext::anonymous();
        service
            .create_inventory(&ctx, ProductId::new("P1"), 5)
            .await
            .unwrap();

        publisher.set_failing(true);
        service
            .reserve_stock(&ctx, OrderId::new("order-1"), ProductId::new("P1"), 2)
            .await
            .unwrap();
        assert!(publisher.published().await.is_empty());
        publisher.set_failing(false);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let reconciler = Reconciler::new(store, Arc::new(publisher.clone()), no_grace());
        assert_eq!(reconciler.run_once().await.unwrap(), 1);
        assert_eq!(
            publisher.published_to("reservation.succeeded").await.len(),
            1
        );

        assert_eq!(reconciler.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn release_during_sweep_suppresses_stale_success() {
        let store = InMemoryInventoryStore::new();
        let publisher = InMemoryEventPublisher::new();
        let service = Arc::new(ReservationService::new(
            store.clone(),
            Arc::new(publisher.clone()),
        ));
        let ctx = RequestContext::anonymous();
        let order = OrderId::new("order-1");
        service
            .create_inventory(&ctx, ProductId::new("P1"), 5)
            .await
            .unwrap();

        publisher.set_failing(true);
        service
            .reserve_stock(&ctx, order.clone(), ProductId::new("P1"), 2)
            .await
            .unwrap();
        publisher.set_failing(false);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let racing = CancelAfterListing {
            inner: store.clone(),
            service: Arc::clone(&service),
            order_id: order.clone(),
        };
        let reconciler = Reconciler::new(racing, Arc::new(publisher.clone()), no_grace());
        assert_eq!(reconciler.run_once().await.unwrap(), 0);

        let topics: Vec<_> = publisher
            .published()
            .await
            .iter()
            .map(|e| e.topic())
            .collect();
        assert_eq!(topics, vec!["reservation.compensated"]);

        let latest = store.find_by_order(&order).await.unwrap().unwrap();
        assert_eq!(latest.status, ReservationStatus::Released);
        assert!(!latest.owes_event());
    }

    #[tokio::test]
    async fn locked_entry_is_left_for_the_next_sweep() {
        let store = InMemoryInventoryStore::new().with_lock_timeout(Duration::from_millis(10));
        let publisher = InMemoryEventPublisher::new();
        let service = ReservationService::new(store.clone(), Arc::new(publisher.clone()));
        let ctx = RequestContext::anonymous();
        service
            .create_inventory(&ctx, ProductId::new("P1"), 5)
            .await
            .unwrap();

        publisher.set_failing(true);
        service
            .reserve_stock(&ctx, OrderId::new("order-1"), ProductId::new("P1"), 2)
            .await
            .unwrap();
        publisher.set_failing(false);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let reconciler = Reconciler::new(store.clone(), Arc::new(publisher.clone()), no_grace());
        let held = store.lock_product(&ProductId::new("P1")).await.unwrap();
        assert_eq!(reconciler.run_once().await.unwrap(), 0);
        assert!(publisher.published().await.is_empty());

        drop(held);
        assert_eq!(reconciler.run_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn grace_period_skips_fresh_records() {
        let store = InMemoryInventoryStore::new();
        let publisher = InMemoryEventPublisher::new();
        let service = ReservationService::new(store.clone(), Arc::new(publisher.clone()));
        let ctx = RequestContext::anonymous();
        service
            .create_inventory(&ctx, ProductId::new("P1"), 5)
            .await
            .unwrap();

        publisher.set_failing(true);
        service
            .reserve_stock(&ctx, OrderId::new("order-1"), ProductId::new("P1"), 2)
            .await
            .unwrap();
        publisher.set_failing(false);

        let config = ReconcilerConfig {
            grace: Duration::from_secs(60),
            ..no_grace()
        };
        let reconciler = Reconciler::new(store, Arc::new(publisher.clone()), config);
        assert_eq!(reconciler.run_once().await.unwrap(), 0);
        assert!(publisher.published().await.is_empty());
    }

    #[tokio::test]
    async fn disabled_reconciler_does_not_spawn() {
        let (_tx, rx) = watch::channel(false);
        let config = ReconcilerConfig {
            interval: Duration::ZERO,
            ..no_grace()
        };
        let reconciler = Reconciler::new(
            InMemoryInventoryStore::new(),
            Arc::new(InMemoryEventPublisher::new()),
            config,
        );
        assert!(reconciler.spawn(rx).is_none());
    }

    #[tokio::test]
    async fn spawned_loop_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let reconciler = Reconciler::new(
            InMemoryInventoryStore::new(),
            Arc::new(InMemoryEventPublisher::new()),
            no_grace(),
        );
        let handle = reconciler.spawn(rx).unwrap();

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
