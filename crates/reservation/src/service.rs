//! Reservation orchestrator.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use common::{OrderId, ProductId, RequestContext, ReservationId};
use domain::{LedgerError, ReservationRecord, ReservationStatus, StockLedgerEntry};
use inventory_store::{InventoryStore, LedgerTransaction};
use serde::Serialize;

use crate::config::ReservationConfig;
use crate::error::{Result, ServiceError};
use crate::publisher::{EventPublisher, publish_record};

/// Outcome code for a reservation that could not be satisfied from stock.
pub const INSUFFICIENT_STOCK: &str = "INSUFFICIENT_STOCK";

/// Reason carried by every compensation event.
pub const COMPENSATION_REASON: &str = "Order cancelled or saga rollback";

/// Result of a reservation attempt that reached the ledger.
///
/// Insufficient stock is a normal outcome here, not an error: a FAILED audit
/// record exists and `success` is false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationOutcome {
    pub success: bool,
    pub reservation_id: ReservationId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub status: ReservationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    pub message: String,
}

impl ReservationOutcome {
    fn from_record(record: &ReservationRecord) -> Self {
        let success = record.status == ReservationStatus::Pending;
        let message = if success {
            "Stock reserved successfully".to_string()
        } else {
            record
                .failure_reason
                .clone()
                .unwrap_or_else(|| "Reservation failed".to_string())
        };

        Self {
            success,
            reservation_id: record.id,
            order_id: record.order_id.clone(),
            product_id: record.product_id.clone(),
            quantity: record.requested_quantity,
            status: record.status,
            code: (!success).then_some(INSUFFICIENT_STOCK),
            message,
        }
    }
}

/// Result of a release or confirm call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    /// The record as it stands after the call.
    pub record: ReservationRecord,
    /// False when the call was an idempotent no-op.
    pub applied: bool,
}

impl TransitionOutcome {
    fn applied(record: ReservationRecord) -> Self {
        Self {
            record,
            applied: true,
        }
    }

    fn unchanged(record: ReservationRecord) -> Self {
        Self {
            record,
            applied: false,
        }
    }
}

/// Reserves, releases and confirms stock for orders.
///
/// Every mutation runs as one unit of work under the exclusive lock of the
/// product's ledger entry: the ledger change and the journal write commit
/// together or not at all. Events are published after commit, outside the
/// lock; a failed publish never undoes the committed change.
///
/// Lock contention is retried with exponential backoff according to
/// [`ReservationConfig`].
pub struct ReservationService<S: InventoryStore> {
    store: S,
    publisher: Arc<dyn EventPublisher>,
    config: ReservationConfig,
}

impl<S: InventoryStore> ReservationService<S> {
    /// Creates a new reservation service with the default retry policy.
    pub fn new(store: S, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            store,
            publisher,
            config: ReservationConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ReservationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn publisher(&self) -> Arc<dyn EventPublisher> {
        Arc::clone(&self.publisher)
    }

    /// Starts tracking a product.
    #[tracing::instrument(
        skip_all,
        fields(product_id = %product_id, correlation_id = %ctx.correlation_id)
    )]
    pub async fn create_inventory(
        &self,
        ctx: &RequestContext,
        product_id: ProductId,
        initial_total: u32,
    ) -> Result<StockLedgerEntry> {
        let entry = self
            .store
            .create_entry(StockLedgerEntry::new(product_id, initial_total))
            .await?;

        tracing::info!(
            entry_id = %entry.id(),
            total = initial_total,
            actor = ctx.actor_or_anonymous(),
            "inventory created"
        );
        Ok(entry)
    }

    /// Reads the current quantities of a product without locking it.
    pub async fn get_inventory(&self, product_id: &ProductId) -> Result<StockLedgerEntry> {
        self.store
            .get_entry(product_id)
            .await?
            .ok_or_else(|| ServiceError::ProductNotFound(product_id.clone()))
    }

    /// Adds received stock to a product's total.
    #[tracing::instrument(
        skip_all,
        fields(
            product_id = %product_id,
            quantity = quantity,
            correlation_id = %ctx.correlation_id,
        )
    )]
    pub async fn add_stock(
        &self,
        ctx: &RequestContext,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<StockLedgerEntry> {
        let entry = self
            .with_retry("add_stock", || async move {
                let mut tx = self.store.lock_product(product_id).await?;
                tx.entry_mut().add_stock(quantity)?;
                Ok::<_, ServiceError>(tx.commit().await?)
            })
            .await?;

        tracing::info!(
            total = entry.total_quantity(),
            available = entry.available_quantity(),
            actor = ctx.actor_or_anonymous(),
            "stock added"
        );
        Ok(entry)
    }

    /// Overwrites a product's total, for stock counts and corrections.
    ///
    /// Rejected with `InvalidQuantity` when the new total is below what is
    /// currently reserved.
    #[tracing::instrument(
        skip_all,
        fields(
            product_id = %product_id,
            total_quantity = total_quantity,
            correlation_id = %ctx.correlation_id,
        )
    )]
    pub async fn set_total(
        &self,
        ctx: &RequestContext,
        product_id: &ProductId,
        total_quantity: u32,
    ) -> Result<StockLedgerEntry> {
        let entry = self
            .with_retry("set_total", || async move {
                let mut tx = self.store.lock_product(product_id).await?;
                tx.entry_mut().set_total(total_quantity)?;
                Ok::<_, ServiceError>(tx.commit().await?)
            })
            .await?;

        tracing::info!(
            total = entry.total_quantity(),
            reserved = entry.reserved_quantity(),
            actor = ctx.actor_or_anonymous(),
            "total quantity updated"
        );
        Ok(entry)
    }

    /// Holds `quantity` units of a product for an order.
    ///
    /// Fails with `DuplicateReservation` if the order already has a record in
    /// the journal (held, consumed, released or failed), `ProductNotFound` for unknown products and
    /// `ReservationConflict` once lock contention outlasts the retry budget.
    /// Insufficient stock yields an unsuccessful outcome backed by a FAILED
    /// record.
    #[tracing::instrument(
        skip_all,
        fields(
            order_id = %order_id,
            product_id = %product_id,
            quantity = quantity,
            correlation_id = %ctx.correlation_id,
        )
    )]
    pub async fn reserve_stock(
        &self,
        ctx: &RequestContext,
        order_id: OrderId,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<ReservationOutcome> {
        let started = Instant::now();

        let result = if quantity == 0 {
            Err(ServiceError::InvalidQuantity(
                "quantity must be positive".to_string(),
            ))
        } else {
            self.with_retry("reserve", || {
                self.try_reserve(&order_id, &product_id, quantity)
            })
            .await
        };

        let record = match result {
            Ok(record) => record,
            Err(e) => {
                metrics::counter!("reservations_total", "outcome" => e.code()).increment(1);
                tracing::warn!(error = %e, code = e.code(), "reservation rejected");
                return Err(e);
            }
        };

        publish_record(&self.store, self.publisher.as_ref(), &record).await;

        let outcome = ReservationOutcome::from_record(&record);
        if outcome.success {
            metrics::counter!("reservations_total", "outcome" => "reserved").increment(1);
            tracing::info!(
                reservation_id = %record.id,
                actor = ctx.actor_or_anonymous(),
                "stock reserved"
            );
        } else {
            metrics::counter!("reservations_total", "outcome" => INSUFFICIENT_STOCK).increment(1);
            tracing::info!(
                reservation_id = %record.id,
                reason = %outcome.message,
                "reservation failed"
            );
        }
        metrics::histogram!("reservation_duration_seconds").record(started.elapsed().as_secs_f64());

        Ok(outcome)
    }

    async fn try_reserve(
        &self,
        order_id: &OrderId,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<ReservationRecord> {
        if let Some(existing) = self.store.find_by_order(order_id).await? {
            reject_existing(&existing)?;
        }

        let mut tx = self.store.lock_product(product_id).await?;

        // Another attempt for the same order may have committed while we waited.
        if let Some(existing) = tx.find_by_order(order_id).await? {
            reject_existing(&existing)?;
        }

        let available = tx.entry().available_quantity();
        if !tx.entry().has_available(quantity) {
            let reason =
                format!("Insufficient stock. Requested: {quantity}, Available: {available}");
            let record = ReservationRecord::failed(tx.entry(), order_id.clone(), quantity, reason)?;
            tx.insert_reservation(record.clone()).await?;
            tx.commit().await?;
            return Ok(record);
        }

        let record = ReservationRecord::pending(tx.entry(), order_id.clone(), quantity)?;
        tx.entry_mut().reserve(quantity)?;
        tx.insert_reservation(record.clone()).await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Gives an order's held stock back (saga compensation).
    ///
    /// Releasing an already released reservation is a no-op. FAILED and
    /// CONFIRMED reservations cannot be released.
    #[tracing::instrument(
        skip_all,
        fields(order_id = %order_id, correlation_id = %ctx.correlation_id)
    )]
    pub async fn release_reservation(
        &self,
        ctx: &RequestContext,
        order_id: &OrderId,
    ) -> Result<TransitionOutcome> {
        let outcome = self
            .with_retry("release", || self.try_release(order_id))
            .await?;

        if !outcome.applied {
            tracing::info!("reservation already released, nothing to do");
            return Ok(outcome);
        }

        metrics::counter!("reservation_releases_total").increment(1);
        tracing::info!(
            reservation_id = %outcome.record.id,
            quantity = outcome.record.requested_quantity,
            actor = ctx.actor_or_anonymous(),
            "reservation released"
        );
        publish_record(&self.store, self.publisher.as_ref(), &outcome.record).await;
        Ok(outcome)
    }

    async fn try_release(&self, order_id: &OrderId) -> Result<TransitionOutcome> {
        let existing = self
            .store
            .find_by_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::ReservationNotFound(order_id.clone()))?;
        if !releasable(&existing)? {
            return Ok(TransitionOutcome::unchanged(existing));
        }

        let mut tx = self.store.lock_entry(existing.ledger_entry_id).await?;
        let mut record = self.relookup(&mut tx, order_id).await?;
        if !releasable(&record)? {
            return Ok(TransitionOutcome::unchanged(record));
        }

        tx.entry_mut()
            .release(record.requested_quantity)
            .map_err(bookkeeping)?;
        record.transition(ReservationStatus::Released, Utc::now(), None)?;
        tx.update_reservation(record.clone()).await?;
        tx.commit().await?;

        Ok(TransitionOutcome::applied(record))
    }

    /// Consumes an order's held stock once payment is confirmed.
    ///
    /// Confirming decrements both total and reserved quantity immediately.
    /// Anything but a PENDING reservation is left untouched, since duplicate
    /// and out-of-order signals are expected.
    #[tracing::instrument(
        skip_all,
        fields(order_id = %order_id, correlation_id = %ctx.correlation_id)
    )]
    pub async fn confirm_reservation(
        &self,
        ctx: &RequestContext,
        order_id: &OrderId,
    ) -> Result<TransitionOutcome> {
        let outcome = self
            .with_retry("confirm", || self.try_confirm(order_id))
            .await?;

        if outcome.applied {
            metrics::counter!("reservation_confirmations_total").increment(1);
            tracing::info!(
                reservation_id = %outcome.record.id,
                quantity = outcome.record.requested_quantity,
                actor = ctx.actor_or_anonymous(),
                "reservation confirmed"
            );
        } else {
            tracing::info!(
                status = %outcome.record.status,
                "reservation not pending, confirm ignored"
            );
        }
        Ok(outcome)
    }

    async fn try_confirm(&self, order_id: &OrderId) -> Result<TransitionOutcome> {
        let existing = self
            .store
            .find_by_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::ReservationNotFound(order_id.clone()))?;
        if existing.status != ReservationStatus::Pending {
            return Ok(TransitionOutcome::unchanged(existing));
        }

        let mut tx = self.store.lock_entry(existing.ledger_entry_id).await?;
        let mut record = self.relookup(&mut tx, order_id).await?;
        if record.status != ReservationStatus::Pending {
            return Ok(TransitionOutcome::unchanged(record));
        }

        tx.entry_mut()
            .confirm(record.requested_quantity)
            .map_err(bookkeeping)?;
        record.transition(ReservationStatus::Confirmed, Utc::now(), None)?;
        tx.update_reservation(record.clone()).await?;
        tx.commit().await?;

        Ok(TransitionOutcome::applied(record))
    }

    /// Returns the latest journal record for an order.
    pub async fn get_reservation(&self, order_id: &OrderId) -> Result<ReservationRecord> {
        self.store
            .find_by_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::ReservationNotFound(order_id.clone()))
    }

    /// Re-reads the order's record under the entry lock.
    ///
    /// If the latest record now belongs to a different entry, the lock we
    /// hold is the wrong one and the operation has to start over.
    async fn relookup(&self, tx: &mut S::Tx, order_id: &OrderId) -> Result<ReservationRecord> {
        let record = tx
            .find_by_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::ReservationNotFound(order_id.clone()))?;

        if record.ledger_entry_id != tx.entry().id() {
            return Err(ServiceError::ReservationConflict {
                target: format!("order {order_id}"),
                attempts: 1,
            });
        }
        Ok(record)
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match attempt_fn().await {
                Err(e) if e.is_retryable() => {
                    metrics::counter!("reservation_conflicts_total", "operation" => operation)
                        .increment(1);

                    if attempt >= max_attempts {
                        let target = match e {
                            ServiceError::ReservationConflict { target, .. } => target,
                            other => other.to_string(),
                        };
                        tracing::warn!(
                            operation,
                            attempts = attempt,
                            lock = %target,
                            "lock contention, giving up"
                        );
                        return Err(ServiceError::ReservationConflict {
                            target,
                            attempts: attempt,
                        });
                    }

                    let delay = self.config.backoff(attempt);
                    tracing::debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "lock contention, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// An order reserves at most once. Any journal record for it, whatever its
/// status, turns a repeated attempt into `DuplicateReservation`.
fn reject_existing(record: &ReservationRecord) -> Result<()> {
    tracing::debug!(
        reservation_id = %record.id,
        status = %record.status,
        "order already has a reservation"
    );
    Err(ServiceError::DuplicateReservation(record.order_id.clone()))
}

/// Ok(true) if the record can be released, Ok(false) if it already was.
fn releasable(record: &ReservationRecord) -> Result<bool> {
    match record.status {
        ReservationStatus::Pending => Ok(true),
        ReservationStatus::Released => Ok(false),
        from => Err(ServiceError::InvalidTransition {
            order_id: record.order_id.clone(),
            from,
            to: ReservationStatus::Released,
        }),
    }
}

fn bookkeeping(e: LedgerError) -> ServiceError {
    let err = ServiceError::from(e);
    if let ServiceError::IllegalBookkeeping(inner) = &err {
        metrics::counter!("ledger_bookkeeping_errors_total").increment(1);
        tracing::error!(error = %inner, "ledger bookkeeping violated");
    }
    err
}
