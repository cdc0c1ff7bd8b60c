use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{LedgerEntryId, OrderId, ProductId, ReservationId, Version};
use domain::{ReservationRecord, ReservationStatus, StockLedgerEntry};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::{
    Result, StoreError,
    store::{DEFAULT_LOCK_TIMEOUT, InventoryStore, LedgerTransaction},
};

/// A ledger entry plus the mutex standing in for its row lock.
struct Slot {
    entry: StockLedgerEntry,
    lock: Arc<Mutex<()>>,
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<LedgerEntryId, Slot>,
    by_product: HashMap<ProductId, LedgerEntryId>,
    /// Journal in insertion order.
    reservations: Vec<ReservationRecord>,
    /// Journal positions, by record id and by order (oldest first).
    by_id: HashMap<ReservationId, usize>,
    by_order: HashMap<OrderId, Vec<usize>>,
}

impl MemoryState {
    fn latest_for_order(&self, order_id: &OrderId) -> Option<&ReservationRecord> {
        self.by_order
            .get(order_id)
            .and_then(|positions| positions.last())
            .map(|&i| &self.reservations[i])
    }

    fn records_for_order<'a>(
        &'a self,
        order_id: &OrderId,
    ) -> impl Iterator<Item = &'a ReservationRecord> + 'a {
        self.by_order
            .get(order_id)
            .into_iter()
            .flatten()
            .map(|&i| &self.reservations[i])
    }

    fn append(&mut self, record: ReservationRecord) {
        let position = self.reservations.len();
        self.by_id.insert(record.id, position);
        self.by_order
            .entry(record.order_id.clone())
            .or_default()
            .push(position);
        self.reservations.push(record);
    }

    /// Checks staged writes in order, seeing each earlier write, without
    /// touching the journal.
    fn validate(&self, writes: &[JournalWrite]) -> Result<()> {
        for (i, write) in writes.iter().enumerate() {
            let earlier = &writes[..i];
            match write {
                JournalWrite::Insert(record) => {
                    let committed = self
                        .records_for_order(&record.order_id)
                        .map(|r| latest_staged(earlier, r));
                    let staged = earlier.iter().filter_map(|w| match w {
                        JournalWrite::Insert(r) if r.order_id == record.order_id => {
                            Some(latest_staged(earlier, r))
                        }
                        _ => None,
                    });
                    check_no_pending(committed.chain(staged), record)?;
                }
                JournalWrite::Update(record) => {
                    let known = self.by_id.contains_key(&record.id)
                        || earlier
                            .iter()
                            .any(|w| matches!(w, JournalWrite::Insert(r) if r.id == record.id));
                    if !known {
                        return Err(StoreError::ReservationNotFound(record.id));
                    }
                }
            }
        }
        Ok(())
    }
}

/// In-memory inventory store for tests and single-process deployments.
///
/// Row locks are emulated with one async mutex per ledger entry, held by the
/// [`InMemoryLedgerTransaction`] until it commits or is dropped.
#[derive(Clone)]
pub struct InMemoryInventoryStore {
    state: Arc<RwLock<MemoryState>>,
    lock_timeout: Duration,
}

impl Default for InMemoryInventoryStore {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl InMemoryInventoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long lock acquisition may wait.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Returns the total number of journal records.
    pub async fn reservation_count(&self) -> usize {
        self.state.read().await.reservations.len()
    }

    async fn acquire(
        &self,
        entry_id: LedgerEntryId,
        target: String,
    ) -> Result<InMemoryLedgerTransaction> {
        let lock = {
            let state = self.state.read().await;
            state
                .entries
                .get(&entry_id)
                .map(|slot| slot.lock.clone())
                .ok_or(StoreError::EntryNotFound(entry_id))?
        };

        let guard = tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                tracing::debug!(%target, "ledger entry lock wait timed out");
                StoreError::LockTimeout {
                    target,
                    waited: self.lock_timeout,
                }
            })?;

        // Re-read under the lock; the copy taken before waiting may be stale.
        let entry = {
            let state = self.state.read().await;
            state
                .entries
                .get(&entry_id)
                .map(|slot| slot.entry.clone())
                .ok_or(StoreError::EntryNotFound(entry_id))?
        };

        Ok(InMemoryLedgerTransaction {
            state: self.state.clone(),
            _guard: guard,
            original_version: entry.version(),
            entry,
            writes: Vec::new(),
        })
    }
}

enum JournalWrite {
    Insert(ReservationRecord),
    Update(ReservationRecord),
}

impl JournalWrite {
    fn record(&self) -> &ReservationRecord {
        match self {
            JournalWrite::Insert(r) | JournalWrite::Update(r) => r,
        }
    }
}

/// Unit of work against an [`InMemoryInventoryStore`] entry.
pub struct InMemoryLedgerTransaction {
    state: Arc<RwLock<MemoryState>>,
    _guard: OwnedMutexGuard<()>,
    original_version: Version,
    entry: StockLedgerEntry,
    writes: Vec<JournalWrite>,
}

/// The newest staged version of `record`, or `record` itself.
fn latest_staged<'a>(
    writes: &'a [JournalWrite],
    record: &'a ReservationRecord,
) -> &'a ReservationRecord {
    writes
        .iter()
        .rev()
        .map(JournalWrite::record)
        .find(|r| r.id == record.id)
        .unwrap_or(record)
}

fn check_no_pending<'a>(
    others: impl IntoIterator<Item = &'a ReservationRecord>,
    record: &ReservationRecord,
) -> Result<()> {
    if !record.status.holds_stock() {
        return Ok(());
    }
    let clash = others
        .into_iter()
        .any(|r| r.id != record.id && r.status.holds_stock());
    if clash {
        return Err(StoreError::DuplicateReservation(record.order_id.clone()));
    }
    Ok(())
}

#[async_trait]
impl LedgerTransaction for InMemoryLedgerTransaction {
    fn entry(&self) -> &StockLedgerEntry {
        &self.entry
    }

    fn entry_mut(&mut self) -> &mut StockLedgerEntry {
        &mut self.entry
    }

    async fn find_by_order(&mut self, order_id: &OrderId) -> Result<Option<ReservationRecord>> {
        let state = self.state.read().await;
        let mut latest = state.latest_for_order(order_id).cloned();

        for write in &self.writes {
            match write {
                JournalWrite::Insert(r) if &r.order_id == order_id => latest = Some(r.clone()),
                JournalWrite::Update(r) if latest.as_ref().is_some_and(|l| l.id == r.id) => {
                    latest = Some(r.clone());
                }
                _ => {}
            }
        }

        Ok(latest)
    }

    async fn insert_reservation(&mut self, record: ReservationRecord) -> Result<()> {
        self.writes.push(JournalWrite::Insert(record));
        let state = self.state.read().await;
        if let Err(e) = state.validate(&self.writes) {
            self.writes.pop();
            return Err(e);
        }
        Ok(())
    }

    async fn update_reservation(&mut self, record: ReservationRecord) -> Result<()> {
        self.writes.push(JournalWrite::Update(record));
        Ok(())
    }

    async fn commit(self) -> Result<StockLedgerEntry> {
        let mut state = self.state.write().await;
        let entry_id = self.entry.id();

        let current = state
            .entries
            .get(&entry_id)
            .map(|slot| slot.entry.version())
            .ok_or(StoreError::EntryNotFound(entry_id))?;
        if current != self.original_version {
            return Err(StoreError::VersionConflict {
                entry_id,
                expected: self.original_version,
                actual: current,
            });
        }

        // Nothing is applied unless every write passes.
        state.validate(&self.writes)?;
        for write in self.writes {
            match write {
                JournalWrite::Insert(record) => state.append(record),
                JournalWrite::Update(record) => {
                    // Updates of records inserted by this commit resolve here too.
                    if let Some(&i) = state.by_id.get(&record.id) {
                        state.reservations[i] = record;
                    }
                }
            }
        }

        if let Some(slot) = state.entries.get_mut(&entry_id) {
            slot.entry = self.entry.clone();
        }

        Ok(self.entry)
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    type Tx = InMemoryLedgerTransaction;

    async fn create_entry(&self, entry: StockLedgerEntry) -> Result<StockLedgerEntry> {
        let mut state = self.state.write().await;
        if state.by_product.contains_key(entry.product_id()) {
            return Err(StoreError::ProductAlreadyExists(entry.product_id().clone()));
        }

        state
            .by_product
            .insert(entry.product_id().clone(), entry.id());
        state.entries.insert(
            entry.id(),
            Slot {
                entry: entry.clone(),
                lock: Arc::new(Mutex::new(())),
            },
        );
        Ok(entry)
    }

    async fn get_entry(&self, product_id: &ProductId) -> Result<Option<StockLedgerEntry>> {
        let state = self.state.read().await;
        Ok(state
            .by_product
            .get(product_id)
            .and_then(|id| state.entries.get(id))
            .map(|slot| slot.entry.clone()))
    }

    async fn lock_product(&self, product_id: &ProductId) -> Result<Self::Tx> {
        let entry_id = {
            let state = self.state.read().await;
            *state
                .by_product
                .get(product_id)
                .ok_or_else(|| StoreError::ProductNotFound(product_id.clone()))?
        };
        self.acquire(entry_id, format!("product {product_id}"))
            .await
    }

    async fn lock_entry(&self, entry_id: LedgerEntryId) -> Result<Self::Tx> {
        self.acquire(entry_id, format!("ledger entry {entry_id}"))
            .await
    }

    async fn find_by_order(&self, order_id: &OrderId) -> Result<Option<ReservationRecord>> {
        let state = self.state.read().await;
        Ok(state.latest_for_order(order_id).cloned())
    }

    async fn reservations_for_entry(
        &self,
        entry_id: LedgerEntryId,
    ) -> Result<Vec<ReservationRecord>> {
        let state = self.state.read().await;
        Ok(state
            .reservations
            .iter()
            .filter(|r| r.ledger_entry_id == entry_id)
            .cloned()
            .collect())
    }

    async fn unpublished_reservations(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReservationRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<_> = state
            .reservations
            .iter()
            .filter(|r| r.owes_event() && r.updated_at < updated_before)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.updated_at);
        records.truncate(limit);
        Ok(records)
    }

    async fn mark_published(
        &self,
        id: ReservationId,
        status: ReservationStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let position = *state
            .by_id
            .get(&id)
            .ok_or(StoreError::ReservationNotFound(id))?;
        let record = &mut state.reservations[position];

        if record.status != status {
            return Ok(false);
        }
        record.mark_published(at);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with(product: &str, total: u32) -> (InMemoryInventoryStore, StockLedgerEntry) {
        let store = InMemoryInventoryStore::new();
        let entry = store
            .create_entry(StockLedgerEntry::new(ProductId::new(product), total))
            .await
            .unwrap();
        (store, entry)
    }

    #[tokio::test]
    async fn create_entry_rejects_duplicate_product() {
        let (store, _) = store_with("P1", 10).await;

        let result = store
            .create_entry(StockLedgerEntry::new(ProductId::new("P1"), 5))
            .await;
        assert!(matches!(result, Err(StoreError::ProductAlreadyExists(_))));

        let entry = store.get_entry(&ProductId::new("P1")).await.unwrap().unwrap();
        assert_eq!(entry.total_quantity(), 10);
    }

    #[tokio::test]
    async fn lock_unknown_product_is_not_found() {
        let store = InMemoryInventoryStore::new();
        let result = store.lock_product(&ProductId::new("P9")).await;
        assert!(matches!(result, Err(StoreError::ProductNotFound(_))));
    }

    #[tokio::test]
    async fn commit_writes_entry_and_journal_together() {
        let (store, _) = store_with("P1", 10).await;

        let mut tx = store.lock_product(&ProductId::new("P1")).await.unwrap();
        let record = ReservationRecord::pending(tx.entry(), OrderId::new("order-1"), 4).unwrap();
        tx.entry_mut().reserve(4).unwrap();
        tx.insert_reservation(record.clone()).await.unwrap();
        let committed = tx.commit().await.unwrap();

        assert_eq!(committed.reserved_quantity(), 4);
        let stored = store.get_entry(&ProductId::new("P1")).await.unwrap().unwrap();
        assert_eq!(stored.available_quantity(), 6);
        assert_eq!(stored.version(), Version::new(1));

        let found = store
            .find_by_order(&OrderId::new("order-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, record.id);
    }

    #[tokio::test]
    async fn dropping_transaction_rolls_back() {
        let (store, _) = store_with("P1", 10).await;

        {
            let mut tx = store.lock_product(&ProductId::new("P1")).await.unwrap();
            let record =
                ReservationRecord::pending(tx.entry(), OrderId::new("order-1"), 4).unwrap();
            tx.entry_mut().reserve(4).unwrap();
            tx.insert_reservation(record).await.unwrap();
        }

        let stored = store.get_entry(&ProductId::new("P1")).await.unwrap().unwrap();
        assert_eq!(stored.reserved_quantity(), 0);
        assert_eq!(store.reservation_count().await, 0);

        // Lock was released by the drop.
        assert!(store.lock_product(&ProductId::new("P1")).await.is_ok());
    }

    #[tokio::test]
    async fn second_locker_times_out_while_first_holds() {
        let (store, _) = store_with("P1", 10).await;
        let store = store.with_lock_timeout(Duration::from_millis(20));

        let _held = store.lock_product(&ProductId::new("P1")).await.unwrap();
        let result = store.lock_product(&ProductId::new("P1")).await;

        assert!(matches!(result, Err(StoreError::LockTimeout { .. })));
        assert!(result.err().is_some_and(|e| e.is_contention()));
    }

    #[tokio::test]
    async fn different_products_lock_independently() {
        let store = InMemoryInventoryStore::new().with_lock_timeout(Duration::from_millis(20));
        store
            .create_entry(StockLedgerEntry::new(ProductId::new("P1"), 1))
            .await
            .unwrap();
        store
            .create_entry(StockLedgerEntry::new(ProductId::new("P2"), 1))
            .await
            .unwrap();

        let _p1 = store.lock_product(&ProductId::new("P1")).await.unwrap();
        assert!(store.lock_product(&ProductId::new("P2")).await.is_ok());
    }

    #[tokio::test]
    async fn second_pending_record_for_order_is_rejected() {
        let store = InMemoryInventoryStore::new();
        store
            .create_entry(StockLedgerEntry::new(ProductId::new("P1"), 10))
            .await
            .unwrap();
        store
            .create_entry(StockLedgerEntry::new(ProductId::new("P2"), 10))
            .await
            .unwrap();

        let mut tx = store.lock_product(&ProductId::new("P1")).await.unwrap();
        let record = ReservationRecord::pending(tx.entry(), OrderId::new("order-1"), 1).unwrap();
        tx.insert_reservation(record).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.lock_product(&ProductId::new("P2")).await.unwrap();
        let record = ReservationRecord::pending(tx.entry(), OrderId::new("order-1"), 1).unwrap();
        let result = tx.insert_reservation(record).await;
        assert!(matches!(result, Err(StoreError::DuplicateReservation(_))));
    }

    #[tokio::test]
    async fn failed_records_do_not_block_new_attempts() {
        let (store, _) = store_with("P1", 10).await;

        let mut tx = store.lock_product(&ProductId::new("P1")).await.unwrap();
        let failed =
            ReservationRecord::failed(tx.entry(), OrderId::new("order-1"), 20, "no stock").unwrap();
        tx.insert_reservation(failed).await.unwrap();
        let pending = ReservationRecord::pending(tx.entry(), OrderId::new("order-1"), 2).unwrap();
        tx.insert_reservation(pending.clone()).await.unwrap();

        let latest = tx
            .find_by_order(&OrderId::new("order-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, pending.id);
        tx.commit().await.unwrap();

        assert_eq!(store.reservation_count().await, 2);
    }

    #[tokio::test]
    async fn rejected_commit_leaves_journal_untouched() {
        let store = InMemoryInventoryStore::new();
        for product in ["P1", "P2"] {
            store
                .create_entry(StockLedgerEntry::new(ProductId::new(product), 10))
                .await
                .unwrap();
        }

        let mut first = store.lock_product(&ProductId::new("P1")).await.unwrap();
        let mut second = store.lock_product(&ProductId::new("P2")).await.unwrap();

        let record = ReservationRecord::pending(first.entry(), OrderId::new("order-1"), 1).unwrap();
        first.entry_mut().reserve(1).unwrap();
        first.insert_reservation(record).await.unwrap();

        let other = ReservationRecord::pending(second.entry(), OrderId::new("order-3"), 2).unwrap();
        let clash = ReservationRecord::pending(second.entry(), OrderId::new("order-1"), 2).unwrap();
        second.entry_mut().reserve(4).unwrap();
        second.insert_reservation(other).await.unwrap();
        second.insert_reservation(clash).await.unwrap();

        first.commit().await.unwrap();
        let result = second.commit().await;
        assert!(matches!(result, Err(StoreError::DuplicateReservation(_))));

        assert_eq!(store.reservation_count().await, 1);
        assert!(
            store
                .find_by_order(&OrderId::new("order-3"))
                .await
                .unwrap()
                .is_none()
        );
        let p2 = store.get_entry(&ProductId::new("P2")).await.unwrap().unwrap();
        assert_eq!(p2.reserved_quantity(), 0);
    }

    #[tokio::test]
    async fn latest_record_follows_updates_and_inserts_in_one_commit() {
        let (store, _) = store_with("P1", 10).await;

        let mut tx = store.lock_product(&ProductId::new("P1")).await.unwrap();
        let first = ReservationRecord::pending(tx.entry(), OrderId::new("order-1"), 3).unwrap();
        tx.insert_reservation(first.clone()).await.unwrap();
        let unrelated = ReservationRecord::pending(tx.entry(), OrderId::new("order-2"), 1).unwrap();
        tx.insert_reservation(unrelated.clone()).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.lock_product(&ProductId::new("P1")).await.unwrap();
        let mut released = first.clone();
        released
            .transition(ReservationStatus::Released, Utc::now(), None)
            .unwrap();
        tx.update_reservation(released).await.unwrap();
        let replacement =
            ReservationRecord::pending(tx.entry(), OrderId::new("order-1"), 2).unwrap();
        tx.insert_reservation(replacement.clone()).await.unwrap();
        tx.commit().await.unwrap();

        let latest = store
            .find_by_order(&OrderId::new("order-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, replacement.id);
        let other = store
            .find_by_order(&OrderId::new("order-2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(other.id, unrelated.id);

        assert!(
            store
                .mark_published(first.id, ReservationStatus::Released, Utc::now())
                .await
                .unwrap()
        );
        assert_eq!(store.reservation_count().await, 3);
    }

    #[tokio::test]
    async fn update_of_unknown_record_fails_commit() {
        let (store, _) = store_with("P1", 10).await;

        let mut tx = store.lock_product(&ProductId::new("P1")).await.unwrap();
        let ghost = ReservationRecord::pending(tx.entry(), OrderId::new("order-9"), 1).unwrap();
        tx.update_reservation(ghost.clone()).await.unwrap();

        let result = tx.commit().await;
        assert!(matches!(result, Err(StoreError::ReservationNotFound(id)) if id == ghost.id));
        assert_eq!(store.reservation_count().await, 0);
    }

    #[tokio::test]
    async fn update_is_visible_inside_transaction_before_commit() {
        let (store, _) = store_with("P1", 10).await;

        let mut tx = store.lock_product(&ProductId::new("P1")).await.unwrap();
        let record = ReservationRecord::pending(tx.entry(), OrderId::new("order-1"), 3).unwrap();
        tx.entry_mut().reserve(3).unwrap();
        tx.insert_reservation(record).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.lock_product(&ProductId::new("P1")).await.unwrap();
        let mut record = tx
            .find_by_order(&OrderId::new("order-1"))
            .await
            .unwrap()
            .unwrap();
        record
            .transition(ReservationStatus::Released, Utc::now(), None)
            .unwrap();
        tx.update_reservation(record).await.unwrap();

        let seen = tx
            .find_by_order(&OrderId::new("order-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.status, ReservationStatus::Released);

        let committed = store
            .find_by_order(&OrderId::new("order-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(committed.status, ReservationStatus::Pending);
    }

    #[tokio::test]
    async fn mark_published_respects_status_guard() {
        let (store, _) = store_with("P1", 10).await;

        let mut tx = store.lock_product(&ProductId::new("P1")).await.unwrap();
        let record = ReservationRecord::pending(tx.entry(), OrderId::new("order-1"), 1).unwrap();
        tx.insert_reservation(record.clone()).await.unwrap();
        tx.commit().await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(1);
        let owed = store.unpublished_reservations(later, 10).await.unwrap();
        assert_eq!(owed.len(), 1);

        let stale = store
            .mark_published(record.id, ReservationStatus::Released, Utc::now())
            .await
            .unwrap();
        assert!(!stale);

        let marked = store
            .mark_published(record.id, ReservationStatus::Pending, Utc::now())
            .await
            .unwrap();
        assert!(marked);
        assert!(store.unpublished_reservations(later, 10).await.unwrap().is_empty());
    }
}
