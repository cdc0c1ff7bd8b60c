use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{LedgerEntryId, OrderId, ProductId, ReservationId};
use domain::{ReservationRecord, ReservationStatus, StockLedgerEntry};

use crate::Result;

/// How long a caller waits for an entry lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// A unit of work holding the exclusive lock on one ledger entry.
///
/// Journal writes issued through the transaction become visible to others
/// only on [`commit`](Self::commit). Dropping the transaction rolls back every
/// staged change and releases the lock.
#[async_trait]
pub trait LedgerTransaction: Send {
    /// The locked entry as of lock acquisition, plus any in-transaction changes.
    fn entry(&self) -> &StockLedgerEntry;

    /// Mutable access to the locked entry. Changes are written on commit.
    fn entry_mut(&mut self) -> &mut StockLedgerEntry;

    /// Returns the most recent journal record for an order, including records
    /// staged in this transaction.
    async fn find_by_order(&mut self, order_id: &OrderId) -> Result<Option<ReservationRecord>>;

    /// Adds a journal record.
    ///
    /// Fails with `DuplicateReservation` if the record is PENDING and the order
    /// already has a PENDING record. Implementations may defer the check to
    /// commit.
    async fn insert_reservation(&mut self, record: ReservationRecord) -> Result<()>;

    /// Overwrites an existing journal record.
    async fn update_reservation(&mut self, record: ReservationRecord) -> Result<()>;

    /// Persists the entry and all journal writes atomically, then releases
    /// the lock. Returns the entry as committed.
    async fn commit(self) -> Result<StockLedgerEntry>;
}

/// Storage for ledger entries and reservation records.
///
/// All implementations must be thread-safe (Send + Sync). Mutations of a
/// ledger entry happen only through a [`LedgerTransaction`]; plain reads never
/// take the exclusive lock.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// The transaction type handed out by the lock methods.
    type Tx: LedgerTransaction;

    /// Inserts a new ledger entry.
    ///
    /// Fails with `ProductAlreadyExists` if the product is already tracked.
    async fn create_entry(&self, entry: StockLedgerEntry) -> Result<StockLedgerEntry>;

    /// Reads the current entry for a product without locking it.
    async fn get_entry(&self, product_id: &ProductId) -> Result<Option<StockLedgerEntry>>;

    /// Acquires the exclusive lock on a product's entry.
    ///
    /// Fails with `ProductNotFound` if there is no entry and with
    /// `LockTimeout` if the lock is not granted within the store's timeout.
    async fn lock_product(&self, product_id: &ProductId) -> Result<Self::Tx>;

    /// Acquires the exclusive lock on an entry by id.
    async fn lock_entry(&self, entry_id: LedgerEntryId) -> Result<Self::Tx>;

    /// Returns the most recent committed journal record for an order.
    async fn find_by_order(&self, order_id: &OrderId) -> Result<Option<ReservationRecord>>;

    /// Returns every journal record held against an entry, oldest first.
    async fn reservations_for_entry(
        &self,
        entry_id: LedgerEntryId,
    ) -> Result<Vec<ReservationRecord>>;

    /// Returns records that still owe an outbound event and were last
    /// updated before `updated_before`, oldest first.
    async fn unpublished_reservations(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReservationRecord>>;

    /// Stamps the publish marker of a record, but only if it is still in
    /// `status`. Returns false when the record has moved on in the meantime.
    async fn mark_published(
        &self,
        id: ReservationId,
        status: ReservationStatus,
        at: DateTime<Utc>,
    ) -> Result<bool>;
}
