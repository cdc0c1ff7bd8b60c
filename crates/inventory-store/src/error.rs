use std::time::Duration;

use common::{LedgerEntryId, OrderId, ProductId, ReservationId, Version};
use domain::{LedgerError, ReservationError};
use thiserror::Error;

/// Errors that can occur when interacting with the inventory store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A ledger entry already exists for the product.
    #[error("Inventory already exists for product {0}")]
    ProductAlreadyExists(ProductId),

    /// No ledger entry exists for the product.
    #[error("Inventory not found for product {0}")]
    ProductNotFound(ProductId),

    /// No ledger entry exists with the given id.
    #[error("Ledger entry not found: {0}")]
    EntryNotFound(LedgerEntryId),

    /// The order already holds a PENDING reservation.
    #[error("Order {0} already has an active reservation")]
    DuplicateReservation(OrderId),

    /// An update targeted a journal record that does not exist.
    #[error("Reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    /// The exclusive lock on a ledger entry could not be acquired in time.
    #[error("Timed out after {waited:?} waiting for lock on {target}")]
    LockTimeout { target: String, waited: Duration },

    /// The entry changed underneath the transaction.
    #[error("Concurrent update of ledger entry {entry_id}: expected version {expected}, found {actual}")]
    VersionConflict {
        entry_id: LedgerEntryId,
        expected: Version,
        actual: Version,
    },

    /// Persisted data could not be mapped back to domain types.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Returns true for transient contention on a ledger entry. Re-running the
    /// whole operation is the expected response.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            StoreError::LockTimeout { .. } | StoreError::VersionConflict { .. }
        )
    }
}

impl From<LedgerError> for StoreError {
    fn from(e: LedgerError) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

impl From<ReservationError> for StoreError {
    fn from(e: ReservationError) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
