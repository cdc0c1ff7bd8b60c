//! Persistence for the stock ledger and the reservation journal.
//!
//! A reservation decision touches one ledger entry and one journal record and
//! must commit both or neither, while holding an exclusive lock on the entry.
//! [`InventoryStore::lock_product`] opens such a unit of work; dropping the
//! returned [`LedgerTransaction`] without committing rolls it back.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::InMemoryInventoryStore;
pub use postgres::PostgresInventoryStore;
pub use store::{DEFAULT_LOCK_TIMEOUT, InventoryStore, LedgerTransaction};
