//! Domain layer for the inventory service.
//!
//! This crate holds the two entities the reservation flow works on:
//! - `StockLedgerEntry`: per-product total/reserved quantities and their invariants
//! - `ReservationRecord`: one journal record per reservation attempt, with the
//!   PENDING → CONFIRMED / FAILED / RELEASED state machine
//!
//! Everything here is synchronous and free of I/O. Locking and persistence
//! live in `inventory-store`.

pub mod error;
pub mod ledger;
pub mod reservation;

pub use error::DomainError;
pub use ledger::{LedgerError, StockLedgerEntry};
pub use reservation::{ReservationError, ReservationRecord, ReservationStatus};
