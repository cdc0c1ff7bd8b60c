//! Domain error types.

use thiserror::Error;

use crate::ledger::LedgerError;
use crate::reservation::ReservationError;

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// A stock ledger rule was violated.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// A reservation journal rule was violated.
    #[error("Reservation error: {0}")]
    Reservation(#[from] ReservationError),
}
