//! Reservation journal records and their lifecycle.

mod record;
mod state;

pub use record::ReservationRecord;
pub use state::ReservationStatus;

use common::OrderId;
use thiserror::Error;

/// Errors raised by reservation journal rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReservationError {
    /// The requested status change is not an edge of the state machine.
    #[error("Invalid transition for order {order_id}: {from} -> {to}")]
    InvalidTransition {
        order_id: OrderId,
        from: ReservationStatus,
        to: ReservationStatus,
    },

    /// Requested quantity must be strictly positive.
    #[error("Reservation quantity must be positive")]
    ZeroQuantity,

    /// A persisted status string did not match any known status.
    #[error("Unknown reservation status: {0}")]
    UnknownStatus(String),
}
