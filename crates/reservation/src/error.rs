//! Reservation service error types.

use common::{OrderId, ProductId};
use domain::{DomainError, LedgerError, ReservationError, ReservationStatus};
use inventory_store::StoreError;
use thiserror::Error;

/// Coarse classification of a [`ServiceError`], used by callers to decide
/// between rejecting, retrying and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Product or reservation does not exist.
    NotFound,
    /// Business-rule rejection.
    Conflict,
    /// Transient lock contention.
    LockContention,
    /// Over-release or over-confirm: a defect, never retried.
    IllegalBookkeeping,
    /// Malformed request.
    Validation,
    /// Storage or other infrastructure failure.
    Internal,
}

/// Errors that can occur during reservation operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Inventory not found for product: {0}")]
    ProductNotFound(ProductId),

    #[error("Inventory already exists for product: {0}")]
    InventoryAlreadyExists(ProductId),

    #[error("Reservation not found for order: {0}")]
    ReservationNotFound(OrderId),

    #[error("Reservation already exists for order: {0}")]
    DuplicateReservation(OrderId),

    #[error("Cannot move reservation for order {order_id} from {from} to {to}")]
    InvalidTransition {
        order_id: OrderId,
        from: ReservationStatus,
        to: ReservationStatus,
    },

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    /// The entry lock could not be obtained within the retry budget.
    #[error("Reservation conflict on {target} after {attempts} attempt(s), please retry")]
    ReservationConflict { target: String, attempts: u32 },

    #[error("Illegal bookkeeping: {0}")]
    IllegalBookkeeping(LedgerError),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::ProductNotFound(_) => "PRODUCT_NOT_FOUND",
            ServiceError::InventoryAlreadyExists(_) => "INVENTORY_ALREADY_EXISTS",
            ServiceError::ReservationNotFound(_) => "RESERVATION_NOT_FOUND",
            ServiceError::DuplicateReservation(_) => "DUPLICATE_RESERVATION",
            ServiceError::InvalidTransition { .. } => "INVALID_TRANSITION",
            ServiceError::InvalidQuantity(_) => "INVALID_QUANTITY",
            ServiceError::ReservationConflict { .. } => "RESERVATION_CONFLICT",
            ServiceError::IllegalBookkeeping(_) => "ILLEGAL_BOOKKEEPING",
            ServiceError::Store(_) | ServiceError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::ProductNotFound(_) | ServiceError::ReservationNotFound(_) => {
                ErrorKind::NotFound
            }
            ServiceError::InventoryAlreadyExists(_)
            | ServiceError::DuplicateReservation(_)
            | ServiceError::InvalidTransition { .. } => ErrorKind::Conflict,
            ServiceError::InvalidQuantity(_) => ErrorKind::Validation,
            ServiceError::ReservationConflict { .. } => ErrorKind::LockContention,
            ServiceError::IllegalBookkeeping(_) => ErrorKind::IllegalBookkeeping,
            ServiceError::Store(_) | ServiceError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if re-running the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::LockContention
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ProductNotFound(product_id) => ServiceError::ProductNotFound(product_id),
            StoreError::ProductAlreadyExists(product_id) => {
                ServiceError::InventoryAlreadyExists(product_id)
            }
            StoreError::DuplicateReservation(order_id) => {
                ServiceError::DuplicateReservation(order_id)
            }
            StoreError::LockTimeout { target, .. } => ServiceError::ReservationConflict {
                target,
                attempts: 1,
            },
            StoreError::VersionConflict { entry_id, .. } => ServiceError::ReservationConflict {
                target: format!("ledger entry {entry_id}"),
                attempts: 1,
            },
            other => ServiceError::Store(other),
        }
    }
}

impl From<DomainError> for ServiceError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::Ledger(e) if e.is_bookkeeping() => ServiceError::IllegalBookkeeping(e),
            // Reserve is only called after an availability check.
            DomainError::Ledger(e @ LedgerError::InsufficientStock { .. }) => {
                ServiceError::IllegalBookkeeping(e)
            }
            DomainError::Ledger(e) => ServiceError::InvalidQuantity(e.to_string()),
            DomainError::Reservation(ReservationError::InvalidTransition {
                order_id,
                from,
                to,
            }) => ServiceError::InvalidTransition { order_id, from, to },
            DomainError::Reservation(ReservationError::ZeroQuantity) => {
                ServiceError::InvalidQuantity("quantity must be positive".to_string())
            }
            DomainError::Reservation(e) => ServiceError::Internal(e.to_string()),
        }
    }
}

impl From<LedgerError> for ServiceError {
    fn from(e: LedgerError) -> Self {
        DomainError::from(e).into()
    }
}

impl From<ReservationError> for ServiceError {
    fn from(e: ReservationError) -> Self {
        DomainError::from(e).into()
    }
}

/// Convenience type alias for service results.
pub type Result<T> = std::result::Result<T, ServiceError>;
