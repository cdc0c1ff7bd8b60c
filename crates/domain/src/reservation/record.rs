//! Reservation journal record.

use chrono::{DateTime, Utc};
use common::{LedgerEntryId, OrderId, ProductId, ReservationId};
use serde::{Deserialize, Serialize};

use super::{ReservationError, ReservationStatus};
use crate::ledger::StockLedgerEntry;

/// One reservation attempt for one order against one ledger entry.
///
/// Records are never deleted. Status changes go through
/// [`transition`](Self::transition), which enforces the state machine and
/// stamps each transition timestamp exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRecord {
    pub id: ReservationId,
    /// The ledger entry the quantity is held against.
    pub ledger_entry_id: LedgerEntryId,
    /// Denormalized from the ledger entry for event payloads.
    pub product_id: ProductId,
    pub order_id: OrderId,
    pub requested_quantity: u32,
    pub status: ReservationStatus,
    /// Set only when the record is FAILED.
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// When the outbound event for the current status was last published.
    /// `None` means an event is still owed (see [`owes_event`](Self::owes_event)).
    pub event_published_at: Option<DateTime<Utc>>,
}

impl ReservationRecord {
    /// Creates a PENDING record holding `quantity` units of `entry`.
    pub fn pending(
        entry: &StockLedgerEntry,
        order_id: OrderId,
        quantity: u32,
    ) -> Result<Self, ReservationError> {
        Self::create(entry, order_id, quantity, ReservationStatus::Pending, None)
    }

    /// Creates a terminal FAILED record for an attempt that could not hold stock.
    pub fn failed(
        entry: &StockLedgerEntry,
        order_id: OrderId,
        quantity: u32,
        reason: impl Into<String>,
    ) -> Result<Self, ReservationError> {
        Self::create(
            entry,
            order_id,
            quantity,
            ReservationStatus::Failed,
            Some(reason.into()),
        )
    }

    fn create(
        entry: &StockLedgerEntry,
        order_id: OrderId,
        quantity: u32,
        status: ReservationStatus,
        failure_reason: Option<String>,
    ) -> Result<Self, ReservationError> {
        if quantity == 0 {
            return Err(ReservationError::ZeroQuantity);
        }
        let now = Utc::now();
        Ok(Self {
            id: ReservationId::new(),
            ledger_entry_id: entry.id(),
            product_id: entry.product_id().clone(),
            order_id,
            requested_quantity: quantity,
            status,
            failure_reason,
            created_at: now,
            confirmed_at: None,
            released_at: None,
            updated_at: now,
            event_published_at: None,
        })
    }

    /// Moves the record to `next`, stamping the matching timestamp.
    ///
    /// `reason` is only kept for FAILED. Transitions that produce an outbound
    /// event clear the publish marker so the event is owed again.
    pub fn transition(
        &mut self,
        next: ReservationStatus,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<(), ReservationError> {
        if !self.status.can_transition_to(next) {
            return Err(ReservationError::InvalidTransition {
                order_id: self.order_id.clone(),
                from: self.status,
                to: next,
            });
        }

        match next {
            ReservationStatus::Confirmed => {
                self.confirmed_at = Some(at);
            }
            ReservationStatus::Released => {
                self.released_at = Some(at);
                self.event_published_at = None;
            }
            ReservationStatus::Failed => {
                self.failure_reason = reason;
                self.event_published_at = None;
            }
            ReservationStatus::Pending => {}
        }

        self.status = next;
        self.updated_at = at;
        Ok(())
    }

    /// Returns true while an outbound event for the current status has not
    /// been confirmed as published. CONFIRMED records announce nothing.
    pub fn owes_event(&self) -> bool {
        self.event_published_at.is_none() && self.status != ReservationStatus::Confirmed
    }

    /// Records that the event for the current status went out.
    pub fn mark_published(&mut self, at: DateTime<Utc>) {
        self.event_published_at = Some(at);
    }
}
