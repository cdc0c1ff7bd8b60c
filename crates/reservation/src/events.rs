//! Outbound reservation events.

use common::{OrderId, ProductId, ReservationId};
use domain::{ReservationRecord, ReservationStatus};
use serde::{Deserialize, Serialize};

use crate::service::COMPENSATION_REASON;

pub const TOPIC_RESERVATION_SUCCEEDED: &str = "reservation.succeeded";
pub const TOPIC_RESERVATION_FAILED: &str = "reservation.failed";
pub const TOPIC_RESERVATION_COMPENSATED: &str = "reservation.compensated";

/// One message per reservation outcome, keyed by order id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReservationEvent {
    Succeeded(ReservationSucceeded),
    Failed(ReservationFailed),
    Compensated(ReservationCompensated),
}

/// Payload of `reservation.succeeded`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationSucceeded {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub reservation_id: ReservationId,
}

/// Payload of `reservation.failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationFailed {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub requested_quantity: u32,
    pub reason: String,
}

/// Payload of `reservation.compensated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationCompensated {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub reservation_id: ReservationId,
    pub reason: String,
}

impl ReservationEvent {
    /// Builds the event owed for a record's current status.
    ///
    /// Returns `None` for CONFIRMED, which announces nothing.
    pub fn from_record(record: &ReservationRecord) -> Option<Self> {
        let event = match record.status {
            ReservationStatus::Pending => ReservationEvent::Succeeded(ReservationSucceeded {
                order_id: record.order_id.clone(),
                product_id: record.product_id.clone(),
                quantity: record.requested_quantity,
                reservation_id: record.id,
            }),
            ReservationStatus::Failed => ReservationEvent::Failed(ReservationFailed {
                order_id: record.order_id.clone(),
                product_id: record.product_id.clone(),
                requested_quantity: record.requested_quantity,
                reason: record
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "Reservation failed".to_string()),
            }),
            ReservationStatus::Released => {
                ReservationEvent::Compensated(ReservationCompensated {
                    order_id: record.order_id.clone(),
                    product_id: record.product_id.clone(),
                    quantity: record.requested_quantity,
                    reservation_id: record.id,
                    reason: COMPENSATION_REASON.to_string(),
                })
            }
            ReservationStatus::Confirmed => return None,
        };
        Some(event)
    }

    pub fn topic(&self) -> &'static str {
        match self {
            ReservationEvent::Succeeded(_) => TOPIC_RESERVATION_SUCCEEDED,
            ReservationEvent::Failed(_) => TOPIC_RESERVATION_FAILED,
            ReservationEvent::Compensated(_) => TOPIC_RESERVATION_COMPENSATED,
        }
    }

    /// Partition key. Events for one order stay in order on the transport.
    pub fn key(&self) -> &OrderId {
        match self {
            ReservationEvent::Succeeded(e) => &e.order_id,
            ReservationEvent::Failed(e) => &e.order_id,
            ReservationEvent::Compensated(e) => &e.order_id,
        }
    }

    /// Serializes the payload as published on the wire.
    pub fn payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
