//! Reservation journal lookup.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use chrono::{DateTime, Utc};
use common::OrderId;
use domain::{ReservationRecord, ReservationStatus};
use inventory_store::InventoryStore;
use serde::Serialize;

use super::AppState;
use crate::error::ApiError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationResponse {
    pub reservation_id: String,
    pub order_id: String,
    pub product_id: String,
    pub quantity: u32,
    pub status: ReservationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub event_published: bool,
}

impl From<ReservationRecord> for ReservationResponse {
    fn from(record: ReservationRecord) -> Self {
        Self {
            reservation_id: record.id.to_string(),
            order_id: record.order_id.to_string(),
            product_id: record.product_id.to_string(),
            quantity: record.requested_quantity,
            status: record.status,
            failure_reason: record.failure_reason,
            created_at: record.created_at,
            updated_at: record.updated_at,
            confirmed_at: record.confirmed_at,
            released_at: record.released_at,
            event_published: record.event_published_at.is_some(),
        }
    }
}

/// GET /reservations/{orderId}: latest journal record for an order.
#[tracing::instrument(skip(state))]
pub async fn get<S: InventoryStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(order_id): Path<String>,
) -> Result<Json<ReservationResponse>, ApiError> {
    let record = state
        .service
        .get_reservation(&OrderId::new(order_id))
        .await?;
    Ok(Json(record.into()))
}
