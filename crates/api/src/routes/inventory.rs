//! Stock administration and reservation endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::{OrderId, ProductId};
use domain::{ReservationRecord, ReservationStatus, StockLedgerEntry};
use inventory_store::InventoryStore;
use reservation::{ReservationOutcome, ServiceError, TransitionOutcome};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::context::Caller;
use crate::error::ApiError;

// -- Request types --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInventoryRequest {
    pub product_id: String,
    pub total_quantity: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTotalRequest {
    pub total_quantity: i64,
}

#[derive(Debug, Deserialize)]
pub struct AddStockRequest {
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    pub product_id: String,
    pub order_id: String,
    pub quantity: i64,
}

// -- Response types --

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryResponse {
    pub id: String,
    pub product_id: String,
    pub total_quantity: u32,
    pub reserved_quantity: u32,
    pub available_quantity: u32,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<StockLedgerEntry> for InventoryResponse {
    fn from(entry: StockLedgerEntry) -> Self {
        Self {
            id: entry.id().to_string(),
            product_id: entry.product_id().to_string(),
            total_quantity: entry.total_quantity(),
            reserved_quantity: entry.reserved_quantity(),
            available_quantity: entry.available_quantity(),
            version: entry.version().as_i64(),
            created_at: entry.created_at(),
            updated_at: entry.updated_at(),
        }
    }
}

/// Result of a release or confirm call.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionResponse {
    pub reservation_id: String,
    pub order_id: String,
    pub product_id: String,
    pub quantity: u32,
    pub status: ReservationStatus,
    /// False when the call changed nothing.
    pub applied: bool,
}

impl From<TransitionOutcome> for TransitionResponse {
    fn from(outcome: TransitionOutcome) -> Self {
        let ReservationRecord {
            id,
            order_id,
            product_id,
            requested_quantity,
            status,
            ..
        } = outcome.record;

        Self {
            reservation_id: id.to_string(),
            order_id: order_id.to_string(),
            product_id: product_id.to_string(),
            quantity: requested_quantity,
            status,
            applied: outcome.applied,
        }
    }
}

// -- Handlers --

/// POST /inventory: start tracking a product.
#[tracing::instrument(skip_all)]
pub async fn create<S: InventoryStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Caller(ctx): Caller,
    payload: Result<Json<CreateInventoryRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<InventoryResponse>), ApiError> {
    let Json(req) = payload?;
    let product_id = product_id(req.product_id)?;
    let total = quantity("totalQuantity", req.total_quantity, true)?;

    let entry = state
        .service
        .create_inventory(&ctx, product_id, total)
        .await?;
    Ok((StatusCode::CREATED, Json(entry.into())))
}

/// GET /inventory/{productId}: current quantities of a product.
#[tracing::instrument(skip(state))]
pub async fn get<S: InventoryStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(product_id): Path<String>,
) -> Result<Json<InventoryResponse>, ApiError> {
    let entry = state
        .service
        .get_inventory(&ProductId::new(product_id))
        .await?;
    Ok(Json(entry.into()))
}

/// PUT /inventory/{productId}: overwrite the total after a stock count.
#[tracing::instrument(skip(state, ctx, payload))]
pub async fn set_total<S: InventoryStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Caller(ctx): Caller,
    Path(product_id): Path<String>,
    payload: Result<Json<SetTotalRequest>, JsonRejection>,
) -> Result<Json<InventoryResponse>, ApiError> {
    let Json(req) = payload?;
    let total = quantity("totalQuantity", req.total_quantity, true)?;

    let entry = state
        .service
        .set_total(&ctx, &ProductId::new(product_id), total)
        .await?;
    Ok(Json(entry.into()))
}

/// POST /inventory/{productId}/stock: add received stock.
#[tracing::instrument(skip(state, ctx, payload))]
pub async fn add_stock<S: InventoryStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Caller(ctx): Caller,
    Path(product_id): Path<String>,
    payload: Result<Json<AddStockRequest>, JsonRejection>,
) -> Result<Json<InventoryResponse>, ApiError> {
    let Json(req) = payload?;
    let amount = quantity("quantity", req.quantity, false)?;

    let entry = state
        .service
        .add_stock(&ctx, &ProductId::new(product_id), amount)
        .await?;
    Ok(Json(entry.into()))
}

/// POST /inventory/reserve: hold stock for an order.
///
/// Answers 200 whenever the attempt reached the ledger. Insufficient stock
/// comes back as `success: false` with code `INSUFFICIENT_STOCK`.
#[tracing::instrument(skip_all)]
pub async fn reserve<S: InventoryStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Caller(ctx): Caller,
    payload: Result<Json<ReserveRequest>, JsonRejection>,
) -> Result<Json<ReservationOutcome>, ApiError> {
    let Json(req) = payload?;
    let product_id = product_id(req.product_id)?;
    let order_id = order_id(req.order_id)?;
    let amount = quantity("quantity", req.quantity, false)?;

    let outcome = state
        .service
        .reserve_stock(&ctx, order_id, product_id, amount)
        .await?;
    Ok(Json(outcome))
}

/// POST /inventory/release/{orderId}: give an order's held stock back.
#[tracing::instrument(skip(state, ctx))]
pub async fn release<S: InventoryStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Caller(ctx): Caller,
    Path(order_id): Path<String>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let outcome = state
        .service
        .release_reservation(&ctx, &OrderId::new(order_id))
        .await?;
    Ok(Json(outcome.into()))
}

/// POST /inventory/confirm/{orderId}: consume an order's held stock.
#[tracing::instrument(skip(state, ctx))]
pub async fn confirm<S: InventoryStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Caller(ctx): Caller,
    Path(order_id): Path<String>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let outcome = state
        .service
        .confirm_reservation(&ctx, &OrderId::new(order_id))
        .await?;
    Ok(Json(outcome.into()))
}

fn product_id(raw: String) -> Result<ProductId, ApiError> {
    if raw.trim().is_empty() {
        return Err(ApiError::BadRequest("productId cannot be blank".to_string()));
    }
    Ok(ProductId::new(raw))
}

fn order_id(raw: String) -> Result<OrderId, ApiError> {
    if raw.trim().is_empty() {
        return Err(ApiError::BadRequest("orderId cannot be blank".to_string()));
    }
    Ok(OrderId::new(raw))
}

fn quantity(field: &str, value: i64, allow_zero: bool) -> Result<u32, ApiError> {
    let valid = if allow_zero { value >= 0 } else { value > 0 };
    if !valid {
        let rule = if allow_zero { "non-negative" } else { "positive" };
        return Err(ServiceError::InvalidQuantity(format!("{field} must be {rule}")).into());
    }
    u32::try_from(value)
        .map_err(|_| ServiceError::InvalidQuantity(format!("{field} is too large")).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_rules() {
        assert_eq!(quantity("quantity", 3, false).unwrap(), 3);
        assert!(quantity("quantity", 0, false).is_err());
        assert_eq!(quantity("totalQuantity", 0, true).unwrap(), 0);
        assert!(quantity("totalQuantity", -1, true).is_err());
        assert!(quantity("quantity", i64::from(u32::MAX) + 1, false).is_err());
    }

    #[test]
    fn blank_identifiers_are_rejected() {
        assert!(product_id("  ".to_string()).is_err());
        assert!(order_id(String::new()).is_err());
        assert_eq!(order_id("o-1".to_string()).unwrap().as_str(), "o-1");
    }
}
