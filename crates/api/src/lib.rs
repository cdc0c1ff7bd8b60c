//! HTTP API server for the inventory reservation service.
//!
//! Provides REST endpoints for stock administration and for reserving,
//! releasing and confirming stock on behalf of orders, with structured
//! logging (tracing) and Prometheus metrics.

pub mod config;
pub mod context;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use inventory_store::InventoryStore;
use metrics_exporter_prometheus::PrometheusHandle;
use reservation::{EventPublisher, ReservationConfig, ReservationService};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use routes::AppState;

/// Prefix shared by the inventory and reservation routes.
pub const API_PREFIX: &str = "/api/v1";

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: InventoryStore + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(metrics_handle);

    let api = Router::new()
        .route("/inventory", post(routes::inventory::create::<S>))
        .route(
            "/inventory/{product_id}",
            get(routes::inventory::get::<S>).put(routes::inventory::set_total::<S>),
        )
        .route(
            "/inventory/{product_id}/stock",
            post(routes::inventory::add_stock::<S>),
        )
        .route("/inventory/reserve", post(routes::inventory::reserve::<S>))
        .route(
            "/inventory/release/{order_id}",
            post(routes::inventory::release::<S>),
        )
        .route(
            "/inventory/confirm/{order_id}",
            post(routes::inventory::confirm::<S>),
        )
        .route(
            "/reservations/{order_id}",
            get(routes::reservations::get::<S>),
        )
        .with_state(state);

    Router::new()
        .route("/health", get(routes::health::check))
        .nest(API_PREFIX, api)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Wires a reservation service over the given store and publisher.
pub fn create_default_state<S: InventoryStore + 'static>(
    store: S,
    publisher: Arc<dyn EventPublisher>,
    config: ReservationConfig,
) -> Arc<AppState<S>> {
    let service = ReservationService::new(store, publisher).with_config(config);
    Arc::new(AppState::new(Arc::new(service)))
}
