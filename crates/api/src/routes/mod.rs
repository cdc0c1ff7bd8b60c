//! HTTP handlers, one module per resource.

pub mod health;
pub mod inventory;
pub mod metrics;
pub mod reservations;

use std::sync::Arc;

use inventory_store::InventoryStore;
use reservation::ReservationService;

/// Shared application state accessible from all handlers.
pub struct AppState<S: InventoryStore> {
    pub service: Arc<ReservationService<S>>,
}

impl<S: InventoryStore> AppState<S> {
    pub fn new(service: Arc<ReservationService<S>>) -> Self {
        Self { service }
    }
}
