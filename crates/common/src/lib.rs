//! Shared identifiers and request context for the inventory service.

pub mod context;
pub mod types;

pub use context::RequestContext;
pub use types::{LedgerEntryId, OrderId, ProductId, ReservationId, Version};
