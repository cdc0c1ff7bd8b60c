//! Reservation orchestration for the inventory service.
//!
//! This crate arbitrates concurrent demand for stock:
//! 1. [`ReservationService`] reserves, releases and confirms stock under the
//!    per-entry lock of an [`InventoryStore`](inventory_store::InventoryStore)
//! 2. Each committed outcome is announced through an [`EventPublisher`]
//! 3. [`OrderEventListener`] turns inbound order signals into service calls
//! 4. [`Reconciler`] republishes events whose publish was never confirmed

pub mod config;
pub mod error;
pub mod events;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod listener;
pub mod publisher;
pub mod reconciler;
pub mod service;

pub use config::{ReconcilerConfig, ReservationConfig};
pub use error::{ErrorKind, Result, ServiceError};
pub use events::ReservationEvent;
#[cfg(feature = "kafka")]
pub use kafka::{KafkaEventPublisher, run_kafka_listener};
pub use listener::{
    DeadLetter, DeadLetterSink, Disposition, InMemoryDeadLetterSink, ListenerError,
    LoggingDeadLetterSink, OrderEventListener, OrderSignal,
};
pub use publisher::{EventPublisher, InMemoryEventPublisher, LoggingEventPublisher, PublishError};
pub use reconciler::Reconciler;
pub use service::{
    COMPENSATION_REASON, INSUFFICIENT_STOCK, ReservationOutcome, ReservationService,
    TransitionOutcome,
};
