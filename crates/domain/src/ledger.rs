//! Per-product stock ledger entry.

use chrono::{DateTime, Utc};
use common::{LedgerEntryId, ProductId, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by stock ledger operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Quantity must be strictly positive.
    #[error("Invalid quantity {quantity}: {reason}")]
    InvalidQuantity { quantity: u32, reason: &'static str },

    /// Not enough unreserved stock to satisfy the request.
    #[error(
        "Insufficient stock for product {product_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: u32,
    },

    /// Attempted to release more than is reserved.
    #[error("Cannot release {requested} units of {product_id}: only {reserved} reserved")]
    OverRelease {
        product_id: ProductId,
        requested: u32,
        reserved: u32,
    },

    /// Attempted to confirm more than is reserved.
    #[error("Cannot confirm {requested} units of {product_id}: only {reserved} reserved")]
    OverConfirm {
        product_id: ProductId,
        requested: u32,
        reserved: u32,
    },

    /// A new total would drop below what is currently held.
    #[error("Total {requested} for product {product_id} is below reserved quantity {reserved}")]
    TotalBelowReserved {
        product_id: ProductId,
        requested: u32,
        reserved: u32,
    },

    /// Persisted quantities violate `reserved <= total`.
    #[error("Inconsistent ledger entry for {product_id}: total {total}, reserved {reserved}")]
    Inconsistent {
        product_id: ProductId,
        total: u32,
        reserved: u32,
    },
}

impl LedgerError {
    /// Returns true for errors that can only come from broken bookkeeping
    /// (a hold released or confirmed twice, or never recorded).
    ///
    /// These are not client mistakes and must not be retried.
    pub fn is_bookkeeping(&self) -> bool {
        matches!(
            self,
            LedgerError::OverRelease { .. }
                | LedgerError::OverConfirm { .. }
                | LedgerError::Inconsistent { .. }
        )
    }
}

/// Stock record for a single product.
///
/// Invariant: `reserved_quantity <= total_quantity`, so
/// [`available_quantity`](Self::available_quantity) never underflows. Every
/// successful mutation advances [`version`](Self::version) by one; failed
/// operations leave the entry untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLedgerEntry {
    id: LedgerEntryId,
    product_id: ProductId,
    total_quantity: u32,
    reserved_quantity: u32,
    version: Version,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl StockLedgerEntry {
    /// Creates a new entry with nothing reserved.
    pub fn new(product_id: ProductId, initial_total: u32) -> Self {
        let now = Utc::now();
        Self {
            id: LedgerEntryId::new(),
            product_id,
            total_quantity: initial_total,
            reserved_quantity: 0,
            version: Version::initial(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuilds an entry from persisted columns, checking the quantity invariant.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: LedgerEntryId,
        product_id: ProductId,
        total_quantity: u32,
        reserved_quantity: u32,
        version: Version,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Result<Self, LedgerError> {
        if reserved_quantity > total_quantity {
            return Err(LedgerError::Inconsistent {
                product_id,
                total: total_quantity,
                reserved: reserved_quantity,
            });
        }
        Ok(Self {
            id,
            product_id,
            total_quantity,
            reserved_quantity,
            version,
            created_at,
            updated_at,
        })
    }

    pub fn id(&self) -> LedgerEntryId {
        self.id
    }

    pub fn product_id(&self) -> &ProductId {
        &self.product_id
    }

    pub fn total_quantity(&self) -> u32 {
        self.total_quantity
    }

    pub fn reserved_quantity(&self) -> u32 {
        self.reserved_quantity
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Units not held by any reservation.
    pub fn available_quantity(&self) -> u32 {
        self.total_quantity - self.reserved_quantity
    }

    /// Returns true if `quantity` units could be reserved right now.
    pub fn has_available(&self, quantity: u32) -> bool {
        self.available_quantity() >= quantity
    }

    /// Places a hold of `quantity` units.
    pub fn reserve(&mut self, quantity: u32) -> Result<(), LedgerError> {
        ensure_positive(quantity)?;
        let available = self.available_quantity();
        if available < quantity {
            return Err(LedgerError::InsufficientStock {
                product_id: self.product_id.clone(),
                requested: quantity,
                available,
            });
        }
        self.reserved_quantity += quantity;
        self.touch();
        Ok(())
    }

    /// Drops a hold of `quantity` units without consuming stock.
    pub fn release(&mut self, quantity: u32) -> Result<(), LedgerError> {
        ensure_positive(quantity)?;
        if self.reserved_quantity < quantity {
            return Err(LedgerError::OverRelease {
                product_id: self.product_id.clone(),
                requested: quantity,
                reserved: self.reserved_quantity,
            });
        }
        self.reserved_quantity -= quantity;
        self.touch();
        Ok(())
    }

    /// Turns a hold of `quantity` units into permanent consumption.
    pub fn confirm(&mut self, quantity: u32) -> Result<(), LedgerError> {
        ensure_positive(quantity)?;
        if self.reserved_quantity < quantity {
            return Err(LedgerError::OverConfirm {
                product_id: self.product_id.clone(),
                requested: quantity,
                reserved: self.reserved_quantity,
            });
        }
        self.total_quantity -= quantity;
        self.reserved_quantity -= quantity;
        self.touch();
        Ok(())
    }

    /// Receives `quantity` new units into stock.
    pub fn add_stock(&mut self, quantity: u32) -> Result<(), LedgerError> {
        ensure_positive(quantity)?;
        self.total_quantity = self
            .total_quantity
            .checked_add(quantity)
            .ok_or(LedgerError::InvalidQuantity {
                quantity,
                reason: "total quantity would overflow",
            })?;
        self.touch();
        Ok(())
    }

    /// Overwrites the total (stock count correction). Cannot go below what is held.
    pub fn set_total(&mut self, total_quantity: u32) -> Result<(), LedgerError> {
        if total_quantity < self.reserved_quantity {
            return Err(LedgerError::TotalBelowReserved {
                product_id: self.product_id.clone(),
                requested: total_quantity,
                reserved: self.reserved_quantity,
            });
        }
        self.total_quantity = total_quantity;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.version = self.version.next();
        self.updated_at = Utc::now();
    }
}

fn ensure_positive(quantity: u32) -> Result<(), LedgerError> {
    if quantity == 0 {
        return Err(LedgerError::InvalidQuantity {
            quantity,
            reason: "must be positive",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(total: u32) -> StockLedgerEntry {
        StockLedgerEntry::new(ProductId::new("P1"), total)
    }

    #[test]
    fn new_entry_has_nothing_reserved() {
        let e = entry(10);
        assert_eq!(e.total_quantity(), 10);
        assert_eq!(e.reserved_quantity(), 0);
        assert_eq!(e.available_quantity(), 10);
        assert_eq!(e.version(), Version::initial());
    }

    #[test]
    fn reserve_moves_units_out_of_available() {
        let mut e = entry(10);
        e.reserve(4).unwrap();
        assert_eq!(e.reserved_quantity(), 4);
        assert_eq!(e.available_quantity(), 6);
        assert_eq!(e.version(), Version::new(1));
    }

    #[test]
    fn reserve_rejects_more_than_available_without_mutating() {
        let mut e = entry(5);
        e.reserve(3).unwrap();
        let before = e.clone();

        let err = e.reserve(3).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientStock {
                product_id: ProductId::new("P1"),
                requested: 3,
                available: 2,
            }
        );
        assert_eq!(e, before);
    }

    #[test]
    fn reserve_rejects_zero() {
        let mut e = entry(5);
        assert!(matches!(
            e.reserve(0),
            Err(LedgerError::InvalidQuantity { .. })
        ));
        assert_eq!(e.version(), Version::initial());
    }

    #[test]
    fn reserve_exactly_available_leaves_zero() {
        let mut e = entry(6);
        e.reserve(6).unwrap();
        assert_eq!(e.available_quantity(), 0);
        assert!(!e.has_available(1));
    }

    #[test]
    fn release_returns_units_to_available() {
        let mut e = entry(10);
        e.reserve(4).unwrap();
        e.release(4).unwrap();
        assert_eq!(e.reserved_quantity(), 0);
        assert_eq!(e.available_quantity(), 10);
        assert_eq!(e.version(), Version::new(2));
    }

    #[test]
    fn over_release_is_bookkeeping_error() {
        let mut e = entry(10);
        e.reserve(2).unwrap();
        let err = e.release(3).unwrap_err();
        assert!(matches!(err, LedgerError::OverRelease { reserved: 2, .. }));
        assert!(err.is_bookkeeping());
        assert_eq!(e.reserved_quantity(), 2);
    }

    #[test]
    fn confirm_consumes_total_and_reserved() {
        let mut e = entry(10);
        e.reserve(6).unwrap();
        e.confirm(6).unwrap();
        assert_eq!(e.total_quantity(), 4);
        assert_eq!(e.reserved_quantity(), 0);
        assert_eq!(e.available_quantity(), 4);
    }

    #[test]
    fn over_confirm_is_bookkeeping_error() {
        let mut e = entry(10);
        let err = e.confirm(1).unwrap_err();
        assert!(matches!(err, LedgerError::OverConfirm { .. }));
        assert!(err.is_bookkeeping());
        assert_eq!(e.total_quantity(), 10);
    }

    #[test]
    fn add_stock_increases_total() {
        let mut e = entry(0);
        e.add_stock(7).unwrap();
        assert_eq!(e.total_quantity(), 7);
        assert!(e.add_stock(0).is_err());
    }

    #[test]
    fn add_stock_detects_overflow() {
        let mut e = entry(u32::MAX);
        assert!(matches!(
            e.add_stock(1),
            Err(LedgerError::InvalidQuantity { .. })
        ));
        assert_eq!(e.total_quantity(), u32::MAX);
    }

    #[test]
    fn set_total_cannot_drop_below_reserved() {
        let mut e = entry(10);
        e.reserve(4).unwrap();
        assert!(matches!(
            e.set_total(3),
            Err(LedgerError::TotalBelowReserved { .. })
        ));
        e.set_total(4).unwrap();
        assert_eq!(e.available_quantity(), 0);
    }

    #[test]
    fn restore_rejects_reserved_above_total() {
        let now = Utc::now();
        let result = StockLedgerEntry::restore(
            LedgerEntryId::new(),
            ProductId::new("P1"),
            3,
            4,
            Version::new(2),
            now,
            now,
        );
        assert!(matches!(result, Err(LedgerError::Inconsistent { .. })));
    }
}
