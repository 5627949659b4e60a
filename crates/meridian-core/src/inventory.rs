//! # Inventory Policy
//!
//! Stock arithmetic for one inventory record. The storage layer serializes
//! access to a record; this module decides what a reservation does to it.
//!
//! ## Reservation Rules
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  reserve(qty)                                                        │
//! │                                                                      │
//! │  manage_stock = false ──────────────────────────► untracked, OK      │
//! │                                                                      │
//! │  stock - qty >= 0 ──────────────────────────────► OK                 │
//! │                                                                      │
//! │  stock - qty <  0 ─┬─ backorders = yes ─────────► OK, backordered    │
//! │                    ├─ backorders = notify ──────► OK, backordered,   │
//! │                    │                               notify = true     │
//! │                    └─ backorders = no ──────────► InsufficientStock  │
//! │                                                                      │
//! │  crossing low_stock_amount (above → at/below) ──► advisory signal    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `stock_status` is recomputed on every change, so it is never stale.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum BackorderPolicy {
    #[default]
    No,
    Notify,
    Yes,
}

impl BackorderPolicy {
    pub fn allows_backorders(&self) -> bool {
        !matches!(self, BackorderPolicy::No)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    #[default]
    InStock,
    OutOfStock,
    OnBackorder,
}

/// Stock state of one product or variation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    /// Product or variation id owning this stock.
    pub item_id: String,
    pub product_id: String,
    #[serde(default)]
    pub variation_id: Option<String>,
    #[serde(default)]
    pub manage_stock: bool,
    #[serde(default)]
    pub stock_quantity: i64,
    #[serde(default)]
    pub backorders: BackorderPolicy,
    #[serde(default)]
    pub low_stock_amount: Option<i64>,
    /// Stored for untracked items, derived for tracked ones.
    #[serde(default)]
    pub stock_status: StockStatus,
}

/// What a reservation or restock did to a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub item_id: String,
    pub previous: i64,
    pub new: i64,
    pub status: StockStatus,
    /// Units sold beyond stock on hand.
    pub backordered: i64,
    /// Backorder under a `notify` policy.
    pub notify: bool,
    /// Quantity moved from above the low-stock threshold to at or below it.
    pub low_stock_crossed: bool,
}

impl StockMovement {
    pub fn changed(&self) -> bool {
        self.previous != self.new
    }
}

impl InventoryRecord {
    /// Untracked record, always in stock.
    pub fn untracked(item_id: impl Into<String>, product_id: impl Into<String>) -> Self {
        InventoryRecord {
            item_id: item_id.into(),
            product_id: product_id.into(),
            variation_id: None,
            manage_stock: false,
            stock_quantity: 0,
            backorders: BackorderPolicy::No,
            low_stock_amount: None,
            stock_status: StockStatus::InStock,
        }
    }

    /// Tracked record with `quantity` on hand.
    pub fn tracked(
        item_id: impl Into<String>,
        product_id: impl Into<String>,
        quantity: i64,
        backorders: BackorderPolicy,
    ) -> Self {
        let mut record = InventoryRecord {
            manage_stock: true,
            stock_quantity: quantity,
            backorders,
            ..Self::untracked(item_id, product_id)
        };
        record.stock_status = record.derive_status();
        record
    }

    /// Status implied by quantity and backorder policy.
    pub fn derive_status(&self) -> StockStatus {
        if !self.manage_stock {
            return self.stock_status;
        }
        if self.stock_quantity > 0 {
            StockStatus::InStock
        } else if self.backorders.allows_backorders() {
            StockStatus::OnBackorder
        } else {
            StockStatus::OutOfStock
        }
    }

    /// Whether `quantity` could be reserved right now.
    pub fn can_fulfil(&self, quantity: i64) -> bool {
        if !self.manage_stock {
            return self.stock_status != StockStatus::OutOfStock;
        }
        self.backorders.allows_backorders() || self.stock_quantity >= quantity
    }

    /// Takes `quantity` units under the backorder policy.
    ///
    /// Leaves the record untouched on failure.
    pub fn reserve(&mut self, quantity: i64) -> CoreResult<StockMovement> {
        let previous = self.stock_quantity;
        if !self.manage_stock {
            return Ok(self.movement(previous, 0, false));
        }

        let new = previous - quantity;
        let mut backordered = 0;
        let mut notify = false;
        if new < 0 {
            match self.backorders {
                BackorderPolicy::No => {
                    return Err(CoreError::InsufficientStock {
                        item_id: self.item_id.clone(),
                        available: previous.max(0),
                        requested: quantity,
                    });
                }
                BackorderPolicy::Notify => {
                    backordered = quantity.min(-new);
                    notify = true;
                }
                BackorderPolicy::Yes => backordered = quantity.min(-new),
            }
        }

        self.stock_quantity = new;
        self.stock_status = self.derive_status();
        Ok(self.movement(previous, backordered, notify))
    }

    /// Puts `quantity` units back.
    pub fn restock(&mut self, quantity: i64) -> StockMovement {
        let previous = self.stock_quantity;
        if self.manage_stock {
            self.stock_quantity += quantity;
            self.stock_status = self.derive_status();
        }
        self.movement(previous, 0, false)
    }

    fn movement(&self, previous: i64, backordered: i64, notify: bool) -> StockMovement {
        let low_stock_crossed = self.manage_stock
            && self
                .low_stock_amount
                .is_some_and(|threshold| previous > threshold && self.stock_quantity <= threshold);
        StockMovement {
            item_id: self.item_id.clone(),
            previous,
            new: self.stock_quantity,
            status: self.stock_status,
            backordered,
            notify,
            low_stock_crossed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untracked_always_succeeds() {
        let mut record = InventoryRecord::untracked("mug", "mug");
        let movement = record.reserve(1_000).unwrap();
        assert!(!movement.changed());
        assert_eq!(record.stock_status, StockStatus::InStock);
    }

    #[test]
    fn test_no_backorders_rejects_and_leaves_record() {
        let mut record = InventoryRecord::tracked("mug", "mug", 1, BackorderPolicy::No);
        let err = record.reserve(2).unwrap_err();
        assert!(matches!(err, CoreError::InsufficientStock { available: 1, requested: 2, .. }));
        assert_eq!(record.stock_quantity, 1);

        let movement = record.reserve(1).unwrap();
        assert_eq!(movement.new, 0);
        assert_eq!(record.stock_status, StockStatus::OutOfStock);
        assert!(!record.can_fulfil(1));
    }

    #[test]
    fn test_backorder_policies() {
        let mut notify = InventoryRecord::tracked("a", "a", 1, BackorderPolicy::Notify);
        let movement = notify.reserve(3).unwrap();
        assert_eq!(movement.new, -2);
        assert_eq!(movement.backordered, 2);
        assert!(movement.notify);
        assert_eq!(notify.stock_status, StockStatus::OnBackorder);

        let mut yes = InventoryRecord::tracked("b", "b", -1, BackorderPolicy::Yes);
        let movement = yes.reserve(2).unwrap();
        assert_eq!(movement.backordered, 2);
        assert!(!movement.notify);
    }

    #[test]
    fn test_low_stock_crossing_fires_once() {
        let mut record = InventoryRecord::tracked("a", "a", 5, BackorderPolicy::No);
        record.low_stock_amount = Some(2);

        assert!(!record.reserve(2).unwrap().low_stock_crossed);
        assert!(record.reserve(1).unwrap().low_stock_crossed);
        assert!(!record.reserve(1).unwrap().low_stock_crossed);
    }

    #[test]
    fn test_restock_updates_status() {
        let mut record = InventoryRecord::tracked("a", "a", 0, BackorderPolicy::No);
        assert_eq!(record.stock_status, StockStatus::OutOfStock);
        let movement = record.restock(2);
        assert_eq!(movement.new, 2);
        assert_eq!(record.stock_status, StockStatus::InStock);
    }
}
