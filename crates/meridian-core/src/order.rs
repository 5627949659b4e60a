//! # Orders
//!
//! The durable record a settled quote becomes, and the state machine its
//! status follows.
//!
//! ## State Machine
//! ```text
//!                      ┌──────────────┐
//!                      │checkout_draft│
//!                      └──────┬───────┘
//!                             ▼
//!                      ┌──────────────┐
//!          ┌───────────│   pending    │───────────┐
//!          │           └──────┬───────┘           │
//!          │                  ▼                   │
//!          │           ┌──────────────┐           │
//!          │     ┌─────│  processing  │◄────┐     │
//!          │     │     └──────┬───────┘     │     │
//!          │     │            │             │     │
//!          │     │            ▼             │     │
//!          │     │     ┌──────────────┐     │     │
//!          │     │     │   on_hold    │─────┘     │
//!          │     │     └──────┬───────┘           │
//!          │     ▼            ▼                   ▼
//!          │  ┌──────────────────┐       ┌──────────────┐
//!          │  │    completed     │       │    failed    │
//!          │  └────────┬─────────┘       └──────────────┘
//!          ▼           ▼
//!  ┌──────────────┐ ┌──────────────┐
//!  │  cancelled   │ │   refunded   │
//!  └──────────────┘ └──────────────┘
//!
//!  Any non-terminal state may be cancelled or fail.
//! ```
//!
//! ## Totals
//! Items are the source of truth. The cached [`OrderTotals`] on an order
//! are always re-derivable with [`OrderTotals::derive`]:
//!
//! ```text
//! total = Σ line.subtotal − discount_total + shipping_total + fee_total + total_tax
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::cart::Quote;
use crate::error::{CoreError, CoreResult, ValidationError};
use crate::money::Money;
use crate::rate::Rate;
use crate::tax::{self, TaxLine};
use crate::types::Jurisdiction;

// =============================================================================
// Order Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    CheckoutDraft,
    Pending,
    Processing,
    OnHold,
    Completed,
    Cancelled,
    Refunded,
    Failed,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 8] = [
        OrderStatus::CheckoutDraft,
        OrderStatus::Pending,
        OrderStatus::Processing,
        OrderStatus::OnHold,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
        OrderStatus::Refunded,
        OrderStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::CheckoutDraft => "checkout_draft",
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::OnHold => "on_hold",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
            OrderStatus::Failed => "failed",
        }
    }

    /// Completed orders are terminal but may still become refunded.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Refunded | OrderStatus::Failed
        )
    }

    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, to) {
            (CheckoutDraft, Pending) => true,
            (Pending, Processing | OnHold) => true,
            (Processing, OnHold | Completed) => true,
            (OnHold, Processing | Completed) => true,
            (Completed, Refunded) => true,
            (from, Cancelled | Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ValidationError::InvalidFormat {
                field: "status".to_string(),
                reason: format!("unknown order status '{}'", s),
            })
    }
}

// =============================================================================
// Order Items
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum OrderItemKind {
    LineItem,
    Shipping,
    Tax,
    Coupon,
    Fee,
}

/// Kind-specific fields of an order item.
///
/// Line, shipping and fee amounts are net; their tax sits beside them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderItemDetail {
    LineItem {
        product_id: String,
        variation_id: Option<String>,
        /// Inventory record the units were drawn from, `None` if untracked.
        stock_item_id: Option<String>,
        sku: Option<String>,
        quantity: i64,
        unit_price: Money,
        tax_class: String,
        /// Before discounts.
        subtotal: Money,
        subtotal_tax: Money,
        /// After discounts.
        total: Money,
        total_tax: Money,
        taxes: Vec<TaxLine>,
    },
    Shipping {
        method_id: String,
        total: Money,
        total_tax: Money,
        taxes: Vec<TaxLine>,
    },
    Tax {
        rate_id: String,
        label: String,
        rate: Rate,
        compound: bool,
        tax_amount: Money,
        shipping_tax_amount: Money,
    },
    Coupon {
        coupon_id: String,
        code: String,
        discount: Money,
        discount_tax: Money,
    },
    Fee {
        tax_class: Option<String>,
        total: Money,
        total_tax: Money,
        taxes: Vec<TaxLine>,
    },
}

/// One immutable row of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: String,
    pub order_id: String,
    pub position: i64,
    pub name: String,
    #[serde(flatten)]
    pub detail: OrderItemDetail,
}

impl OrderItem {
    pub fn kind(&self) -> OrderItemKind {
        match self.detail {
            OrderItemDetail::LineItem { .. } => OrderItemKind::LineItem,
            OrderItemDetail::Shipping { .. } => OrderItemKind::Shipping,
            OrderItemDetail::Tax { .. } => OrderItemKind::Tax,
            OrderItemDetail::Coupon { .. } => OrderItemKind::Coupon,
            OrderItemDetail::Fee { .. } => OrderItemKind::Fee,
        }
    }

    /// Units on a line item.
    pub fn quantity(&self) -> Option<i64> {
        match self.detail {
            OrderItemDetail::LineItem { quantity, .. } => Some(quantity),
            _ => None,
        }
    }

    /// Gross amount a refund may return for this item. `None` for tax and
    /// coupon rows.
    pub fn refundable_total(&self) -> Option<Money> {
        match &self.detail {
            OrderItemDetail::LineItem { total, total_tax, .. }
            | OrderItemDetail::Shipping { total, total_tax, .. }
            | OrderItemDetail::Fee { total, total_tax, .. } => Some(*total + *total_tax),
            OrderItemDetail::Tax { .. } | OrderItemDetail::Coupon { .. } => None,
        }
    }
}

/// Freezes a quote into order items.
///
/// Order: line items, fees, shipping, coupons, then one tax row per rate.
pub fn build_order_items(quote: &Quote, order_id: &str) -> Vec<OrderItem> {
    let mut details: Vec<(String, OrderItemDetail)> = Vec::new();

    for line in &quote.lines {
        details.push((
            line.name.clone(),
            OrderItemDetail::LineItem {
                product_id: line.product_id.clone(),
                variation_id: line.variation_id.clone(),
                stock_item_id: line.inventory.manage_stock.then(|| line.inventory.item_id.clone()),
                sku: line.sku.clone(),
                quantity: line.quantity,
                unit_price: line.unit_price,
                tax_class: line.tax_class.clone(),
                subtotal: line.subtotal,
                subtotal_tax: line.subtotal_tax,
                total: line.total,
                total_tax: line.total_tax,
                taxes: line.taxes.clone(),
            },
        ));
    }

    for fee in &quote.fees {
        details.push((
            fee.name.clone(),
            OrderItemDetail::Fee {
                tax_class: fee.tax_class.clone(),
                total: fee.total,
                total_tax: fee.total_tax,
                taxes: fee.taxes.clone(),
            },
        ));
    }

    if let Some(shipping) = &quote.shipping {
        details.push((
            shipping.label.clone(),
            OrderItemDetail::Shipping {
                method_id: shipping.method_id.clone(),
                total: shipping.total,
                total_tax: shipping.total_tax,
                taxes: shipping.taxes.clone(),
            },
        ));
    }

    for coupon in &quote.coupons {
        details.push((
            coupon.code.clone(),
            OrderItemDetail::Coupon {
                coupon_id: coupon.coupon_id.clone(),
                code: coupon.code.clone(),
                discount: coupon.discount,
                discount_tax: coupon.discount_tax,
            },
        ));
    }

    for tax in &quote.taxes {
        details.push((
            tax.label.clone(),
            OrderItemDetail::Tax {
                rate_id: tax.rate_id.clone(),
                label: tax.label.clone(),
                rate: tax.rate,
                compound: tax.compound,
                tax_amount: tax.tax_amount,
                shipping_tax_amount: tax.shipping_tax_amount,
            },
        ));
    }

    details
        .into_iter()
        .enumerate()
        .map(|(position, (name, detail))| OrderItem {
            id: Uuid::new_v4().to_string(),
            order_id: order_id.to_string(),
            position: position as i64,
            name,
            detail,
        })
        .collect()
}

// =============================================================================
// Totals
// =============================================================================

/// Cached totals, derivable from items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderTotals {
    /// Σ line subtotals (net, before discounts).
    pub subtotal: Money,
    pub discount_total: Money,
    pub discount_tax: Money,
    pub shipping_total: Money,
    pub shipping_tax: Money,
    pub fee_total: Money,
    /// Tax on lines and fees.
    pub cart_tax: Money,
    pub total_tax: Money,
    pub total: Money,
}

impl OrderTotals {
    /// Recomputes every cached total from `items`.
    pub fn derive(items: &[OrderItem]) -> OrderTotals {
        let mut t = OrderTotals::default();
        for item in items {
            match &item.detail {
                OrderItemDetail::LineItem { subtotal, total_tax, .. } => {
                    t.subtotal += *subtotal;
                    t.cart_tax += *total_tax;
                }
                OrderItemDetail::Shipping { total, total_tax, .. } => {
                    t.shipping_total += *total;
                    t.shipping_tax += *total_tax;
                }
                OrderItemDetail::Fee { total, total_tax, .. } => {
                    t.fee_total += *total;
                    t.cart_tax += *total_tax;
                }
                OrderItemDetail::Coupon { discount, discount_tax, .. } => {
                    t.discount_total += *discount;
                    t.discount_tax += *discount_tax;
                }
                OrderItemDetail::Tax { .. } => {}
            }
        }
        t.total_tax = t.cart_tax + t.shipping_tax;
        t.total = t.subtotal - t.discount_total + t.shipping_total + t.fee_total + t.total_tax;
        t
    }

    /// Checks the cached totals against `items`, plus the cross-checks
    /// between item kinds (line discounts vs coupon rows, tax rows vs item
    /// taxes).
    pub fn verify(&self, items: &[OrderItem]) -> CoreResult<()> {
        let derived = OrderTotals::derive(items);
        let fields = [
            ("subtotal", derived.subtotal, self.subtotal),
            ("discount_total", derived.discount_total, self.discount_total),
            ("discount_tax", derived.discount_tax, self.discount_tax),
            ("shipping_total", derived.shipping_total, self.shipping_total),
            ("shipping_tax", derived.shipping_tax, self.shipping_tax),
            ("fee_total", derived.fee_total, self.fee_total),
            ("cart_tax", derived.cart_tax, self.cart_tax),
            ("total_tax", derived.total_tax, self.total_tax),
            ("total", derived.total, self.total),
        ];
        for (field, expected, actual) in fields {
            mismatch(field, expected, actual)?;
        }

        let mut line_discount = Money::ZERO;
        let mut line_discount_tax = Money::ZERO;
        let mut item_taxes: Vec<TaxLine> = Vec::new();
        let mut shipping_taxes: Vec<TaxLine> = Vec::new();
        let mut tax_rows = Money::ZERO;
        let mut shipping_tax_rows = Money::ZERO;

        for item in items {
            match &item.detail {
                OrderItemDetail::LineItem { subtotal, subtotal_tax, total, total_tax, taxes, .. } => {
                    line_discount += *subtotal - *total;
                    line_discount_tax += *subtotal_tax - *total_tax;
                    mismatch("line_item.total_tax", tax::total(taxes), *total_tax)?;
                    tax::merge_lines(&mut item_taxes, taxes);
                }
                OrderItemDetail::Fee { total_tax, taxes, .. } => {
                    mismatch("fee.total_tax", tax::total(taxes), *total_tax)?;
                    tax::merge_lines(&mut item_taxes, taxes);
                }
                OrderItemDetail::Shipping { total_tax, taxes, .. } => {
                    mismatch("shipping.total_tax", tax::total(taxes), *total_tax)?;
                    tax::merge_lines(&mut shipping_taxes, taxes);
                }
                OrderItemDetail::Tax { tax_amount, shipping_tax_amount, .. } => {
                    tax_rows += *tax_amount;
                    shipping_tax_rows += *shipping_tax_amount;
                }
                OrderItemDetail::Coupon { .. } => {}
            }
        }

        mismatch("discount_total", line_discount, self.discount_total)?;
        mismatch("discount_tax", line_discount_tax, self.discount_tax)?;
        mismatch("tax.tax_amount", tax::total(&item_taxes), tax_rows)?;
        mismatch("tax.shipping_tax_amount", tax::total(&shipping_taxes), shipping_tax_rows)?;
        Ok(())
    }
}

fn mismatch(field: &str, expected: Money, actual: Money) -> CoreResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(CoreError::TotalsMismatch {
            field: field.to_string(),
            expected,
            actual,
        })
    }
}

// =============================================================================
// Order
// =============================================================================

/// A settled order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    /// From the order number sequence; never reused.
    pub number: i64,
    pub quote_id: String,
    pub status: OrderStatus,
    pub currency: String,
    pub prices_include_tax: bool,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    pub billing: Jurisdiction,
    pub totals: OrderTotals,
    pub payment_method: Option<String>,
    pub gateway_transaction_id: Option<String>,
    /// Units were taken from inventory and not yet put back.
    pub stock_reduced: bool,
    /// Customer aggregates already include this order.
    pub stats_recorded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub items: Vec<OrderItem>,
}

impl Order {
    /// Moves the order to `to`, returning the previous status.
    pub fn transition(&mut self, to: OrderStatus, now: DateTime<Utc>) -> CoreResult<OrderStatus> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(CoreError::InvalidTransition {
                order_id: self.id.clone(),
                from,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        if to == OrderStatus::Completed && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        Ok(from)
    }

    pub fn line_items(&self) -> impl Iterator<Item = &OrderItem> {
        self.items.iter().filter(|i| i.kind() == OrderItemKind::LineItem)
    }

    pub fn item(&self, item_id: &str) -> Option<&OrderItem> {
        self.items.iter().find(|i| i.id == item_id)
    }

    /// Re-derives the totals from the items and compares.
    pub fn verify_totals(&self) -> CoreResult<()> {
        self.totals.verify(&self.items)
    }
}

/// Free-text note on an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderNote {
    pub id: String,
    pub order_id: String,
    pub content: String,
    /// Visible to the customer.
    pub is_customer_note: bool,
    /// Written by the engine rather than a person.
    pub system: bool,
    pub created_at: DateTime<Utc>,
}

impl OrderNote {
    pub fn system(order_id: impl Into<String>, content: impl Into<String>, now: DateTime<Utc>) -> Self {
        OrderNote {
            id: Uuid::new_v4().to_string(),
            order_id: order_id.into(),
            content: content.into(),
            is_customer_note: false,
            system: true,
            created_at: now,
        }
    }
}

/// One row of an order's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub order_id: String,
    pub from: Option<OrderStatus>,
    pub to: OrderStatus,
    pub changed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(s: &str) -> Money {
        s.parse().unwrap()
    }

    fn tax_line(amount: &str) -> TaxLine {
        TaxLine {
            rate_id: "vat".to_string(),
            label: "VAT".to_string(),
            rate: Rate::from_percent(8),
            compound: false,
            amount: m(amount),
        }
    }

    fn item(position: i64, detail: OrderItemDetail) -> OrderItem {
        OrderItem {
            id: format!("item-{position}"),
            order_id: "order-1".to_string(),
            position,
            name: "item".to_string(),
            detail,
        }
    }

    fn sample_items() -> Vec<OrderItem> {
        vec![
            item(
                0,
                OrderItemDetail::LineItem {
                    product_id: "mug".to_string(),
                    variation_id: None,
                    stock_item_id: Some("mug".to_string()),
                    sku: None,
                    quantity: 2,
                    unit_price: m("10.00"),
                    tax_class: "standard".to_string(),
                    subtotal: m("20.00"),
                    subtotal_tax: m("1.60"),
                    total: m("15.00"),
                    total_tax: m("1.20"),
                    taxes: vec![tax_line("1.20")],
                },
            ),
            item(
                1,
                OrderItemDetail::Shipping {
                    method_id: "flat_rate".to_string(),
                    total: m("5.00"),
                    total_tax: m("0.40"),
                    taxes: vec![tax_line("0.40")],
                },
            ),
            item(
                2,
                OrderItemDetail::Coupon {
                    coupon_id: "c1".to_string(),
                    code: "FIVE".to_string(),
                    discount: m("5.00"),
                    discount_tax: m("0.40"),
                },
            ),
            item(
                3,
                OrderItemDetail::Tax {
                    rate_id: "vat".to_string(),
                    label: "VAT".to_string(),
                    rate: Rate::from_percent(8),
                    compound: false,
                    tax_amount: m("1.20"),
                    shipping_tax_amount: m("0.40"),
                },
            ),
        ]
    }

    #[test]
    fn test_transitions() {
        use OrderStatus::*;
        assert!(CheckoutDraft.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(OnHold.can_transition_to(Cancelled));
        assert!(Completed.can_transition_to(Refunded));

        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Refunded.can_transition_to(Completed));
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in OrderStatus::ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        assert!("shipped".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_derive_totals() {
        let totals = OrderTotals::derive(&sample_items());
        assert_eq!(totals.subtotal, m("20.00"));
        assert_eq!(totals.discount_total, m("5.00"));
        assert_eq!(totals.total_tax, m("1.60"));
        assert_eq!(totals.total, m("21.60"));
        assert!(totals.verify(&sample_items()).is_ok());
    }

    #[test]
    fn test_verify_catches_drift() {
        let items = sample_items();
        let mut totals = OrderTotals::derive(&items);
        totals.total += Money::from_units(1);
        assert!(matches!(
            totals.verify(&items),
            Err(CoreError::TotalsMismatch { ref field, .. }) if field == "total"
        ));

        let mut items = sample_items();
        if let OrderItemDetail::Tax { tax_amount, .. } = &mut items[3].detail {
            *tax_amount = m("1.21");
        }
        let totals = OrderTotals::derive(&items);
        assert!(totals.verify(&items).is_err());
    }

    #[test]
    fn test_refundable_totals() {
        let items = sample_items();
        assert_eq!(items[0].refundable_total(), Some(m("16.20")));
        assert_eq!(items[1].refundable_total(), Some(m("5.40")));
        assert_eq!(items[2].refundable_total(), None);
        assert_eq!(items[3].refundable_total(), None);
    }
}
