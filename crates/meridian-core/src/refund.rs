//! # Refund Validation
//!
//! Checks a refund request against an order and everything already
//! refunded on it, and works out what the refund does.
//!
//! ## Limits
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  per line item   Σ refunded quantity  <= quantity bought                │
//! │  per item        Σ refunded amount    <= item total + item tax          │
//! │  per order       Σ refunds            <= order total                    │
//! │                                                                         │
//! │  Shipping and fee rows: amount only. Tax and coupon rows: never.        │
//! │  Order status: must be completed.                                       │
//! │                                                                         │
//! │  Σ refunds == order total  →  order becomes refunded                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Limits are cumulative, so replaying the same request after it succeeded
//! is rejected rather than applied twice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::money::Money;
use crate::order::{Order, OrderItemDetail, OrderStatus};

// =============================================================================
// Request
// =============================================================================

/// Part of a refund against one order item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundLineRequest {
    pub order_item_id: String,
    /// Units returned. Line items only; 0 for an amount-only refund.
    #[serde(default)]
    pub quantity: i64,
    /// Gross amount. When omitted it is prorated from the quantity, or the
    /// whole remaining amount for shipping and fee rows.
    #[serde(default)]
    pub amount: Option<Money>,
}

impl RefundLineRequest {
    pub fn units(order_item_id: impl Into<String>, quantity: i64) -> Self {
        RefundLineRequest {
            order_item_id: order_item_id.into(),
            quantity,
            amount: None,
        }
    }

    pub fn amount(order_item_id: impl Into<String>, amount: Money) -> Self {
        RefundLineRequest {
            order_item_id: order_item_id.into(),
            quantity: 0,
            amount: Some(amount),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub order_id: String,
    pub lines: Vec<RefundLineRequest>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Put refunded units back into inventory.
    #[serde(default)]
    pub restock: bool,
}

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundItem {
    pub id: String,
    pub refund_id: String,
    pub order_item_id: String,
    pub quantity: i64,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    pub order_id: String,
    pub amount: Money,
    pub reason: Option<String>,
    pub restocked: bool,
    pub created_at: DateTime<Utc>,
    pub items: Vec<RefundItem>,
}

/// Cumulative refunds on an order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefundHistory {
    per_item: HashMap<String, (i64, Money)>,
    total: Money,
}

impl RefundHistory {
    pub fn from_refunds(refunds: &[Refund]) -> Self {
        let mut history = RefundHistory::default();
        for refund in refunds {
            history.total += refund.amount;
            for item in &refund.items {
                let entry = history.per_item.entry(item.order_item_id.clone()).or_insert((0, Money::ZERO));
                entry.0 += item.quantity;
                entry.1 += item.amount;
            }
        }
        history
    }

    pub fn total(&self) -> Money {
        self.total
    }

    /// `(quantity, amount)` refunded so far on one item.
    pub fn for_item(&self, order_item_id: &str) -> (i64, Money) {
        self.per_item.get(order_item_id).copied().unwrap_or((0, Money::ZERO))
    }
}

// =============================================================================
// Planning
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRefundLine {
    pub order_item_id: String,
    pub quantity: i64,
    pub amount: Money,
}

/// A validated refund, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundPlan {
    pub amount: Money,
    pub lines: Vec<PlannedRefundLine>,
    /// `(stock item id, units)` to restock, sorted by id.
    pub restock: Vec<(String, i64)>,
    /// Refunds now add up to the order total.
    pub fully_refunded: bool,
}

/// Validates `request` against `order` and its refund `history`.
pub fn plan_refund(order: &Order, request: &RefundRequest, history: &RefundHistory) -> CoreResult<RefundPlan> {
    if order.status != OrderStatus::Completed {
        return Err(CoreError::RefundNotAllowed {
            order_id: order.id.clone(),
            status: order.status,
        });
    }
    if request.lines.is_empty() {
        return Err(ValidationError::Required {
            field: "refund lines".to_string(),
        }
        .into());
    }

    let mut seen = HashSet::new();
    let mut lines = Vec::with_capacity(request.lines.len());
    let mut restock: BTreeMap<String, i64> = BTreeMap::new();

    for line in &request.lines {
        if !seen.insert(line.order_item_id.as_str()) {
            return Err(ValidationError::Duplicate {
                field: "order_item_id".to_string(),
                value: line.order_item_id.clone(),
            }
            .into());
        }
        let invalid = |reason: &str| CoreError::RefundItemInvalid {
            order_item_id: line.order_item_id.clone(),
            reason: reason.to_string(),
        };

        let item = order.item(&line.order_item_id).ok_or_else(|| invalid("not on this order"))?;
        let gross = item
            .refundable_total()
            .ok_or_else(|| invalid("tax and coupon rows cannot be refunded directly"))?;
        let (refunded_qty, refunded_amount) = history.for_item(&item.id);
        let remaining = gross - refunded_amount;

        if line.quantity < 0 {
            return Err(ValidationError::MustBePositive {
                field: "quantity".to_string(),
            }
            .into());
        }

        let amount = match &item.detail {
            OrderItemDetail::LineItem { quantity, stock_item_id, .. } => {
                if refunded_qty + line.quantity > *quantity {
                    return Err(CoreError::RefundExceedsQuantity {
                        order_item_id: item.id.clone(),
                        original: *quantity,
                        already_refunded: refunded_qty,
                        requested: line.quantity,
                    });
                }
                if request.restock && line.quantity > 0 {
                    if let Some(stock_item_id) = stock_item_id {
                        *restock.entry(stock_item_id.clone()).or_insert(0) += line.quantity;
                    }
                }
                match line.amount {
                    Some(amount) => amount,
                    None if line.quantity == 0 => return Err(invalid("give a quantity or an amount")),
                    None if refunded_qty + line.quantity == *quantity => remaining,
                    None => (gross * line.quantity).divide_by(*quantity).unwrap_or(Money::ZERO),
                }
            }
            _ => {
                if line.quantity != 0 {
                    return Err(invalid("quantity only applies to line items"));
                }
                line.amount.unwrap_or(remaining)
            }
        };

        if !amount.is_positive() {
            return Err(ValidationError::MustBePositive {
                field: "amount".to_string(),
            }
            .into());
        }
        if amount > remaining {
            return Err(CoreError::RefundExceedsItemTotal {
                order_item_id: item.id.clone(),
                remaining,
                requested: amount,
            });
        }

        lines.push(PlannedRefundLine {
            order_item_id: item.id.clone(),
            quantity: line.quantity,
            amount,
        });
    }

    let amount: Money = lines.iter().map(|l| l.amount).sum();
    let order_remaining = order.totals.total - history.total();
    if amount > order_remaining {
        return Err(CoreError::RefundExceedsOrderTotal {
            order_id: order.id.clone(),
            remaining: order_remaining,
            requested: amount,
        });
    }

    Ok(RefundPlan {
        amount,
        lines,
        restock: restock.into_iter().collect(),
        fully_refunded: amount == order_remaining,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{OrderItem, OrderTotals};
    use crate::rate::Rate;
    use crate::tax::TaxLine;
    use crate::types::Jurisdiction;

    fn m(s: &str) -> Money {
        s.parse().unwrap()
    }

    fn completed_order() -> Order {
        let tax = |amount: &str| TaxLine {
            rate_id: "us".to_string(),
            label: "Tax".to_string(),
            rate: Rate::from_percent(8),
            compound: false,
            amount: m(amount),
        };
        let items = vec![
            OrderItem {
                id: "line".to_string(),
                order_id: "o-1".to_string(),
                position: 0,
                name: "Mug".to_string(),
                detail: OrderItemDetail::LineItem {
                    product_id: "mug".to_string(),
                    variation_id: None,
                    stock_item_id: Some("mug".to_string()),
                    sku: None,
                    quantity: 2,
                    unit_price: m("10.00"),
                    tax_class: "standard".to_string(),
                    subtotal: m("20.00"),
                    subtotal_tax: m("1.60"),
                    total: m("20.00"),
                    total_tax: m("1.60"),
                    taxes: vec![tax("1.60")],
                },
            },
            OrderItem {
                id: "ship".to_string(),
                order_id: "o-1".to_string(),
                position: 1,
                name: "Flat rate".to_string(),
                detail: OrderItemDetail::Shipping {
                    method_id: "flat_rate".to_string(),
                    total: m("5.00"),
                    total_tax: m("0.40"),
                    taxes: vec![tax("0.40")],
                },
            },
            OrderItem {
                id: "tax".to_string(),
                order_id: "o-1".to_string(),
                position: 2,
                name: "Tax".to_string(),
                detail: OrderItemDetail::Tax {
                    rate_id: "us".to_string(),
                    label: "Tax".to_string(),
                    rate: Rate::from_percent(8),
                    compound: false,
                    tax_amount: m("1.60"),
                    shipping_tax_amount: m("0.40"),
                },
            },
        ];
        let now = Utc::now();
        Order {
            id: "o-1".to_string(),
            number: 1,
            quote_id: "q-1".to_string(),
            status: OrderStatus::Completed,
            currency: "USD".to_string(),
            prices_include_tax: false,
            customer_id: None,
            customer_email: None,
            billing: Jurisdiction::country("US"),
            totals: OrderTotals::derive(&items),
            payment_method: None,
            gateway_transaction_id: None,
            stock_reduced: true,
            stats_recorded: true,
            created_at: now,
            updated_at: now,
            paid_at: Some(now),
            completed_at: Some(now),
            items,
        }
    }

    fn record(plan: &RefundPlan, id: &str) -> Refund {
        Refund {
            id: id.to_string(),
            order_id: "o-1".to_string(),
            amount: plan.amount,
            reason: None,
            restocked: false,
            created_at: Utc::now(),
            items: plan
                .lines
                .iter()
                .map(|l| RefundItem {
                    id: format!("{id}-{}", l.order_item_id),
                    refund_id: id.to_string(),
                    order_item_id: l.order_item_id.clone(),
                    quantity: l.quantity,
                    amount: l.amount,
                })
                .collect(),
        }
    }

    fn request(lines: Vec<RefundLineRequest>, restock: bool) -> RefundRequest {
        RefundRequest {
            order_id: "o-1".to_string(),
            lines,
            reason: None,
            restock,
        }
    }

    #[test]
    fn test_partial_then_remaining_then_rejected() {
        let order = completed_order();
        let one = request(vec![RefundLineRequest::units("line", 1)], true);

        let first = plan_refund(&order, &one, &RefundHistory::default()).unwrap();
        assert_eq!(first.amount, m("10.80"));
        assert_eq!(first.restock, vec![("mug".to_string(), 1)]);
        assert!(!first.fully_refunded);

        let history = RefundHistory::from_refunds(&[record(&first, "r1")]);
        let second = plan_refund(&order, &one, &history).unwrap();
        assert_eq!(second.amount, m("10.80"));

        let history = RefundHistory::from_refunds(&[record(&first, "r1"), record(&second, "r2")]);
        assert!(matches!(
            plan_refund(&order, &one, &history),
            Err(CoreError::RefundExceedsQuantity { original: 2, already_refunded: 2, requested: 1, .. })
        ));
    }

    #[test]
    fn test_full_refund_detected() {
        let order = completed_order();
        let all = request(
            vec![RefundLineRequest::units("line", 2), RefundLineRequest::amount("ship", m("5.40"))],
            false,
        );
        let plan = plan_refund(&order, &all, &RefundHistory::default()).unwrap();
        assert_eq!(plan.amount, m("27.00"));
        assert!(plan.fully_refunded);
        assert!(plan.restock.is_empty());
    }

    #[test]
    fn test_item_and_row_limits() {
        let order = completed_order();

        let too_much = request(vec![RefundLineRequest::amount("ship", m("5.41"))], false);
        assert!(matches!(
            plan_refund(&order, &too_much, &RefundHistory::default()),
            Err(CoreError::RefundExceedsItemTotal { .. })
        ));

        let tax_row = request(vec![RefundLineRequest::amount("tax", m("1.00"))], false);
        assert!(matches!(
            plan_refund(&order, &tax_row, &RefundHistory::default()),
            Err(CoreError::RefundItemInvalid { .. })
        ));

        let shipping_units = request(vec![RefundLineRequest::units("ship", 1)], false);
        assert!(matches!(
            plan_refund(&order, &shipping_units, &RefundHistory::default()),
            Err(CoreError::RefundItemInvalid { .. })
        ));

        let twice = request(
            vec![RefundLineRequest::units("line", 1), RefundLineRequest::units("line", 1)],
            false,
        );
        assert!(matches!(
            plan_refund(&order, &twice, &RefundHistory::default()),
            Err(CoreError::Validation(ValidationError::Duplicate { .. }))
        ));
    }

    #[test]
    fn test_order_total_cap() {
        let order = completed_order();
        let history = RefundHistory::from_refunds(&[Refund {
            id: "r0".to_string(),
            order_id: "o-1".to_string(),
            amount: m("26.00"),
            reason: None,
            restocked: false,
            created_at: Utc::now(),
            items: Vec::new(),
        }]);
        let shipping = request(vec![RefundLineRequest::amount("ship", m("2.00"))], false);
        assert!(matches!(
            plan_refund(&order, &shipping, &history),
            Err(CoreError::RefundExceedsOrderTotal { .. })
        ));
    }

    #[test]
    fn test_only_completed_orders() {
        let mut order = completed_order();
        order.status = OrderStatus::Processing;
        let one = request(vec![RefundLineRequest::units("line", 1)], false);
        assert!(matches!(
            plan_refund(&order, &one, &RefundHistory::default()),
            Err(CoreError::RefundNotAllowed { .. })
        ));
    }
}
