//! # Settlement
//!
//! Turns a quote and a payment outcome into a durable order in one
//! transaction.
//!
//! ## Settlement Steps
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       settle(quote, outcome)                            │
//! │                                                                         │
//! │  0. verify quote totals, reject an already settled quote                │
//! │  1. take the next order number (committed at once, never reused)        │
//! │                                                                         │
//! │  payment failed:                                                        │
//! │     BEGIN ─► insert order ─► pending ─► failed ─► COMMIT                │
//! │     (no coupon usage, no stock, no balances)                            │
//! │                                                                         │
//! │  payment succeeded:                                                     │
//! │     lock inventory rows, coupons, customer, ledgers (sorted)            │
//! │     BEGIN                                                               │
//! │       insert order + items                    (UNIQUE quote_id)         │
//! │       coupons:  per-user check, usage slot    ──► CouponExhausted       │
//! │       stock:    reserve, compare-and-swap     ──► InsufficientStock     │
//! │       balances: debit each redemption         ──► InsufficientBalance   │
//! │       pending ─► processing [─► completed ─► customer stats, points]    │
//! │       outbox events                                                     │
//! │     COMMIT                                                              │
//! │                                                                         │
//! │  Any error before COMMIT rolls everything back; the number stays used.  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use meridian_core::coupon::CouponRejection;
use meridian_core::event::DomainEvent;
use meridian_core::ledger::{BalancePayment, LedgerReason, Redemption};
use meridian_core::order::{build_order_items, OrderNote, StatusChange};
use meridian_core::{CoreError, Money, Order, OrderStatus, Quote, ValidationError};
use meridian_db::{
    CouponRepository, CouponUsage, InventoryRepository, LedgerRepository, OrderRepository, SqliteConnection,
    ORDER_SEQUENCE,
};

use crate::engine::{enqueue_all, CheckoutEngine};
use crate::error::{EngineError, EngineResult};
use crate::ledger::append;
use crate::locks::Resource;
use crate::payment::{PaymentGateway, PaymentOutcome, PaymentRequest, PaymentResult};

impl CheckoutEngine {
    /// Settles `quote` under a new order id.
    pub async fn settle(&self, quote: &Quote, outcome: &PaymentOutcome) -> EngineResult<Order> {
        self.settle_as(&Uuid::new_v4().to_string(), quote, outcome).await
    }

    /// Settles `quote` as order `order_id`.
    pub async fn settle_as(&self, order_id: &str, quote: &Quote, outcome: &PaymentOutcome) -> EngineResult<Order> {
        quote.verify_totals()?;
        validate_redemptions(quote, &outcome.redemptions)?;
        self.ensure_unsettled(quote).await?;

        let number = self.db().sequences().next(ORDER_SEQUENCE).await?;
        let now = Utc::now();
        let mut order = Order {
            id: order_id.to_string(),
            number,
            quote_id: quote.id.clone(),
            status: OrderStatus::Pending,
            currency: quote.currency.clone(),
            prices_include_tax: quote.prices_include_tax,
            customer_id: quote.customer.customer_id.clone(),
            customer_email: quote.customer.email.clone(),
            billing: quote.jurisdiction.clone(),
            totals: quote.totals,
            payment_method: outcome.method.clone(),
            gateway_transaction_id: outcome.gateway_transaction_id.clone(),
            stock_reduced: false,
            stats_recorded: false,
            created_at: now,
            updated_at: now,
            paid_at: None,
            completed_at: None,
            items: build_order_items(quote, order_id),
        };

        if let PaymentResult::Failure { code, message } = &outcome.result {
            return self.settle_failed(order, code, message).await;
        }

        let _locks = self.lock(self.settlement_locks(quote, &outcome.redemptions)).await?;

        let mut tx = self.db().begin().await?;
        let mut events = Vec::new();
        insert_pending(&mut tx, &order, &mut events).await?;

        for coupon in &quote.coupons {
            events.push(take_coupon_slot(&mut tx, &order, &coupon.code).await?);
        }

        for (snapshot, quantity) in quote.stock_demand() {
            let mut record = InventoryRepository::load_or_seed(&mut tx, &snapshot).await?;
            let expected = record.stock_quantity;
            let movement = record.reserve(quantity).inspect_err(|e| {
                warn!(order_id = %order.id, item_id = %snapshot.item_id, error = %e, "Stock reservation rejected")
            })?;
            InventoryRepository::compare_and_swap(&mut tx, &record, expected).await?;

            if movement.low_stock_crossed {
                events.push(DomainEvent::LowStockCrossed {
                    item_id: record.item_id.clone(),
                    product_id: record.product_id.clone(),
                    stock_quantity: movement.new,
                    threshold: record.low_stock_amount.unwrap_or(0),
                });
            }
            if movement.backordered > 0 {
                events.push(DomainEvent::BackorderPlaced {
                    order_id: order.id.clone(),
                    item_id: record.item_id.clone(),
                    backordered: movement.backordered,
                    notify: movement.notify,
                });
            }
        }
        order.stock_reduced = true;

        for (position, redemption) in outcome.redemptions.iter().enumerate() {
            redeem(&mut tx, &order, redemption, position as i64).await?;
        }

        order.paid_at = Some(now);
        self.move_to(&mut tx, &mut order, OrderStatus::Processing, now, &mut events)
            .await?;
        if self.config().settlement.complete_on_payment {
            self.move_to(&mut tx, &mut order, OrderStatus::Completed, now, &mut events)
                .await?;
        }

        OrderRepository::update_state(&mut tx, &order, OrderStatus::Pending).await?;
        enqueue_all(&mut tx, &events).await?;
        tx.commit().await?;

        info!(
            order_id = %order.id,
            number = order.number,
            status = %order.status,
            total = %order.totals.total,
            "Order settled"
        );
        Ok(order)
    }

    /// Charges the gateway for what balances do not cover, then settles.
    ///
    /// A settlement failure after a captured charge keeps the gateway
    /// reference in [`EngineError::PaymentCapturedButNotSettled`].
    pub async fn pay_and_settle(
        &self,
        quote: &Quote,
        method: &str,
        redemptions: Vec<Redemption>,
        gateway: &dyn PaymentGateway,
    ) -> EngineResult<Order> {
        quote.verify_totals()?;
        validate_redemptions(quote, &redemptions)?;
        self.ensure_unsettled(quote).await?;

        let order_id = Uuid::new_v4().to_string();
        let due = quote.total() - redemptions.iter().map(|r| r.amount).sum::<Money>();

        let outcome = if due.is_positive() {
            let request = PaymentRequest {
                order_id: order_id.clone(),
                amount: due,
                currency: quote.currency.clone(),
                method: method.to_string(),
            };
            gateway.charge(&request).await.with_redemptions(redemptions)
        } else {
            PaymentOutcome::balances_only(redemptions)
        };

        match self.settle_as(&order_id, quote, &outcome).await {
            Ok(order) => Ok(order),
            Err(e) => match (&outcome.result, &outcome.gateway_transaction_id) {
                (PaymentResult::Success, Some(txid)) => {
                    warn!(order_id = %order_id, gateway_transaction_id = %txid, error = %e, "Payment captured but settlement failed");
                    Err(EngineError::PaymentCapturedButNotSettled {
                        order_id,
                        gateway_transaction_id: txid.clone(),
                        source: Box::new(e),
                    })
                }
                _ => Err(e),
            },
        }
    }

    async fn settle_failed(&self, mut order: Order, code: &str, message: &str) -> EngineResult<Order> {
        let now = order.created_at;
        let mut tx = self.db().begin().await?;
        let mut events = Vec::new();
        insert_pending(&mut tx, &order, &mut events).await?;

        self.move_to(&mut tx, &mut order, OrderStatus::Failed, now, &mut events)
            .await?;
        let note = OrderNote::system(&order.id, format!("Payment failed ({code}): {message}"), now);
        OrderRepository::insert_note(&mut tx, &note).await?;

        OrderRepository::update_state(&mut tx, &order, OrderStatus::Pending).await?;
        enqueue_all(&mut tx, &events).await?;
        tx.commit().await?;

        warn!(order_id = %order.id, number = order.number, code = %code, "Payment failed; order recorded as failed");
        Ok(order)
    }

    async fn ensure_unsettled(&self, quote: &Quote) -> EngineResult<()> {
        if let Some(existing) = self.db().orders().get_by_quote(&quote.id).await? {
            warn!(quote_id = %quote.id, order_id = %existing.id, "Quote already settled");
            return Err(EngineError::DuplicateSettlement {
                quote_id: quote.id.clone(),
            });
        }
        Ok(())
    }

    /// Every row a successful settlement of `quote` may write.
    fn settlement_locks(&self, quote: &Quote, redemptions: &[Redemption]) -> Vec<Resource> {
        let mut resources: Vec<Resource> = quote
            .stock_demand()
            .into_iter()
            .map(|(record, _)| Resource::Inventory(record.item_id))
            .collect();
        resources.extend(quote.coupons.iter().map(|c| Resource::Coupon(c.coupon_id.clone())));

        let customer = &quote.customer;
        if customer.customer_id.is_none() && !quote.coupons.is_empty() {
            if let Some(email) = &customer.email {
                resources.push(Resource::Customer(email.to_lowercase()));
            }
        }
        resources.extend(self.completion_locks(customer.customer_id.as_deref()));
        resources.extend(redemptions.iter().map(|r| Resource::ledger(r.kind, &r.owner)));
        resources
    }
}

// =============================================================================
// Steps
// =============================================================================

async fn insert_pending(conn: &mut SqliteConnection, order: &Order, events: &mut Vec<DomainEvent>) -> EngineResult<()> {
    OrderRepository::insert(conn, order).await.map_err(|e| {
        if e.is_unique_violation_on("orders.quote_id") {
            warn!(quote_id = %order.quote_id, "Quote settled concurrently");
            EngineError::DuplicateSettlement {
                quote_id: order.quote_id.clone(),
            }
        } else {
            EngineError::from(e)
        }
    })?;
    OrderRepository::record_status(
        conn,
        &StatusChange {
            order_id: order.id.clone(),
            from: None,
            to: OrderStatus::Pending,
            changed_at: order.created_at,
        },
    )
    .await?;
    events.push(DomainEvent::OrderStatusChanged {
        order_id: order.id.clone(),
        number: order.number,
        from: None,
        to: OrderStatus::Pending,
    });
    Ok(())
}

/// Re-checks a coupon at commit time and takes one usage slot.
async fn take_coupon_slot(conn: &mut SqliteConnection, order: &Order, code: &str) -> EngineResult<DomainEvent> {
    let coupon = CouponRepository::find_by_code(conn, code)
        .await?
        .ok_or_else(|| CoreError::CouponRejected {
            code: code.to_string(),
            reason: CouponRejection::NotFound,
        })?;

    let exhausted = || {
        warn!(order_id = %order.id, coupon = %coupon.code, "Coupon has no usage left");
        EngineError::CouponExhausted {
            code: coupon.code.clone(),
        }
    };

    if let Some(limit) = coupon.usage_limit_per_user {
        let used = CouponRepository::user_usage_count(
            conn,
            &coupon.id,
            order.customer_id.as_deref(),
            order.customer_email.as_deref(),
        )
        .await?;
        if used >= limit {
            return Err(exhausted());
        }
    }

    let usage_count = CouponRepository::try_increment_usage(conn, &coupon.id)
        .await?
        .ok_or_else(exhausted)?;
    let usage = CouponUsage::new(
        &coupon.id,
        &order.id,
        order.customer_id.clone(),
        order.customer_email.clone(),
        order.created_at,
    );
    CouponRepository::record_usage(conn, &usage).await?;

    Ok(DomainEvent::CouponUsageRecorded {
        coupon_id: coupon.id.clone(),
        code: coupon.code.clone(),
        order_id: order.id.clone(),
        usage_count,
    })
}

/// Debits one balance and records it against the order.
async fn redeem(conn: &mut SqliteConnection, order: &Order, redemption: &Redemption, position: i64) -> EngineResult<()> {
    let account = LedgerRepository::find_account(conn, redemption.kind, &redemption.owner)
        .await?
        .ok_or_else(|| EngineError::not_found("ledger_account", &redemption.owner))?;
    account.usable(order.created_at)?;

    let units = redemption.ledger_units();
    append(
        conn,
        &account.id,
        -units,
        LedgerReason::Redeemed,
        Some(&order.id),
        None,
        order.created_at,
    )
    .await?;

    let payment = BalancePayment {
        id: Uuid::new_v4().to_string(),
        order_id: order.id.clone(),
        account_id: account.id.clone(),
        kind: redemption.kind,
        amount: redemption.amount,
        units,
        refunded_amount: Money::ZERO,
        refunded_units: 0,
    };
    LedgerRepository::insert_payment(conn, &payment, position).await?;
    Ok(())
}

/// Redemptions must be positive and may not exceed the quote total.
fn validate_redemptions(quote: &Quote, redemptions: &[Redemption]) -> EngineResult<()> {
    for redemption in redemptions {
        if !redemption.amount.is_positive() || redemption.ledger_units() <= 0 {
            return Err(ValidationError::MustBePositive {
                field: "redemption amount".to_string(),
            }
            .into());
        }
    }
    let redeemed: Money = redemptions.iter().map(|r| r.amount).sum();
    if redeemed > quote.total() {
        return Err(ValidationError::OutOfRange {
            field: "redemption total".to_string(),
            min: 0,
            max: quote.total().units(),
        }
        .into());
    }
    Ok(())
}
