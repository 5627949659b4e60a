//! # Checkout Engine
//!
//! Entry point for quoting, settling, transitioning and refunding orders.
//!
//! ## Operation Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CheckoutEngine                                 │
//! │                                                                         │
//! │   quote(request) ─────────► read-only, runs fully in parallel           │
//! │        │                    catalog + stored stock + coupons + tax      │
//! │        ▼                                                                │
//! │   settle(quote, outcome) ─► row locks ──► one transaction ──► Order     │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   transition / cancel ────► row locks ──► history + note + event        │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   refund(request) ────────► row locks ──► Refund (+ restock, credit)    │
//! │                                                                         │
//! │   Every write path: read ──► lock (sorted) ──► BEGIN ──► ... COMMIT     │
//! │   No pool connection is held while waiting for a row lock.              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use meridian_core::catalog::{Catalog, CatalogEntry};
use meridian_core::coupon::CouponBook;
use meridian_core::customer::CustomerStats;
use meridian_core::event::DomainEvent;
use meridian_core::inventory::InventoryRecord;
use meridian_core::ledger::{self, LedgerKind, LedgerReason};
use meridian_core::order::{OrderItemDetail, OrderNote, StatusChange};
use meridian_core::refund::Refund;
use meridian_core::tax::{TaxContext, TaxTable};
use meridian_core::validation::validate_note;
use meridian_core::{CartAggregator, Jurisdiction, Money, Order, OrderStatus, Quote, QuoteRequest};
use meridian_db::{
    CustomerRepository, Database, EventOutboxRepository, InventoryRepository, LedgerRepository, OrderRepository,
    SqliteConnection,
};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::ledger::append;
use crate::locks::{LockSet, Resource, RowLocks};

// =============================================================================
// Engine
// =============================================================================

/// Checkout and settlement over one store's database.
#[derive(Clone)]
pub struct CheckoutEngine {
    db: Database,
    config: Arc<EngineConfig>,
    catalog: Arc<dyn Catalog>,
    tax_table: TaxTable,
    locks: RowLocks,
}

impl CheckoutEngine {
    pub fn new(db: Database, config: EngineConfig, catalog: Arc<dyn Catalog>, tax_table: TaxTable) -> Self {
        CheckoutEngine {
            db,
            config: Arc::new(config),
            catalog,
            tax_table,
            locks: RowLocks::new(),
        }
    }

    /// Validates `config`, opens its database and runs migrations.
    pub async fn open(config: EngineConfig, catalog: Arc<dyn Catalog>, tax_table: TaxTable) -> EngineResult<Self> {
        config.validate()?;
        let db = Database::new(config.database.db_config()).await?;
        info!(store = %config.store.id, currency = %config.store.currency, "Checkout engine ready");
        Ok(Self::new(db, config, catalog, tax_table))
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn locks(&self) -> &RowLocks {
        &self.locks
    }

    /// Tax settings of the store for one billing address.
    pub fn tax_context(&self, billing: Jurisdiction) -> TaxContext {
        let store = &self.config.store;
        TaxContext::new(billing, self.tax_table.clone())
            .prices_include_tax(store.prices_include_tax)
            .price_decimals(store.price_decimals)
            .shipping_tax_class(store.shipping_tax_class.clone())
    }

    pub(crate) async fn lock(&self, resources: impl IntoIterator<Item = Resource>) -> EngineResult<LockSet> {
        self.locks
            .acquire(resources, self.config.settlement.lock_timeout())
            .await
    }

    // =========================================================================
    // Quote
    // =========================================================================

    /// Prices a cart against the catalog, stored stock, stored coupons and
    /// the store's tax table. Nothing is written.
    pub async fn quote(&self, request: &QuoteRequest, billing: Jurisdiction) -> EngineResult<Quote> {
        let coupons = self.db.coupons().get_by_codes(&request.coupon_codes).await?;
        let book = CouponBook::new(coupons);

        let mut request = request.clone();
        if let Some(customer_id) = request.customer.customer_id.as_deref() {
            if request.customer.coupon_usage.is_empty() && !book.is_empty() {
                request.customer.coupon_usage = self.db.coupons().usage_by_customer(customer_id).await?;
            }
        }

        let tracked: Vec<String> = request
            .lines
            .iter()
            .filter_map(|line| self.catalog.entry(&line.product_id, line.variation_id.as_deref()))
            .filter(|entry| entry.inventory.manage_stock)
            .map(|entry| entry.inventory.item_id)
            .collect();
        let ids: Vec<&str> = tracked.iter().map(String::as_str).collect();
        let stock = self.db.inventory().get_many(&ids).await?;

        let catalog = StoredStock {
            inner: self.catalog.as_ref(),
            stock,
        };
        let tax = self.tax_context(billing);
        let quote = CartAggregator::new(&catalog, &book, &tax)
            .currency(self.config.store.currency.clone())
            .at(Utc::now())
            .quote(&request)
            .inspect_err(|e| debug!(error = %e, "Quote rejected"))?;

        info!(
            quote_id = %quote.id,
            lines = quote.lines.len(),
            coupons = quote.coupons.len(),
            total = %quote.totals.total,
            "Quote built"
        );
        Ok(quote)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Moves an order along the state machine.
    ///
    /// Cancelling or failing an order releases what it consumed. Refunded
    /// is reached only through [`refund`](Self::refund).
    pub async fn transition(&self, order_id: &str, to: OrderStatus) -> EngineResult<Order> {
        match to {
            OrderStatus::Cancelled | OrderStatus::Failed => return self.release(order_id, to, None).await,
            OrderStatus::Refunded => {
                let order = self.order(order_id).await?;
                return Err(meridian_core::CoreError::InvalidTransition {
                    order_id: order.id,
                    from: order.status,
                    to,
                }
                .into());
            }
            _ => {}
        }

        let current = self.order(order_id).await?;
        let mut resources = vec![Resource::Order(order_id.to_string())];
        resources.extend(self.completion_locks(current.customer_id.as_deref()));
        let _locks = self.lock(resources).await?;

        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let mut order = OrderRepository::find(&mut tx, order_id)
            .await?
            .ok_or_else(|| EngineError::not_found("order", order_id))?;
        let expected = order.status;

        let mut events = Vec::new();
        self.move_to(&mut tx, &mut order, to, now, &mut events).await?;
        OrderRepository::update_state(&mut tx, &order, expected).await?;
        enqueue_all(&mut tx, &events).await?;
        tx.commit().await?;

        Ok(order)
    }

    /// Cancels an order, restoring stock and balances it consumed. Coupon
    /// usage stays counted.
    pub async fn cancel(&self, order_id: &str, reason: Option<&str>) -> EngineResult<Order> {
        self.release(order_id, OrderStatus::Cancelled, reason).await
    }

    async fn release(&self, order_id: &str, to: OrderStatus, reason: Option<&str>) -> EngineResult<Order> {
        let current = self.order(order_id).await?;
        let payments = self.db.ledgers().payments_for(order_id).await?;

        let mut resources = vec![Resource::Order(order_id.to_string())];
        if current.stock_reduced {
            resources.extend(stock_units(&current).into_keys().map(Resource::Inventory));
        }
        for payment in &payments {
            if let Some(account) = self.db.ledgers().get_account_by_id(&payment.account_id).await? {
                resources.push(Resource::ledger(account.kind, &account.owner));
            }
        }
        let _locks = self.lock(resources).await?;

        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let mut order = OrderRepository::find(&mut tx, order_id)
            .await?
            .ok_or_else(|| EngineError::not_found("order", order_id))?;
        let expected = order.status;

        let mut events = Vec::new();
        self.move_to(&mut tx, &mut order, to, now, &mut events).await?;

        if order.stock_reduced {
            for (item_id, quantity) in stock_units(&order) {
                restock(&mut tx, &item_id, quantity).await?;
            }
            order.stock_reduced = false;
        }

        let payments = LedgerRepository::payments_for_order(&mut tx, order_id).await?;
        let outstanding: Money = payments.iter().map(|p| p.outstanding()).sum();
        for reversal in ledger::plan_reversals(&payments, outstanding) {
            append(
                &mut tx,
                &reversal.account_id,
                reversal.units,
                LedgerReason::Reversed,
                Some(order_id),
                None,
                now,
            )
            .await?;
            LedgerRepository::record_payment_refund(&mut tx, &reversal.payment_id, reversal.amount, reversal.units)
                .await?;
        }

        if let Some(reason) = reason {
            let note = OrderNote::system(&order.id, format!("Order {to}: {}", validate_note(reason)?), now);
            OrderRepository::insert_note(&mut tx, &note).await?;
        }

        OrderRepository::update_state(&mut tx, &order, expected).await?;
        enqueue_all(&mut tx, &events).await?;
        tx.commit().await?;

        info!(order_id = %order.id, number = order.number, status = %order.status, "Order released");
        Ok(order)
    }

    /// Applies one status change on the caller's transaction: history row,
    /// system note, event, and the first-completion side effects.
    ///
    /// The caller holds the order's lock and, for completions, the
    /// customer's and loyalty account's locks.
    pub(crate) async fn move_to(
        &self,
        conn: &mut SqliteConnection,
        order: &mut Order,
        to: OrderStatus,
        now: DateTime<Utc>,
        events: &mut Vec<DomainEvent>,
    ) -> EngineResult<()> {
        let from = order
            .transition(to, now)
            .inspect_err(|e| warn!(order_id = %order.id, error = %e, "Transition rejected"))?;

        OrderRepository::record_status(
            conn,
            &StatusChange {
                order_id: order.id.clone(),
                from: Some(from),
                to,
                changed_at: now,
            },
        )
        .await?;
        let note = OrderNote::system(&order.id, format!("Order status changed from {from} to {to}."), now);
        OrderRepository::insert_note(conn, &note).await?;
        events.push(DomainEvent::OrderStatusChanged {
            order_id: order.id.clone(),
            number: order.number,
            from: Some(from),
            to,
        });

        if to == OrderStatus::Completed && !order.stats_recorded {
            if let Some(customer_id) = order.customer_id.clone() {
                CustomerRepository::record_completed_order(
                    conn,
                    &customer_id,
                    order.customer_email.as_deref(),
                    &order.id,
                    order.totals.total,
                    now,
                )
                .await?;

                let points = ledger::points_earned(order.totals.total, self.config.loyalty.points_per_currency_unit);
                if points > 0 {
                    let account =
                        LedgerRepository::ensure_account(conn, LedgerKind::LoyaltyPoints, &customer_id, None).await?;
                    append(conn, &account.id, points, LedgerReason::Earned, Some(&order.id), None, now).await?;
                }
                order.stats_recorded = true;
            }
        }

        info!(order_id = %order.id, number = order.number, from = %from, to = %to, "Order status changed");
        Ok(())
    }

    /// Locks a completion may write under.
    pub(crate) fn completion_locks(&self, customer_id: Option<&str>) -> Vec<Resource> {
        let Some(customer_id) = customer_id else {
            return Vec::new();
        };
        let mut resources = vec![Resource::Customer(customer_id.to_string())];
        if self.config.loyalty.points_per_currency_unit > 0 {
            resources.push(Resource::ledger(LedgerKind::LoyaltyPoints, customer_id));
        }
        resources
    }

    // =========================================================================
    // Notes and reads
    // =========================================================================

    pub async fn add_note(&self, order_id: &str, content: &str, is_customer_note: bool) -> EngineResult<OrderNote> {
        let content = validate_note(content)?;
        self.order(order_id).await?;

        let note = OrderNote {
            id: Uuid::new_v4().to_string(),
            order_id: order_id.to_string(),
            content,
            is_customer_note,
            system: false,
            created_at: Utc::now(),
        };
        let mut conn = self.db.pool().acquire().await?;
        OrderRepository::insert_note(&mut conn, &note).await?;
        Ok(note)
    }

    pub async fn order(&self, order_id: &str) -> EngineResult<Order> {
        self.db
            .orders()
            .get(order_id)
            .await?
            .ok_or_else(|| EngineError::not_found("order", order_id))
    }

    pub async fn order_by_number(&self, number: i64) -> EngineResult<Order> {
        self.db
            .orders()
            .get_by_number(number)
            .await?
            .ok_or_else(|| EngineError::not_found("order", number.to_string()))
    }

    pub async fn notes(&self, order_id: &str) -> EngineResult<Vec<OrderNote>> {
        Ok(self.db.orders().notes(order_id).await?)
    }

    pub async fn status_history(&self, order_id: &str) -> EngineResult<Vec<StatusChange>> {
        Ok(self.db.orders().status_history(order_id).await?)
    }

    pub async fn refunds(&self, order_id: &str) -> EngineResult<Vec<Refund>> {
        Ok(self.db.refunds().list(order_id).await?)
    }

    pub async fn customer(&self, customer_id: &str) -> EngineResult<Option<CustomerStats>> {
        Ok(self.db.customers().get(customer_id).await?)
    }

    /// A customer's most recent orders, newest first, without their items.
    pub async fn customer_orders(&self, customer_id: &str, limit: u32) -> EngineResult<Vec<Order>> {
        Ok(self.db.orders().list_for_customer(customer_id, limit).await?)
    }

    /// Deletes an order with its items and notes. Customer aggregates and
    /// coupon usages are kept.
    pub async fn delete_order(&self, order_id: &str) -> EngineResult<()> {
        let _locks = self.lock([Resource::Order(order_id.to_string())]).await?;
        self.db.orders().delete(order_id).await?;
        info!(order_id = %order_id, "Order deleted");
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Catalog view with stored stock in place of the catalog's snapshot.
struct StoredStock<'a> {
    inner: &'a dyn Catalog,
    stock: HashMap<String, InventoryRecord>,
}

impl Catalog for StoredStock<'_> {
    fn entry(&self, product_id: &str, variation_id: Option<&str>) -> Option<CatalogEntry> {
        let mut entry = self.inner.entry(product_id, variation_id)?;
        if let Some(stored) = self.stock.get(&entry.inventory.item_id) {
            entry.inventory = stored.clone();
        }
        Some(entry)
    }
}

/// Units per tracked stock record on an order's line items.
pub(crate) fn stock_units(order: &Order) -> BTreeMap<String, i64> {
    let mut units = BTreeMap::new();
    for item in order.line_items() {
        if let OrderItemDetail::LineItem {
            stock_item_id: Some(stock_item_id),
            quantity,
            ..
        } = &item.detail
        {
            *units.entry(stock_item_id.clone()).or_insert(0) += quantity;
        }
    }
    units
}

/// Puts `quantity` units back on a stored record.
pub(crate) async fn restock(conn: &mut SqliteConnection, item_id: &str, quantity: i64) -> EngineResult<()> {
    let mut record = InventoryRepository::find(conn, item_id)
        .await?
        .ok_or_else(|| EngineError::not_found("inventory_item", item_id))?;
    let expected = record.stock_quantity;
    let movement = record.restock(quantity);
    InventoryRepository::compare_and_swap(conn, &record, expected).await?;
    debug!(item_id = %item_id, previous = movement.previous, new = movement.new, "Stock restored");
    Ok(())
}

pub(crate) async fn enqueue_all(conn: &mut SqliteConnection, events: &[DomainEvent]) -> EngineResult<()> {
    for event in events {
        EventOutboxRepository::enqueue(conn, event).await?;
    }
    Ok(())
}
