//! # Order Repository
//!
//! Orders, their items, notes and status history.
//!
//! ## Order Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Order Lifecycle                                   │
//! │                                                                         │
//! │  1. SETTLE (one transaction)                                            │
//! │     └── insert() → orders row + every order_items row                   │
//! │     └── record_status() / insert_note() per transition                  │
//! │                                                                         │
//! │  2. TRANSITION                                                          │
//! │     └── update_state(expected) → compare-and-swap on status             │
//! │                                                                         │
//! │  3. REFUND                                                              │
//! │     └── refunds / refund_items (see refund.rs)                          │
//! │                                                                         │
//! │  4. (OPTIONAL) DELETE                                                   │
//! │     └── delete() → items, notes, history, refunds cascade               │
//! │         customers and coupon usages survive                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Item Storage
//! Every item kind shares `order_items`. The full tagged detail is stored as
//! JSON; product, quantity and totals are duplicated into columns so they
//! can be queried without parsing.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use meridian_core::order::{OrderItem, OrderItemDetail, OrderItemKind, OrderNote, OrderTotals, StatusChange};
use meridian_core::{Jurisdiction, Money, Order, OrderStatus};

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug, FromRow)]
struct OrderRow {
    id: String,
    number: i64,
    quote_id: String,
    status: OrderStatus,
    currency: String,
    prices_include_tax: bool,
    customer_id: Option<String>,
    customer_email: Option<String>,
    billing_country: String,
    billing_state: String,
    billing_postcode: String,
    billing_city: String,
    subtotal: i64,
    discount_total: i64,
    discount_tax: i64,
    shipping_total: i64,
    shipping_tax: i64,
    fee_total: i64,
    cart_tax: i64,
    total_tax: i64,
    total: i64,
    payment_method: Option<String>,
    gateway_transaction_id: Option<String>,
    stock_reduced: bool,
    stats_recorded: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl OrderRow {
    fn into_order(self, items: Vec<OrderItem>) -> Order {
        Order {
            id: self.id,
            number: self.number,
            quote_id: self.quote_id,
            status: self.status,
            currency: self.currency,
            prices_include_tax: self.prices_include_tax,
            customer_id: self.customer_id,
            customer_email: self.customer_email,
            billing: Jurisdiction::new(
                self.billing_country,
                self.billing_state,
                self.billing_postcode,
                self.billing_city,
            ),
            totals: OrderTotals {
                subtotal: Money::from_units(self.subtotal),
                discount_total: Money::from_units(self.discount_total),
                discount_tax: Money::from_units(self.discount_tax),
                shipping_total: Money::from_units(self.shipping_total),
                shipping_tax: Money::from_units(self.shipping_tax),
                fee_total: Money::from_units(self.fee_total),
                cart_tax: Money::from_units(self.cart_tax),
                total_tax: Money::from_units(self.total_tax),
                total: Money::from_units(self.total),
            },
            payment_method: self.payment_method,
            gateway_transaction_id: self.gateway_transaction_id,
            stock_reduced: self.stock_reduced,
            stats_recorded: self.stats_recorded,
            created_at: self.created_at,
            updated_at: self.updated_at,
            paid_at: self.paid_at,
            completed_at: self.completed_at,
            items,
        }
    }
}

#[derive(Debug, FromRow)]
struct OrderItemRow {
    id: String,
    order_id: String,
    position: i64,
    name: String,
    detail: String,
}

impl OrderItemRow {
    fn into_item(self) -> DbResult<OrderItem> {
        let detail: OrderItemDetail = serde_json::from_str(&self.detail)
            .map_err(|e| DbError::corrupted("order_item", &self.id, e.to_string()))?;
        Ok(OrderItem {
            id: self.id,
            order_id: self.order_id,
            position: self.position,
            name: self.name,
            detail,
        })
    }
}

#[derive(Debug, FromRow)]
struct NoteRow {
    id: String,
    order_id: String,
    content: String,
    is_customer_note: bool,
    system: bool,
    created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct HistoryRow {
    order_id: String,
    from_status: Option<OrderStatus>,
    to_status: OrderStatus,
    changed_at: DateTime<Utc>,
}

/// Columns duplicated out of the item detail.
struct ItemColumns<'a> {
    product_id: Option<&'a str>,
    variation_id: Option<&'a str>,
    stock_item_id: Option<&'a str>,
    quantity: Option<i64>,
    total: Money,
    total_tax: Money,
}

fn item_columns(detail: &OrderItemDetail) -> ItemColumns<'_> {
    match detail {
        OrderItemDetail::LineItem {
            product_id,
            variation_id,
            stock_item_id,
            quantity,
            total,
            total_tax,
            ..
        } => ItemColumns {
            product_id: Some(product_id),
            variation_id: variation_id.as_deref(),
            stock_item_id: stock_item_id.as_deref(),
            quantity: Some(*quantity),
            total: *total,
            total_tax: *total_tax,
        },
        OrderItemDetail::Shipping { total, total_tax, .. } | OrderItemDetail::Fee { total, total_tax, .. } => {
            ItemColumns {
                product_id: None,
                variation_id: None,
                stock_item_id: None,
                quantity: None,
                total: *total,
                total_tax: *total_tax,
            }
        }
        OrderItemDetail::Tax {
            tax_amount,
            shipping_tax_amount,
            ..
        } => ItemColumns {
            product_id: None,
            variation_id: None,
            stock_item_id: None,
            quantity: None,
            total: Money::ZERO,
            total_tax: *tax_amount + *shipping_tax_amount,
        },
        OrderItemDetail::Coupon {
            discount, discount_tax, ..
        } => ItemColumns {
            product_id: None,
            variation_id: None,
            stock_item_id: None,
            quantity: None,
            total: *discount,
            total_tax: *discount_tax,
        },
    }
}

const ORDER_COLUMNS: &str = r#"
    id, number, quote_id, status, currency, prices_include_tax,
    customer_id, customer_email,
    billing_country, billing_state, billing_postcode, billing_city,
    subtotal, discount_total, discount_tax, shipping_total, shipping_tax,
    fee_total, cart_tax, total_tax, total,
    payment_method, gateway_transaction_id, stock_reduced, stats_recorded,
    created_at, updated_at, paid_at, completed_at
"#;

// =============================================================================
// Repository
// =============================================================================

/// Repository for orders.
///
/// Methods on `&self` use the pool; associated functions taking a
/// `SqliteConnection` compose inside a caller's transaction.
#[derive(Debug, Clone)]
pub struct OrderRepository {
    pool: SqlitePool,
}

impl OrderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        OrderRepository { pool }
    }

    /// Gets an order with its items.
    pub async fn get(&self, id: &str) -> DbResult<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        Self::find(&mut conn, id).await
    }

    pub async fn get_by_number(&self, number: i64) -> DbResult<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE number = ?1");
        let row: Option<OrderRow> = sqlx::query_as(&sql).bind(number).fetch_optional(&mut *conn).await?;
        match row {
            Some(row) => {
                let items = Self::items(&mut conn, &row.id).await?;
                Ok(Some(row.into_order(items)))
            }
            None => Ok(None),
        }
    }

    pub async fn get_by_quote(&self, quote_id: &str) -> DbResult<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        Self::find_by_quote(&mut conn, quote_id).await
    }

    /// Orders of one customer, newest first. Items are not loaded.
    pub async fn list_for_customer(&self, customer_id: &str, limit: u32) -> DbResult<Vec<Order>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE customer_id = ?1 ORDER BY number DESC LIMIT ?2"
        );
        let rows: Vec<OrderRow> = sqlx::query_as(&sql)
            .bind(customer_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.into_order(Vec::new())).collect())
    }

    pub async fn notes(&self, order_id: &str) -> DbResult<Vec<OrderNote>> {
        let rows: Vec<NoteRow> = sqlx::query_as(
            r#"
            SELECT id, order_id, content, is_customer_note, system, created_at
            FROM order_notes
            WHERE order_id = ?1
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| OrderNote {
                id: r.id,
                order_id: r.order_id,
                content: r.content,
                is_customer_note: r.is_customer_note,
                system: r.system,
                created_at: r.created_at,
            })
            .collect())
    }

    pub async fn status_history(&self, order_id: &str) -> DbResult<Vec<StatusChange>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            r#"
            SELECT order_id, from_status, to_status, changed_at
            FROM order_status_history
            WHERE order_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| StatusChange {
                order_id: r.order_id,
                from: r.from_status,
                to: r.to_status,
                changed_at: r.changed_at,
            })
            .collect())
    }

    /// Deletes an order. Items, notes, history and refunds go with it;
    /// coupon usages keep their row with the order reference cleared.
    pub async fn delete(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM orders WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("order", id));
        }
        debug!(order_id = %id, "Deleted order");
        Ok(())
    }

    // =========================================================================
    // Transactional operations
    // =========================================================================

    pub async fn find(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1");
        let row: Option<OrderRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&mut *conn).await?;
        match row {
            Some(row) => {
                let items = Self::items(conn, id).await?;
                Ok(Some(row.into_order(items)))
            }
            None => Ok(None),
        }
    }

    pub async fn find_by_quote(conn: &mut SqliteConnection, quote_id: &str) -> DbResult<Option<Order>> {
        let id: Option<String> = sqlx::query_scalar("SELECT id FROM orders WHERE quote_id = ?1")
            .bind(quote_id)
            .fetch_optional(&mut *conn)
            .await?;
        match id {
            Some(id) => Self::find(conn, &id).await,
            None => Ok(None),
        }
    }

    pub async fn items(conn: &mut SqliteConnection, order_id: &str) -> DbResult<Vec<OrderItem>> {
        let rows: Vec<OrderItemRow> = sqlx::query_as(
            r#"
            SELECT id, order_id, position, name, detail
            FROM order_items
            WHERE order_id = ?1
            ORDER BY position ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(&mut *conn)
        .await?;

        rows.into_iter().map(OrderItemRow::into_item).collect()
    }

    /// Inserts the order row and all of its items.
    ///
    /// A second order for the same quote fails with a UNIQUE violation on
    /// `orders.quote_id`.
    pub async fn insert(conn: &mut SqliteConnection, order: &Order) -> DbResult<()> {
        debug!(order_id = %order.id, number = order.number, "Inserting order");

        let t = &order.totals;
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, number, quote_id, status, currency, prices_include_tax,
                customer_id, customer_email,
                billing_country, billing_state, billing_postcode, billing_city,
                subtotal, discount_total, discount_tax, shipping_total, shipping_tax,
                fee_total, cart_tax, total_tax, total,
                payment_method, gateway_transaction_id, stock_reduced, stats_recorded,
                created_at, updated_at, paid_at, completed_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6,
                ?7, ?8,
                ?9, ?10, ?11, ?12,
                ?13, ?14, ?15, ?16, ?17,
                ?18, ?19, ?20, ?21,
                ?22, ?23, ?24, ?25,
                ?26, ?27, ?28, ?29
            )
            "#,
        )
        .bind(&order.id)
        .bind(order.number)
        .bind(&order.quote_id)
        .bind(order.status)
        .bind(&order.currency)
        .bind(order.prices_include_tax)
        .bind(&order.customer_id)
        .bind(&order.customer_email)
        .bind(&order.billing.country)
        .bind(&order.billing.state)
        .bind(&order.billing.postcode)
        .bind(&order.billing.city)
        .bind(t.subtotal.units())
        .bind(t.discount_total.units())
        .bind(t.discount_tax.units())
        .bind(t.shipping_total.units())
        .bind(t.shipping_tax.units())
        .bind(t.fee_total.units())
        .bind(t.cart_tax.units())
        .bind(t.total_tax.units())
        .bind(t.total.units())
        .bind(&order.payment_method)
        .bind(&order.gateway_transaction_id)
        .bind(order.stock_reduced)
        .bind(order.stats_recorded)
        .bind(order.created_at)
        .bind(order.updated_at)
        .bind(order.paid_at)
        .bind(order.completed_at)
        .execute(&mut *conn)
        .await?;

        for item in &order.items {
            Self::insert_item(conn, item).await?;
        }
        Ok(())
    }

    async fn insert_item(conn: &mut SqliteConnection, item: &OrderItem) -> DbResult<()> {
        let columns = item_columns(&item.detail);
        let detail = serde_json::to_string(&item.detail)?;
        let kind: OrderItemKind = item.kind();

        sqlx::query(
            r#"
            INSERT INTO order_items (
                id, order_id, position, kind, name,
                product_id, variation_id, stock_item_id, quantity,
                total, total_tax, detail
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&item.id)
        .bind(&item.order_id)
        .bind(item.position)
        .bind(kind)
        .bind(&item.name)
        .bind(columns.product_id)
        .bind(columns.variation_id)
        .bind(columns.stock_item_id)
        .bind(columns.quantity)
        .bind(columns.total.units())
        .bind(columns.total_tax.units())
        .bind(detail)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Writes the mutable parts of an order (status, flags, payment
    /// reference, timestamps) if its stored status is still `expected`.
    ///
    /// Fails with [`DbError::Conflict`] when another writer moved the order.
    pub async fn update_state(conn: &mut SqliteConnection, order: &Order, expected: OrderStatus) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET
                status = ?2,
                payment_method = ?3,
                gateway_transaction_id = ?4,
                stock_reduced = ?5,
                stats_recorded = ?6,
                updated_at = ?7,
                paid_at = ?8,
                completed_at = ?9
            WHERE id = ?1 AND status = ?10
            "#,
        )
        .bind(&order.id)
        .bind(order.status)
        .bind(&order.payment_method)
        .bind(&order.gateway_transaction_id)
        .bind(order.stock_reduced)
        .bind(order.stats_recorded)
        .bind(order.updated_at)
        .bind(order.paid_at)
        .bind(order.completed_at)
        .bind(expected)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::conflict("order", &order.id));
        }
        Ok(())
    }

    pub async fn record_status(conn: &mut SqliteConnection, change: &StatusChange) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO order_status_history (order_id, from_status, to_status, changed_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(&change.order_id)
        .bind(change.from)
        .bind(change.to)
        .bind(change.changed_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn insert_note(conn: &mut SqliteConnection, note: &OrderNote) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO order_notes (id, order_id, content, is_customer_note, system, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&note.id)
        .bind(&note.order_id)
        .bind(&note.content)
        .bind(note.is_customer_note)
        .bind(note.system)
        .bind(note.created_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use meridian_core::rate::Rate;
    use meridian_core::tax::TaxLine;
    use uuid::Uuid;

    fn m(s: &str) -> Money {
        s.parse().unwrap()
    }

    /// Order from the 27.00 checkout: 2 × 10.00 at 8%, 5.00 shipping.
    pub(crate) fn sample_order(number: i64) -> Order {
        let id = Uuid::new_v4().to_string();
        let tax = |amount: &str| TaxLine {
            rate_id: "us".to_string(),
            label: "Tax".to_string(),
            rate: Rate::from_percent(8),
            compound: false,
            amount: m(amount),
        };
        let item = |position: i64, name: &str, detail: OrderItemDetail| OrderItem {
            id: Uuid::new_v4().to_string(),
            order_id: id.clone(),
            position,
            name: name.to_string(),
            detail,
        };
        let items = vec![
            item(
                0,
                "Mug",
                OrderItemDetail::LineItem {
                    product_id: "mug".to_string(),
                    variation_id: None,
                    stock_item_id: Some("mug".to_string()),
                    sku: Some("MUG-1".to_string()),
                    quantity: 2,
                    unit_price: m("10.00"),
                    tax_class: "standard".to_string(),
                    subtotal: m("20.00"),
                    subtotal_tax: m("1.60"),
                    total: m("20.00"),
                    total_tax: m("1.60"),
                    taxes: vec![tax("1.60")],
                },
            ),
            item(
                1,
                "Flat rate",
                OrderItemDetail::Shipping {
                    method_id: "flat_rate".to_string(),
                    total: m("5.00"),
                    total_tax: m("0.40"),
                    taxes: vec![tax("0.40")],
                },
            ),
            item(
                2,
                "Tax",
                OrderItemDetail::Tax {
                    rate_id: "us".to_string(),
                    label: "Tax".to_string(),
                    rate: Rate::from_percent(8),
                    compound: false,
                    tax_amount: m("1.60"),
                    shipping_tax_amount: m("0.40"),
                },
            ),
        ];
        let now = Utc::now();
        Order {
            id: id.clone(),
            number,
            quote_id: Uuid::new_v4().to_string(),
            status: OrderStatus::Pending,
            currency: "USD".to_string(),
            prices_include_tax: false,
            customer_id: Some("cust-1".to_string()),
            customer_email: Some("ada@example.com".to_string()),
            billing: Jurisdiction::country("US"),
            totals: OrderTotals::derive(&items),
            payment_method: None,
            gateway_transaction_id: None,
            stock_reduced: false,
            stats_recorded: false,
            created_at: now,
            updated_at: now,
            paid_at: None,
            completed_at: None,
            items,
        }
    }

    #[tokio::test]
    async fn test_insert_and_load_round_trip() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let order = sample_order(1041);

        let mut tx = db.begin().await.unwrap();
        OrderRepository::insert(&mut tx, &order).await.unwrap();
        tx.commit().await.unwrap();

        let loaded = db.orders().get(&order.id).await.unwrap().unwrap();
        assert_eq!(loaded.number, 1041);
        assert_eq!(loaded.totals.total, m("27.00"));
        assert_eq!(loaded.items, order.items);
        loaded.verify_totals().unwrap();

        let by_number = db.orders().get_by_number(1041).await.unwrap().unwrap();
        assert_eq!(by_number.id, order.id);
        let by_quote = db.orders().get_by_quote(&order.quote_id).await.unwrap().unwrap();
        assert_eq!(by_quote.id, order.id);
    }

    #[tokio::test]
    async fn test_duplicate_quote_is_rejected() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let order = sample_order(1);
        let mut again = sample_order(2);
        again.quote_id = order.quote_id.clone();

        let mut conn = db.pool().acquire().await.unwrap();
        OrderRepository::insert(&mut conn, &order).await.unwrap();
        let err = OrderRepository::insert(&mut conn, &again).await.unwrap_err();
        assert!(err.is_unique_violation_on("orders.quote_id"));
    }

    #[tokio::test]
    async fn test_update_state_is_compare_and_swap() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut order = sample_order(1);
        let mut conn = db.pool().acquire().await.unwrap();
        OrderRepository::insert(&mut conn, &order).await.unwrap();

        order.transition(OrderStatus::Processing, Utc::now()).unwrap();
        OrderRepository::update_state(&mut conn, &order, OrderStatus::Pending).await.unwrap();

        // stale writer still believes the order is pending
        let err = OrderRepository::update_state(&mut conn, &order, OrderStatus::Pending).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_notes_and_history() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let order = sample_order(1);
        let now = Utc::now();
        let mut conn = db.pool().acquire().await.unwrap();
        OrderRepository::insert(&mut conn, &order).await.unwrap();
        OrderRepository::insert_note(&mut conn, &OrderNote::system(&order.id, "Order created.", now))
            .await
            .unwrap();
        OrderRepository::record_status(
            &mut conn,
            &StatusChange {
                order_id: order.id.clone(),
                from: None,
                to: OrderStatus::Pending,
                changed_at: now,
            },
        )
        .await
        .unwrap();
        drop(conn);

        let notes = db.orders().notes(&order.id).await.unwrap();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].system);

        let history = db.orders().status_history(&order.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from, None);
        assert_eq!(history[0].to, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_delete_cascades_items_and_notes() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let order = sample_order(1);
        let mut conn = db.pool().acquire().await.unwrap();
        OrderRepository::insert(&mut conn, &order).await.unwrap();
        OrderRepository::insert_note(&mut conn, &OrderNote::system(&order.id, "hello", Utc::now()))
            .await
            .unwrap();
        drop(conn);

        db.orders().delete(&order.id).await.unwrap();

        let items: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM order_items")
            .fetch_one(db.pool())
            .await
            .unwrap();
        let notes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM order_notes")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!((items, notes), (0, 0));
        assert!(matches!(db.orders().delete(&order.id).await, Err(DbError::NotFound { .. })));
    }
}
