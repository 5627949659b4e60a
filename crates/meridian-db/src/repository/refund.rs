//! # Refund Repository
//!
//! Refunds and their per-item rows. Cumulative checks happen in
//! `meridian_core::refund::plan_refund` against [`RefundRepository::for_order`]
//! read inside the same locked transaction that writes the new refund.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::DbResult;
use meridian_core::refund::{Refund, RefundItem};
use meridian_core::Money;

#[derive(Debug, FromRow)]
struct RefundRow {
    id: String,
    order_id: String,
    amount: i64,
    reason: Option<String>,
    restocked: bool,
    created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct RefundItemRow {
    id: String,
    refund_id: String,
    order_item_id: String,
    quantity: i64,
    amount: i64,
}

impl From<RefundItemRow> for RefundItem {
    fn from(row: RefundItemRow) -> Self {
        RefundItem {
            id: row.id,
            refund_id: row.refund_id,
            order_item_id: row.order_item_id,
            quantity: row.quantity,
            amount: Money::from_units(row.amount),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefundRepository {
    pool: SqlitePool,
}

impl RefundRepository {
    pub fn new(pool: SqlitePool) -> Self {
        RefundRepository { pool }
    }

    /// Refunds of an order, oldest first.
    pub async fn list(&self, order_id: &str) -> DbResult<Vec<Refund>> {
        let mut conn = self.pool.acquire().await?;
        Self::for_order(&mut conn, order_id).await
    }

    pub async fn for_order(conn: &mut SqliteConnection, order_id: &str) -> DbResult<Vec<Refund>> {
        let rows: Vec<RefundRow> = sqlx::query_as(
            r#"
            SELECT id, order_id, amount, reason, restocked, created_at
            FROM refunds
            WHERE order_id = ?1
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(&mut *conn)
        .await?;

        let items: Vec<RefundItemRow> = sqlx::query_as(
            r#"
            SELECT ri.id, ri.refund_id, ri.order_item_id, ri.quantity, ri.amount
            FROM refund_items ri
            JOIN refunds r ON r.id = ri.refund_id
            WHERE r.order_id = ?1
            ORDER BY ri.rowid ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut refunds: Vec<Refund> = rows
            .into_iter()
            .map(|r| Refund {
                id: r.id,
                order_id: r.order_id,
                amount: Money::from_units(r.amount),
                reason: r.reason,
                restocked: r.restocked,
                created_at: r.created_at,
                items: Vec::new(),
            })
            .collect();

        for item in items {
            if let Some(refund) = refunds.iter_mut().find(|r| r.id == item.refund_id) {
                refund.items.push(item.into());
            }
        }
        Ok(refunds)
    }

    pub async fn insert(conn: &mut SqliteConnection, refund: &Refund) -> DbResult<()> {
        debug!(refund_id = %refund.id, order_id = %refund.order_id, amount = %refund.amount, "Inserting refund");

        sqlx::query(
            r#"
            INSERT INTO refunds (id, order_id, amount, reason, restocked, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&refund.id)
        .bind(&refund.order_id)
        .bind(refund.amount.units())
        .bind(&refund.reason)
        .bind(refund.restocked)
        .bind(refund.created_at)
        .execute(&mut *conn)
        .await?;

        for item in &refund.items {
            sqlx::query(
                r#"
                INSERT INTO refund_items (id, refund_id, order_item_id, quantity, amount)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(&item.id)
            .bind(&item.refund_id)
            .bind(&item.order_item_id)
            .bind(item.quantity)
            .bind(item.amount.units())
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::order::tests::sample_order;
    use crate::repository::order::OrderRepository;
    use crate::{Database, DbConfig};
    use meridian_core::refund::RefundHistory;

    #[tokio::test]
    async fn test_insert_and_history() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let order = sample_order(1);
        let line_id = order.items[0].id.clone();

        let refund = |n: u8| {
            let id = format!("r-{n}");
            Refund {
                id: id.clone(),
                order_id: order.id.clone(),
                amount: "10.80".parse().unwrap(),
                reason: Some("damaged".to_string()),
                restocked: true,
                created_at: Utc::now(),
                items: vec![RefundItem {
                    id: format!("ri-{n}"),
                    refund_id: id,
                    order_item_id: line_id.clone(),
                    quantity: 1,
                    amount: "10.80".parse().unwrap(),
                }],
            }
        };

        let mut conn = db.pool().acquire().await.unwrap();
        OrderRepository::insert(&mut conn, &order).await.unwrap();
        RefundRepository::insert(&mut conn, &refund(1)).await.unwrap();
        RefundRepository::insert(&mut conn, &refund(2)).await.unwrap();
        drop(conn);

        let refunds = db.refunds().list(&order.id).await.unwrap();
        assert_eq!(refunds.len(), 2);
        assert_eq!(refunds[0].items.len(), 1);

        let history = RefundHistory::from_refunds(&refunds);
        assert_eq!(history.for_item(&line_id), (2, "21.60".parse::<Money>().unwrap()));
        assert_eq!(history.total(), "21.60".parse::<Money>().unwrap());
    }
}
