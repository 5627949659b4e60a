//! # Customer Repository
//!
//! Aggregate counters per customer. Updated only inside a settlement or
//! transition transaction that also holds the engine's lock on the
//! customer.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::DbResult;
use meridian_core::customer::CustomerStats;
use meridian_core::Money;

#[derive(Debug, FromRow)]
struct CustomerRow {
    id: String,
    email: Option<String>,
    orders_count: i64,
    total_spent: i64,
    average_order_value: i64,
    is_paying_customer: bool,
    last_order_id: Option<String>,
    last_order_at: Option<DateTime<Utc>>,
}

impl From<CustomerRow> for CustomerStats {
    fn from(row: CustomerRow) -> Self {
        CustomerStats {
            customer_id: row.id,
            email: row.email,
            orders_count: row.orders_count,
            total_spent: Money::from_units(row.total_spent),
            average_order_value: Money::from_units(row.average_order_value),
            is_paying_customer: row.is_paying_customer,
            last_order_id: row.last_order_id,
            last_order_at: row.last_order_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CustomerRepository {
    pool: SqlitePool,
}

impl CustomerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        CustomerRepository { pool }
    }

    pub async fn get(&self, customer_id: &str) -> DbResult<Option<CustomerStats>> {
        let mut conn = self.pool.acquire().await?;
        Self::find(&mut conn, customer_id).await
    }

    pub async fn find(conn: &mut SqliteConnection, customer_id: &str) -> DbResult<Option<CustomerStats>> {
        let row: Option<CustomerRow> = sqlx::query_as(
            r#"
            SELECT id, email, orders_count, total_spent, average_order_value,
                   is_paying_customer, last_order_id, last_order_at
            FROM customers
            WHERE id = ?1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.map(CustomerStats::from))
    }

    pub async fn save(conn: &mut SqliteConnection, stats: &CustomerStats) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO customers (
                id, email, orders_count, total_spent, average_order_value,
                is_paying_customer, last_order_id, last_order_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                email = COALESCE(excluded.email, customers.email),
                orders_count = excluded.orders_count,
                total_spent = excluded.total_spent,
                average_order_value = excluded.average_order_value,
                is_paying_customer = excluded.is_paying_customer,
                last_order_id = excluded.last_order_id,
                last_order_at = excluded.last_order_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&stats.customer_id)
        .bind(&stats.email)
        .bind(stats.orders_count)
        .bind(stats.total_spent.units())
        .bind(stats.average_order_value.units())
        .bind(stats.is_paying_customer)
        .bind(&stats.last_order_id)
        .bind(stats.last_order_at)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Folds one completed order into the customer's aggregates and
    /// returns the new values.
    ///
    /// The read and the write run on the caller's transaction; the caller
    /// must also hold the customer's lock.
    pub async fn record_completed_order(
        conn: &mut SqliteConnection,
        customer_id: &str,
        email: Option<&str>,
        order_id: &str,
        total: Money,
        at: DateTime<Utc>,
    ) -> DbResult<CustomerStats> {
        let mut stats = Self::find(conn, customer_id)
            .await?
            .unwrap_or_else(|| CustomerStats::new(customer_id));
        if stats.email.is_none() {
            stats.email = email.map(str::to_string);
        }
        stats.record_completed_order(order_id, total, at);
        Self::save(conn, &stats).await?;

        debug!(
            customer_id = %customer_id,
            orders_count = stats.orders_count,
            total_spent = %stats.total_spent,
            "Customer aggregates updated"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};

    #[tokio::test]
    async fn test_record_completed_orders() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();

        CustomerRepository::record_completed_order(
            &mut conn,
            "cust-1",
            Some("ada@example.com"),
            "o-1",
            "27.00".parse().unwrap(),
            Utc::now(),
        )
        .await
        .unwrap();
        let stats = CustomerRepository::record_completed_order(
            &mut conn,
            "cust-1",
            None,
            "o-2",
            "21.60".parse().unwrap(),
            Utc::now(),
        )
        .await
        .unwrap();
        drop(conn);

        assert_eq!(stats.orders_count, 2);
        let stored = db.customers().get("cust-1").await.unwrap().unwrap();
        assert_eq!(stored.last_order_id.as_deref(), Some("o-2"));
        assert_eq!(stored.total_spent, "48.60".parse::<Money>().unwrap());
        assert_eq!(stored.average_order_value, "24.30".parse::<Money>().unwrap());
        assert_eq!(stored.email.as_deref(), Some("ada@example.com"));
        assert!(stored.is_paying_customer);
    }
}
