//! # Order Number Sequence
//!
//! Monotonic, gap-tolerant order numbers.
//!
//! ```text
//!   settle #1 ── next("orders") → 1041 ── commit ✓
//!   settle #2 ── next("orders") → 1042 ── rollback ✗   (1042 is burnt)
//!   settle #3 ── next("orders") → 1043 ── commit ✓
//! ```
//!
//! `next` runs in its own short statement, outside the settlement
//! transaction, so a rollback cannot hand the same number out twice.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};

/// Sequence used for order numbers.
pub const ORDER_SEQUENCE: &str = "orders";

#[derive(Debug, Clone)]
pub struct SequenceRepository {
    pool: SqlitePool,
}

impl SequenceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SequenceRepository { pool }
    }

    /// Takes the next value of `name`, committing immediately.
    pub async fn next(&self, name: &str) -> DbResult<i64> {
        let mut conn = self.pool.acquire().await?;
        Self::next_on(&mut conn, name).await
    }

    /// Takes the next value of `name` on `conn`.
    ///
    /// Creates the sequence at 1 if it does not exist yet.
    pub async fn next_on(conn: &mut SqliteConnection, name: &str) -> DbResult<i64> {
        sqlx::query("INSERT OR IGNORE INTO order_number_sequences (name, next_value) VALUES (?1, 1)")
            .bind(name)
            .execute(&mut *conn)
            .await?;

        let value: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE order_number_sequences
            SET next_value = next_value + 1
            WHERE name = ?1
            RETURNING next_value - 1
            "#,
        )
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;

        let value = value.ok_or_else(|| DbError::not_found("sequence", name))?;
        debug!(sequence = %name, value, "Allocated sequence value");
        Ok(value)
    }

    /// Moves `name` forward so the next value is at least `start`.
    ///
    /// Never moves a sequence backwards.
    pub async fn ensure_at_least(&self, name: &str, start: i64) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO order_number_sequences (name, next_value) VALUES (?1, ?2)
            ON CONFLICT(name) DO UPDATE SET next_value = MAX(next_value, excluded.next_value)
            "#,
        )
        .bind(name)
        .bind(start)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};

    #[tokio::test]
    async fn test_next_is_monotonic() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let seq = db.sequences();

        assert_eq!(seq.next(ORDER_SEQUENCE).await.unwrap(), 1);
        assert_eq!(seq.next(ORDER_SEQUENCE).await.unwrap(), 2);
        assert_eq!(seq.next("invoices").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rolled_back_number_is_not_reused() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let first = db.sequences().next(ORDER_SEQUENCE).await.unwrap();

        {
            // aborted settlement between two allocations
            let mut tx = db.begin().await.unwrap();
            sqlx::query("SELECT 1").execute(&mut *tx).await.unwrap();
        }

        let second = db.sequences().next(ORDER_SEQUENCE).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_ensure_at_least() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let seq = db.sequences();

        seq.ensure_at_least(ORDER_SEQUENCE, 1000).await.unwrap();
        assert_eq!(seq.next(ORDER_SEQUENCE).await.unwrap(), 1000);

        seq.ensure_at_least(ORDER_SEQUENCE, 10).await.unwrap();
        assert_eq!(seq.next(ORDER_SEQUENCE).await.unwrap(), 1001);
    }
}
