//! # Event Outbox Repository
//!
//! Domain events waiting for delivery.
//!
//! ## The Outbox Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Outbox Pattern Implementation                        │
//! │                                                                         │
//! │  STATE CHANGE (e.g., settle)                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐    │
//! │  │                   SINGLE TRANSACTION                            │    │
//! │  │                                                                 │    │
//! │  │  1. INSERT INTO orders … / UPDATE coupons … / UPDATE inventory  │    │
//! │  │                                                                 │    │
//! │  │  2. INSERT INTO event_outbox (event_type, aggregate_id, payload)│    │
//! │  │                                                                 │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  COMMIT ← Both succeed or both fail                                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐    │
//! │  │            EVENT DISPATCHER (meridian-engine)                   │    │
//! │  │                                                                 │    │
//! │  │  1. get_pending(batch, max_attempts)                            │    │
//! │  │  2. For each entry:                                             │    │
//! │  │     a. Hand to the EventSink                                    │    │
//! │  │     b. On success: mark_delivered()                             │    │
//! │  │     c. On failure: mark_failed() → attempts += 1, last_error    │    │
//! │  │                                                                 │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! │                                                                         │
//! │  Delivery is at-least-once: a crash between the sink call and           │
//! │  mark_delivered() sends the event again.                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use meridian_core::event::DomainEvent;

/// One row of the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct OutboxEntry {
    pub id: String,
    pub event_type: String,
    pub aggregate_id: String,
    /// JSON of the [`DomainEvent`].
    pub payload: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    pub fn event(&self) -> DbResult<DomainEvent> {
        serde_json::from_str(&self.payload).map_err(|e| DbError::corrupted("event_outbox", &self.id, e.to_string()))
    }
}

/// Repository for outbox operations.
#[derive(Debug, Clone)]
pub struct EventOutboxRepository {
    pool: SqlitePool,
}

impl EventOutboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        EventOutboxRepository { pool }
    }

    /// Queues `event` on the caller's transaction.
    pub async fn enqueue(conn: &mut SqliteConnection, event: &DomainEvent) -> DbResult<OutboxEntry> {
        let entry = OutboxEntry {
            id: Uuid::new_v4().to_string(),
            event_type: event.event_type().to_string(),
            aggregate_id: event.aggregate_id().to_string(),
            payload: serde_json::to_string(event)?,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            attempted_at: None,
            delivered_at: None,
        };

        debug!(
            event_type = %entry.event_type,
            aggregate_id = %entry.aggregate_id,
            "Queuing event"
        );

        sqlx::query(
            r#"
            INSERT INTO event_outbox (
                id, event_type, aggregate_id, payload,
                attempts, last_error, created_at, attempted_at, delivered_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.event_type)
        .bind(&entry.aggregate_id)
        .bind(&entry.payload)
        .bind(entry.attempts)
        .bind(&entry.last_error)
        .bind(entry.created_at)
        .bind(entry.attempted_at)
        .bind(entry.delivered_at)
        .execute(&mut *conn)
        .await?;

        Ok(entry)
    }

    /// Undelivered entries with fewer than `max_attempts` attempts, oldest
    /// first.
    pub async fn get_pending(&self, limit: u32, max_attempts: u32) -> DbResult<Vec<OutboxEntry>> {
        let entries = sqlx::query_as::<_, OutboxEntry>(
            r#"
            SELECT id, event_type, aggregate_id, payload, attempts, last_error,
                   created_at, attempted_at, delivered_at
            FROM event_outbox
            WHERE delivered_at IS NULL AND attempts < ?2
            ORDER BY created_at ASC, rowid ASC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .bind(max_attempts)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    /// Every entry about one aggregate, oldest first.
    pub async fn for_aggregate(&self, aggregate_id: &str) -> DbResult<Vec<OutboxEntry>> {
        let entries = sqlx::query_as::<_, OutboxEntry>(
            r#"
            SELECT id, event_type, aggregate_id, payload, attempts, last_error,
                   created_at, attempted_at, delivered_at
            FROM event_outbox
            WHERE aggregate_id = ?1
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    pub async fn mark_delivered(&self, id: &str) -> DbResult<()> {
        let now = Utc::now();

        sqlx::query(
            r#"
            UPDATE event_outbox SET
                delivered_at = ?2,
                attempted_at = ?2,
                attempts = attempts + 1
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_failed(&self, id: &str, error: &str) -> DbResult<()> {
        let now = Utc::now();

        sqlx::query(
            r#"
            UPDATE event_outbox SET
                attempts = attempts + 1,
                last_error = ?2,
                attempted_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn count_pending(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM event_outbox WHERE delivered_at IS NULL")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Entries that ran out of attempts.
    pub async fn count_dead(&self, max_attempts: u32) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM event_outbox WHERE delivered_at IS NULL AND attempts >= ?1")
                .bind(max_attempts)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Deletes entries delivered more than `days_old` days ago.
    pub async fn cleanup_delivered(&self, days_old: u32) -> DbResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(days_old as i64);
        let result = sqlx::query(
            r#"
            DELETE FROM event_outbox
            WHERE delivered_at IS NOT NULL
            AND delivered_at < ?1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
