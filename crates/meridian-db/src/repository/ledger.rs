//! # Ledger Repository
//!
//! Balance accounts, their append-only entries, and the balance payments
//! recorded against orders.
//!
//! ## Append
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  one transaction, account locked by the engine                         │
//! │                                                                         │
//! │  1. tip(account)            ← last entry by sequence                    │
//! │  2. next_entry(tip, amount) ← chain + overdraft check (meridian-core)   │
//! │  3. insert_entry()          ← UNIQUE(account_id, sequence)              │
//! │  4. set_balance(expected)   ← compare-and-swap on accounts.balance      │
//! │                                                                         │
//! │  balance is never written without the entry that explains it           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use meridian_core::ledger::{BalancePayment, LedgerAccount, LedgerEntry, LedgerKind, LedgerReason};
use meridian_core::Money;

#[derive(Debug, FromRow)]
struct AccountRow {
    id: String,
    kind: LedgerKind,
    owner: String,
    balance: i64,
    active: bool,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AccountRow> for LedgerAccount {
    fn from(row: AccountRow) -> Self {
        LedgerAccount {
            id: row.id,
            kind: row.kind,
            owner: row.owner,
            balance: row.balance,
            active: row.active,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct EntryRow {
    id: String,
    account_id: String,
    sequence: i64,
    amount: i64,
    balance_after: i64,
    reason: LedgerReason,
    order_id: Option<String>,
    refund_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<EntryRow> for LedgerEntry {
    fn from(row: EntryRow) -> Self {
        LedgerEntry {
            id: row.id,
            account_id: row.account_id,
            sequence: row.sequence,
            amount: row.amount,
            balance_after: row.balance_after,
            reason: row.reason,
            order_id: row.order_id,
            refund_id: row.refund_id,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct PaymentRow {
    id: String,
    order_id: String,
    account_id: String,
    kind: LedgerKind,
    amount: i64,
    units: i64,
    refunded_amount: i64,
    refunded_units: i64,
}

impl From<PaymentRow> for BalancePayment {
    fn from(row: PaymentRow) -> Self {
        BalancePayment {
            id: row.id,
            order_id: row.order_id,
            account_id: row.account_id,
            kind: row.kind,
            amount: Money::from_units(row.amount),
            units: row.units,
            refunded_amount: Money::from_units(row.refunded_amount),
            refunded_units: row.refunded_units,
        }
    }
}

const ACCOUNT_COLUMNS: &str = "id, kind, owner, balance, active, expires_at, created_at, updated_at";
const ENTRY_COLUMNS: &str =
    "id, account_id, sequence, amount, balance_after, reason, order_id, refund_id, created_at";

/// Repository for balance ledgers.
#[derive(Debug, Clone)]
pub struct LedgerRepository {
    pool: SqlitePool,
}

impl LedgerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        LedgerRepository { pool }
    }

    pub async fn get_account(&self, kind: LedgerKind, owner: &str) -> DbResult<Option<LedgerAccount>> {
        let mut conn = self.pool.acquire().await?;
        Self::find_account(&mut conn, kind, owner).await
    }

    pub async fn get_account_by_id(&self, id: &str) -> DbResult<Option<LedgerAccount>> {
        let mut conn = self.pool.acquire().await?;
        Self::find_account_by_id(&mut conn, id).await
    }

    /// All entries of an account in commit order.
    pub async fn entries(&self, account_id: &str) -> DbResult<Vec<LedgerEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE account_id = ?1 ORDER BY sequence ASC");
        let rows: Vec<EntryRow> = sqlx::query_as(&sql).bind(account_id).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(LedgerEntry::from).collect())
    }

    /// Activates or deactivates an account (gift card blocking).
    pub async fn set_active(&self, account_id: &str, active: bool) -> DbResult<()> {
        let result = sqlx::query("UPDATE ledger_accounts SET active = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(account_id)
            .bind(active)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("ledger_account", account_id));
        }
        Ok(())
    }

    pub async fn payments_for(&self, order_id: &str) -> DbResult<Vec<BalancePayment>> {
        let mut conn = self.pool.acquire().await?;
        Self::payments_for_order(&mut conn, order_id).await
    }

    // =========================================================================
    // Transactional operations
    // =========================================================================

    pub async fn find_account(
        conn: &mut SqliteConnection,
        kind: LedgerKind,
        owner: &str,
    ) -> DbResult<Option<LedgerAccount>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM ledger_accounts WHERE kind = ?1 AND owner = ?2");
        let row: Option<AccountRow> = sqlx::query_as(&sql)
            .bind(kind)
            .bind(owner)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.map(LedgerAccount::from))
    }

    pub async fn find_account_by_id(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<LedgerAccount>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM ledger_accounts WHERE id = ?1");
        let row: Option<AccountRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&mut *conn).await?;
        Ok(row.map(LedgerAccount::from))
    }

    /// Returns the `(kind, owner)` account, creating an empty one if needed.
    pub async fn ensure_account(
        conn: &mut SqliteConnection,
        kind: LedgerKind,
        owner: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> DbResult<LedgerAccount> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO ledger_accounts (id, kind, owner, balance, active, expires_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, 0, 1, ?4, ?5, ?5)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(kind)
        .bind(owner)
        .bind(expires_at)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Self::find_account(conn, kind, owner)
            .await?
            .ok_or_else(|| DbError::not_found("ledger_account", owner))
    }

    /// The last entry of an account.
    pub async fn tip(conn: &mut SqliteConnection, account_id: &str) -> DbResult<Option<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE account_id = ?1 ORDER BY sequence DESC LIMIT 1"
        );
        let row: Option<EntryRow> = sqlx::query_as(&sql).bind(account_id).fetch_optional(&mut *conn).await?;
        Ok(row.map(LedgerEntry::from))
    }

    pub async fn insert_entry(conn: &mut SqliteConnection, entry: &LedgerEntry) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                id, account_id, sequence, amount, balance_after, reason, order_id, refund_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.account_id)
        .bind(entry.sequence)
        .bind(entry.amount)
        .bind(entry.balance_after)
        .bind(entry.reason)
        .bind(&entry.order_id)
        .bind(&entry.refund_id)
        .bind(entry.created_at)
        .execute(&mut *conn)
        .await?;

        debug!(
            account_id = %entry.account_id,
            sequence = entry.sequence,
            amount = entry.amount,
            balance_after = entry.balance_after,
            "Ledger entry appended"
        );
        Ok(())
    }

    /// Moves the cached balance from `expected` to `new`.
    pub async fn set_balance(conn: &mut SqliteConnection, account_id: &str, expected: i64, new: i64) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE ledger_accounts SET balance = ?2, updated_at = ?3 WHERE id = ?1 AND balance = ?4",
        )
        .bind(account_id)
        .bind(new)
        .bind(Utc::now())
        .bind(expected)
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::conflict("ledger_account", account_id));
        }
        Ok(())
    }

    pub async fn insert_payment(conn: &mut SqliteConnection, payment: &BalancePayment, position: i64) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO order_balance_payments (
                id, order_id, account_id, kind, amount, units, refunded_amount, refunded_units, position
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&payment.id)
        .bind(&payment.order_id)
        .bind(&payment.account_id)
        .bind(payment.kind)
        .bind(payment.amount.units())
        .bind(payment.units)
        .bind(payment.refunded_amount.units())
        .bind(payment.refunded_units)
        .bind(position)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Balance payments of an order in redemption order.
    pub async fn payments_for_order(conn: &mut SqliteConnection, order_id: &str) -> DbResult<Vec<BalancePayment>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(
            r#"
            SELECT id, order_id, account_id, kind, amount, units, refunded_amount, refunded_units
            FROM order_balance_payments
            WHERE order_id = ?1
            ORDER BY position ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows.into_iter().map(BalancePayment::from).collect())
    }

    /// Adds to the refunded amount and units of one balance payment.
    pub async fn record_payment_refund(
        conn: &mut SqliteConnection,
        payment_id: &str,
        amount: Money,
        units: i64,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE order_balance_payments
            SET refunded_amount = refunded_amount + ?2, refunded_units = refunded_units + ?3
            WHERE id = ?1
            "#,
        )
        .bind(payment_id)
        .bind(amount.units())
        .bind(units)
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("balance_payment", payment_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};

    fn entry(account_id: &str, sequence: i64, amount: i64, balance_after: i64) -> LedgerEntry {
        LedgerEntry {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            sequence,
            amount,
            balance_after,
            reason: LedgerReason::Issued,
            order_id: None,
            refund_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_ensure_account_is_idempotent() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let a = LedgerRepository::ensure_account(&mut conn, LedgerKind::StoreCredit, "cust-1", None)
            .await
            .unwrap();
        let b = LedgerRepository::ensure_account(&mut conn, LedgerKind::StoreCredit, "cust-1", None)
            .await
            .unwrap();
        let points = LedgerRepository::ensure_account(&mut conn, LedgerKind::LoyaltyPoints, "cust-1", None)
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, points.id);
        assert_eq!(a.balance, 0);
    }

    #[tokio::test]
    async fn test_entries_chain_and_tip() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let account = LedgerRepository::ensure_account(&mut conn, LedgerKind::GiftCard, "GIFT-1", None)
            .await
            .unwrap();

        LedgerRepository::insert_entry(&mut conn, &entry(&account.id, 1, 5000, 5000)).await.unwrap();
        LedgerRepository::set_balance(&mut conn, &account.id, 0, 5000).await.unwrap();
        LedgerRepository::insert_entry(&mut conn, &entry(&account.id, 2, -2000, 3000)).await.unwrap();
        LedgerRepository::set_balance(&mut conn, &account.id, 5000, 3000).await.unwrap();

        let tip = LedgerRepository::tip(&mut conn, &account.id).await.unwrap().unwrap();
        assert_eq!((tip.sequence, tip.balance_after), (2, 3000));

        // same sequence twice
        let dup = LedgerRepository::insert_entry(&mut conn, &entry(&account.id, 2, 1, 3001)).await;
        assert!(matches!(dup, Err(DbError::UniqueViolation { .. })));

        // stale balance
        let stale = LedgerRepository::set_balance(&mut conn, &account.id, 5000, 1).await;
        assert!(matches!(stale, Err(DbError::Conflict { .. })));
        drop(conn);

        let entries = db.ledgers().entries(&account.id).await.unwrap();
        assert_eq!(meridian_core::ledger::replay(&account.id, &entries).unwrap(), 3000);
    }

    #[tokio::test]
    async fn test_set_active() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let account = LedgerRepository::ensure_account(&mut conn, LedgerKind::GiftCard, "GIFT-2", None)
            .await
            .unwrap();
        drop(conn);

        db.ledgers().set_active(&account.id, false).await.unwrap();
        let stored = db.ledgers().get_account_by_id(&account.id).await.unwrap().unwrap();
        assert!(!stored.active);
        assert!(db.ledgers().set_active("missing", false).await.is_err());
    }
}
