//! # Balance Ledgers
//!
//! Store credit, gift cards and loyalty points as append-only chains.
//!
//! ## Appending an Entry
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    append(account, -10.00, Redeemed)                    │
//! │                                                                         │
//! │  1. Re-read the account on the transaction    balance = 25.00           │
//! │  2. Read the tip entry                        seq 3, balance_after 25.00│
//! │  3. account.next_entry(tip, -10.00)                                     │
//! │       balance == tip.balance_after?  no  ──► LedgerChainBroken (fatal)  │
//! │       25.00 - 10.00 < 0?             no  ──► (else InsufficientBalance) │
//! │  4. INSERT ledger_entries (seq 4, amount -10.00, balance_after 15.00)   │
//! │  5. UPDATE ledger_accounts SET balance = 15.00 WHERE balance = 25.00    │
//! │                                                                         │
//! │  Steps 4 and 5 commit together or not at all.                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use tracing::{error, info};
use uuid::Uuid;

use meridian_core::ledger::{self, LedgerAccount, LedgerEntry, LedgerKind, LedgerReason};
use meridian_core::validation::validate_non_negative;
use meridian_core::{CoreError, Money};
use meridian_db::{LedgerRepository, SqliteConnection};

use crate::engine::CheckoutEngine;
use crate::error::{EngineError, EngineResult};
use crate::locks::Resource;

/// Appends one entry to `account_id` on the caller's transaction.
///
/// The caller holds the account's row lock.
pub(crate) async fn append(
    conn: &mut SqliteConnection,
    account_id: &str,
    amount: i64,
    reason: LedgerReason,
    order_id: Option<&str>,
    refund_id: Option<&str>,
    now: DateTime<Utc>,
) -> EngineResult<LedgerEntry> {
    let account = LedgerRepository::find_account_by_id(conn, account_id)
        .await?
        .ok_or_else(|| EngineError::not_found("ledger_account", account_id))?;
    let tip = LedgerRepository::tip(conn, account_id).await?;

    let (sequence, balance_after) = account.next_entry(tip.as_ref(), amount).inspect_err(|e| {
        if matches!(e, CoreError::LedgerChainBroken { .. }) {
            error!(account_id = %account_id, error = %e, "Ledger chain broken");
        }
    })?;

    let entry = LedgerEntry {
        id: Uuid::new_v4().to_string(),
        account_id: account.id.clone(),
        sequence,
        amount,
        balance_after,
        reason,
        order_id: order_id.map(str::to_string),
        refund_id: refund_id.map(str::to_string),
        created_at: now,
    };
    LedgerRepository::insert_entry(conn, &entry).await?;
    LedgerRepository::set_balance(conn, &account.id, account.balance, balance_after).await?;
    Ok(entry)
}

impl CheckoutEngine {
    /// Adds store credit for a customer, opening the account if needed.
    pub async fn issue_store_credit(&self, customer_id: &str, amount: Money) -> EngineResult<LedgerEntry> {
        validate_non_negative("amount", amount).map_err(CoreError::from)?;
        self.credit(LedgerKind::StoreCredit, customer_id, amount.units(), LedgerReason::Issued, None)
            .await
    }

    /// Loads a gift card. A new card is active with the given expiry.
    pub async fn issue_gift_card(
        &self,
        code: &str,
        amount: Money,
        expires_at: Option<DateTime<Utc>>,
    ) -> EngineResult<LedgerEntry> {
        validate_non_negative("amount", amount).map_err(CoreError::from)?;
        self.credit(LedgerKind::GiftCard, code, amount.units(), LedgerReason::Issued, expires_at)
            .await
    }

    /// Manual points correction. Negative values debit.
    pub async fn adjust_points(&self, customer_id: &str, points: i64) -> EngineResult<LedgerEntry> {
        self.credit(LedgerKind::LoyaltyPoints, customer_id, points, LedgerReason::Adjusted, None)
            .await
    }

    /// Blocks or unblocks a gift card for redemption.
    pub async fn set_gift_card_active(&self, code: &str, active: bool) -> EngineResult<()> {
        let account = self.ledger_account(LedgerKind::GiftCard, code).await?;
        self.db().ledgers().set_active(&account.id, active).await?;
        info!(account_id = %account.id, active, "Gift card status changed");
        Ok(())
    }

    pub async fn ledger_account(&self, kind: LedgerKind, owner: &str) -> EngineResult<LedgerAccount> {
        self.db()
            .ledgers()
            .get_account(kind, owner)
            .await?
            .ok_or_else(|| EngineError::not_found("ledger_account", owner))
    }

    /// Re-verifies every entry of an account in commit order and returns
    /// the reconstructed balance.
    ///
    /// A chain that does not add up, or that disagrees with the cached
    /// balance, is fatal for the account.
    pub async fn replay_ledger(&self, kind: LedgerKind, owner: &str) -> EngineResult<i64> {
        let account = self.ledger_account(kind, owner).await?;
        let entries = self.db().ledgers().entries(&account.id).await?;

        let balance = ledger::replay(&account.id, &entries).inspect_err(|e| {
            error!(account_id = %account.id, error = %e, "Ledger replay failed");
        })?;

        if balance != account.balance {
            error!(
                account_id = %account.id,
                replayed = balance,
                cached = account.balance,
                "Cached ledger balance disagrees with its entries"
            );
            return Err(CoreError::LedgerChainBroken {
                account_id: account.id.clone(),
                sequence: entries.last().map_or(0, |e| e.sequence),
                expected: balance,
                actual: account.balance,
            }
            .into());
        }
        Ok(balance)
    }

    async fn credit(
        &self,
        kind: LedgerKind,
        owner: &str,
        amount: i64,
        reason: LedgerReason,
        expires_at: Option<DateTime<Utc>>,
    ) -> EngineResult<LedgerEntry> {
        let _locks = self
            .locks()
            .acquire([Resource::ledger(kind, owner)], self.config().settlement.lock_timeout())
            .await?;

        let now = Utc::now();
        let mut tx = self.db().begin().await?;
        let account = LedgerRepository::ensure_account(&mut tx, kind, owner, expires_at).await?;
        let entry = append(&mut tx, &account.id, amount, reason, None, None, now).await?;
        tx.commit().await?;

        info!(
            account_id = %account.id,
            kind = ?kind,
            amount,
            balance = entry.balance_after,
            "Ledger credited"
        );
        Ok(entry)
    }
}
