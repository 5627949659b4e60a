//! # Balance Ledgers
//!
//! Store credit, gift cards and loyalty points share one model: an account
//! whose balance only ever changes by appending an entry.
//!
//! ## Chain
//! ```text
//!   seq  amount   balance_after
//!   ───  ──────   ─────────────
//!    1   +5000        5000        issued
//!    2   -2000        3000        redeemed (order 1041)
//!    3   +1000        4000        refunded (order 1041)
//!                     ▲
//!                     └── account.balance must equal the tip
//!
//!   balance_after[n] = balance_after[n-1] + amount[n]
//! ```
//!
//! Amounts are in the account's unit: ten-thousandths of the currency for
//! store credit and gift cards, whole points for loyalty.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::money::{Money, UNITS_PER_MAJOR};

// =============================================================================
// Accounts and Entries
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    StoreCredit,
    GiftCard,
    LoyaltyPoints,
}

impl LedgerKind {
    /// Whether one ledger unit is one Money unit.
    pub fn is_monetary(&self) -> bool {
        !matches!(self, LedgerKind::LoyaltyPoints)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    /// Balance loaded or granted.
    Issued,
    /// Spent on an order.
    Redeemed,
    /// Loyalty points for a completed order.
    Earned,
    /// Returned by a refund.
    Refunded,
    /// Returned because the order was cancelled.
    Reversed,
    Adjusted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub id: String,
    pub kind: LedgerKind,
    /// Customer id, or the card code for gift cards.
    pub owner: String,
    /// Equal to the tip entry's balance_after; 0 with no entries.
    pub balance: i64,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerAccount {
    /// Gift cards must be active and unexpired before they can be debited.
    pub fn usable(&self, now: DateTime<Utc>) -> CoreResult<()> {
        if !self.active {
            return Err(CoreError::LedgerUnavailable {
                account_id: self.id.clone(),
                reason: "account is inactive".to_string(),
            });
        }
        if self.expires_at.is_some_and(|expires| expires <= now) {
            return Err(CoreError::LedgerUnavailable {
                account_id: self.id.clone(),
                reason: "account has expired".to_string(),
            });
        }
        Ok(())
    }

    /// Computes the next entry's sequence and balance_after.
    ///
    /// Verifies the account still agrees with its tip and rejects debits
    /// larger than the balance.
    pub fn next_entry(&self, tip: Option<&LedgerEntry>, amount: i64) -> CoreResult<(i64, i64)> {
        let (sequence, expected) = tip.map_or((0, 0), |t| (t.sequence, t.balance_after));
        if self.balance != expected {
            return Err(CoreError::LedgerChainBroken {
                account_id: self.id.clone(),
                sequence,
                expected,
                actual: self.balance,
            });
        }

        let balance_after = self.balance.checked_add(amount).ok_or_else(|| ValidationError::OutOfRange {
            field: "ledger amount".to_string(),
            min: i64::MIN - self.balance.min(0),
            max: i64::MAX - self.balance.max(0),
        })?;
        if amount < 0 && balance_after < 0 {
            return Err(CoreError::InsufficientBalance {
                account_id: self.id.clone(),
                balance: self.balance,
                requested: -amount,
            });
        }
        Ok((sequence + 1, balance_after))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub account_id: String,
    /// 1-based, gapless per account.
    pub sequence: i64,
    pub amount: i64,
    pub balance_after: i64,
    pub reason: LedgerReason,
    pub order_id: Option<String>,
    pub refund_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Re-verifies a ledger from its first entry and returns the balance.
///
/// `entries` must be in commit (sequence) order.
pub fn replay(account_id: &str, entries: &[LedgerEntry]) -> CoreResult<i64> {
    let mut balance = 0_i64;
    for (index, entry) in entries.iter().enumerate() {
        let expected_sequence = index as i64 + 1;
        let expected = balance + entry.amount;
        if entry.sequence != expected_sequence || entry.balance_after != expected {
            return Err(CoreError::LedgerChainBroken {
                account_id: account_id.to_string(),
                sequence: entry.sequence,
                expected,
                actual: entry.balance_after,
            });
        }
        balance = entry.balance_after;
    }
    Ok(balance)
}

// =============================================================================
// Redemptions
// =============================================================================

/// A balance the customer wants applied to an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
    pub kind: LedgerKind,
    /// Customer id, or gift card code.
    pub owner: String,
    /// Money value covered on the order.
    pub amount: Money,
    /// Points to debit. Ignored for monetary kinds.
    #[serde(default)]
    pub points: i64,
}

impl Redemption {
    pub fn money(kind: LedgerKind, owner: impl Into<String>, amount: Money) -> Self {
        Redemption {
            kind,
            owner: owner.into(),
            amount,
            points: 0,
        }
    }

    pub fn points(owner: impl Into<String>, points: i64, amount: Money) -> Self {
        Redemption {
            kind: LedgerKind::LoyaltyPoints,
            owner: owner.into(),
            amount,
            points,
        }
    }

    /// Units debited from the ledger.
    pub fn ledger_units(&self) -> i64 {
        if self.kind.is_monetary() {
            self.amount.units()
        } else {
            self.points
        }
    }
}

/// A redemption as recorded against an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancePayment {
    pub id: String,
    pub order_id: String,
    pub account_id: String,
    pub kind: LedgerKind,
    pub amount: Money,
    pub units: i64,
    pub refunded_amount: Money,
    pub refunded_units: i64,
}

impl BalancePayment {
    pub fn outstanding(&self) -> Money {
        (self.amount - self.refunded_amount).clamp_non_negative()
    }
}

/// Credit going back to one balance payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReversal {
    pub payment_id: String,
    pub account_id: String,
    pub amount: Money,
    pub units: i64,
}

/// Routes `refund` back to outstanding balance payments, first payment
/// first. Points come back in proportion to the money value, rounded down,
/// with the last reversal of a payment returning whatever is left.
pub fn plan_reversals(payments: &[BalancePayment], refund: Money) -> Vec<LedgerReversal> {
    let mut left = refund;
    let mut reversals = Vec::new();

    for payment in payments {
        if !left.is_positive() {
            break;
        }
        let outstanding = payment.outstanding();
        if !outstanding.is_positive() {
            continue;
        }

        let amount = outstanding.min(left);
        let units = if amount == outstanding || payment.amount.is_zero() {
            payment.units - payment.refunded_units
        } else {
            (amount.units() as i128 * payment.units as i128 / payment.amount.units() as i128) as i64
        };

        reversals.push(LedgerReversal {
            payment_id: payment.id.clone(),
            account_id: payment.account_id.clone(),
            amount,
            units,
        });
        left -= amount;
    }

    reversals
}

/// Loyalty points for an order total, rounded down.
pub fn points_earned(total: Money, points_per_currency_unit: u32) -> i64 {
    if !total.is_positive() {
        return 0;
    }
    (total.units() as i128 * points_per_currency_unit as i128 / UNITS_PER_MAJOR as i128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(balance: i64) -> LedgerAccount {
        let now = Utc::now();
        LedgerAccount {
            id: "acct-1".to_string(),
            kind: LedgerKind::GiftCard,
            owner: "GIFT-1".to_string(),
            balance,
            active: true,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn entry(sequence: i64, amount: i64, balance_after: i64) -> LedgerEntry {
        LedgerEntry {
            id: format!("e{sequence}"),
            account_id: "acct-1".to_string(),
            sequence,
            amount,
            balance_after,
            reason: LedgerReason::Adjusted,
            order_id: None,
            refund_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_next_entry_chains_from_tip() {
        let tip = entry(2, -200, 300);
        assert_eq!(account(300).next_entry(Some(&tip), 100).unwrap(), (3, 400));
        assert_eq!(account(0).next_entry(None, 500).unwrap(), (1, 500));
    }

    #[test]
    fn test_next_entry_detects_drift_and_overdraft() {
        let tip = entry(2, -200, 300);
        assert!(matches!(
            account(301).next_entry(Some(&tip), 1),
            Err(CoreError::LedgerChainBroken { expected: 300, actual: 301, .. })
        ));
        assert!(matches!(
            account(300).next_entry(Some(&tip), -301),
            Err(CoreError::InsufficientBalance { balance: 300, requested: 301, .. })
        ));
    }

    #[test]
    fn test_next_entry_rejects_overflow() {
        let tip = entry(1, i64::MAX - 10, i64::MAX - 10);
        assert!(matches!(
            account(i64::MAX - 10).next_entry(Some(&tip), 11),
            Err(CoreError::Validation(ValidationError::OutOfRange { .. }))
        ));
        assert_eq!(account(i64::MAX - 10).next_entry(Some(&tip), 10).unwrap(), (2, i64::MAX));
    }

    #[test]
    fn test_replay() {
        let entries = vec![entry(1, 500, 500), entry(2, -200, 300), entry(3, 50, 350)];
        assert_eq!(replay("acct-1", &entries).unwrap(), 350);

        let broken = vec![entry(1, 500, 500), entry(2, -200, 310)];
        assert!(matches!(
            replay("acct-1", &broken),
            Err(CoreError::LedgerChainBroken { sequence: 2, .. })
        ));

        let gap = vec![entry(1, 500, 500), entry(3, -200, 300)];
        assert!(replay("acct-1", &gap).is_err());
    }

    #[test]
    fn test_usable() {
        let mut card = account(100);
        assert!(card.usable(Utc::now()).is_ok());
        card.expires_at = Some(Utc::now() - chrono::Duration::days(1));
        assert!(matches!(card.usable(Utc::now()), Err(CoreError::LedgerUnavailable { .. })));
        card.expires_at = None;
        card.active = false;
        assert!(card.usable(Utc::now()).is_err());
    }

    #[test]
    fn test_reversals_in_order_with_points_rounded_down() {
        let m = |s: &str| s.parse::<Money>().unwrap();
        let payments = vec![
            BalancePayment {
                id: "p1".to_string(),
                order_id: "o".to_string(),
                account_id: "credit".to_string(),
                kind: LedgerKind::StoreCredit,
                amount: m("3.00"),
                units: m("3.00").units(),
                refunded_amount: Money::ZERO,
                refunded_units: 0,
            },
            BalancePayment {
                id: "p2".to_string(),
                order_id: "o".to_string(),
                account_id: "points".to_string(),
                kind: LedgerKind::LoyaltyPoints,
                amount: m("3.00"),
                units: 100,
                refunded_amount: Money::ZERO,
                refunded_units: 0,
            },
        ];

        let reversals = plan_reversals(&payments, m("4.00"));
        assert_eq!(reversals.len(), 2);
        assert_eq!(reversals[0].amount, m("3.00"));
        assert_eq!(reversals[0].units, 30_000);
        assert_eq!(reversals[1].amount, m("1.00"));
        assert_eq!(reversals[1].units, 33);

        let mut settled = payments.clone();
        settled[0].refunded_amount = m("3.00");
        settled[0].refunded_units = 30_000;
        settled[1].refunded_amount = m("1.00");
        settled[1].refunded_units = 33;
        let rest = plan_reversals(&settled, m("2.00"));
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].units, 67);
    }

    #[test]
    fn test_points_earned() {
        assert_eq!(points_earned("27.99".parse().unwrap(), 1), 27);
        assert_eq!(points_earned("27.99".parse().unwrap(), 0), 0);
        assert_eq!(points_earned(Money::ZERO, 5), 0);
    }
}
