//! # Error Types
//!
//! Domain errors for meridian-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  meridian-core (this file)                                              │
//! │  ├── CoreError        - business rule failures                          │
//! │  ├── ValidationError  - malformed input                                 │
//! │  └── ErrorCategory    - validation / contention / integrity / fatal     │
//! │                                                                         │
//! │  meridian-db                                                            │
//! │  └── DbError          - storage failures                                │
//! │                                                                         │
//! │  meridian-engine                                                        │
//! │  └── EngineError      - what callers see, with a machine code           │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → EngineError → Rejection            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Categories
//! Every failure lands in exactly one [`ErrorCategory`]. Callers use it to
//! decide between "fix the input", "re-quote and retry", "stop, this is
//! wrong" and "halt the order".

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coupon::CouponRejection;
use crate::money::Money;
use crate::order::OrderStatus;

// =============================================================================
// Error Category
// =============================================================================

/// How a caller should react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad input. No side effects happened; fix the input and retry.
    Validation,
    /// Lost a race for stock, a coupon slot or a lock. Re-quote and retry.
    Contention,
    /// Request would violate an invariant. Rejected, never auto-corrected.
    Integrity,
    /// Storage is in an unknown state. Halt processing of the order.
    Fatal,
}

impl ErrorCategory {
    /// Only contention failures are worth retrying with a fresh quote.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Contention)
    }
}

// =============================================================================
// Core Error
// =============================================================================

/// Why a cart line cannot be bought.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    NotFound,
    NotPurchasable,
    OutOfStock,
}

/// Business rule failures.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A cart line references something the catalog will not sell.
    ///
    /// ## When This Occurs
    /// - Product or variation missing from the catalog snapshot
    /// - Product not published / variation disabled
    /// - Stock managed, backorders off, not enough on hand at quote time
    #[error("Item {product_id} is unavailable: {reason:?}")]
    ItemUnavailable {
        product_id: String,
        reason: UnavailableReason,
    },

    /// Shipping selection is missing, malformed or negative.
    #[error("Invalid shipping selection: {reason}")]
    InvalidShippingSelection { reason: String },

    /// A submitted coupon was rejected by the validator.
    #[error("Coupon '{code}' rejected: {reason}")]
    CouponRejected {
        code: String,
        reason: CouponRejection,
    },

    /// Quote requested with no lines.
    #[error("Cart is empty")]
    EmptyCart,

    /// Reservation would push a no-backorder record below zero.
    ///
    /// ## User Workflow
    /// ```text
    /// settle(quote: 2 × MUG)
    ///      │
    ///      ▼
    /// inventory row: stock 1, backorders = no
    ///      │
    ///      ▼
    /// InsufficientStock { item_id: "MUG", available: 1, requested: 2 }
    ///      │
    ///      ▼
    /// UI re-shows cart: "Only 1 left"
    /// ```
    #[error("Insufficient stock for {item_id}: available {available}, requested {requested}")]
    InsufficientStock {
        item_id: String,
        available: i64,
        requested: i64,
    },

    /// Status change not allowed by the order state machine.
    #[error("Order {order_id} cannot move from {from} to {to}")]
    InvalidTransition {
        order_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },

    /// Refunds are only taken against completed orders.
    #[error("Order {order_id} is {status}; refunds require a completed order")]
    RefundNotAllowed { order_id: String, status: OrderStatus },

    /// Refund references an item that is not on the order or not refundable.
    #[error("Order item {order_item_id} is not refundable: {reason}")]
    RefundItemInvalid {
        order_item_id: String,
        reason: String,
    },

    /// Cumulative refunded quantity would exceed what was bought.
    #[error(
        "Refund of {requested} on item {order_item_id} exceeds remaining quantity ({already_refunded} of {original} refunded)"
    )]
    RefundExceedsQuantity {
        order_item_id: String,
        original: i64,
        already_refunded: i64,
        requested: i64,
    },

    /// Cumulative refunded amount would exceed the item's total.
    #[error("Refund of {requested} on item {order_item_id} exceeds remaining refundable {remaining}")]
    RefundExceedsItemTotal {
        order_item_id: String,
        remaining: Money,
        requested: Money,
    },

    /// Cumulative refunds would exceed the order total.
    #[error("Refund of {requested} on order {order_id} exceeds remaining refundable {remaining}")]
    RefundExceedsOrderTotal {
        order_id: String,
        remaining: Money,
        requested: Money,
    },

    /// Cached totals disagree with the items they were derived from.
    #[error("Totals mismatch on {field}: expected {expected}, found {actual}")]
    TotalsMismatch {
        field: String,
        expected: Money,
        actual: Money,
    },

    /// A ledger entry's balance_after does not follow from its predecessor.
    #[error(
        "Ledger {account_id} chain broken at sequence {sequence}: expected balance {expected}, found {actual}"
    )]
    LedgerChainBroken {
        account_id: String,
        sequence: i64,
        expected: i64,
        actual: i64,
    },

    /// Debit larger than the account balance.
    #[error("Ledger {account_id} balance {balance} is less than {requested}")]
    InsufficientBalance {
        account_id: String,
        balance: i64,
        requested: i64,
    },

    /// Gift card inactive or expired, or account of the wrong kind.
    #[error("Ledger {account_id} cannot be used: {reason}")]
    LedgerUnavailable { account_id: String, reason: String },

    /// Input validation error.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Category used by callers to pick a reaction.
    pub fn category(&self) -> ErrorCategory {
        match self {
            CoreError::ItemUnavailable { .. }
            | CoreError::InvalidShippingSelection { .. }
            | CoreError::CouponRejected { .. }
            | CoreError::EmptyCart
            | CoreError::RefundItemInvalid { .. }
            | CoreError::LedgerUnavailable { .. }
            | CoreError::Validation(_) => ErrorCategory::Validation,

            CoreError::InsufficientStock { .. } | CoreError::InsufficientBalance { .. } => {
                ErrorCategory::Contention
            }

            CoreError::InvalidTransition { .. }
            | CoreError::RefundNotAllowed { .. }
            | CoreError::RefundExceedsQuantity { .. }
            | CoreError::RefundExceedsItemTotal { .. }
            | CoreError::RefundExceedsOrderTotal { .. }
            | CoreError::TotalsMismatch { .. } => ErrorCategory::Integrity,

            CoreError::LedgerChainBroken { .. } => ErrorCategory::Fatal,
        }
    }

    /// Machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::ItemUnavailable { .. } => "ITEM_UNAVAILABLE",
            CoreError::InvalidShippingSelection { .. } => "INVALID_SHIPPING_SELECTION",
            CoreError::CouponRejected { .. } => "COUPON_REJECTED",
            CoreError::EmptyCart => "EMPTY_CART",
            CoreError::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            CoreError::InvalidTransition { .. } => "INVALID_TRANSITION",
            CoreError::RefundNotAllowed { .. } => "REFUND_NOT_ALLOWED",
            CoreError::RefundItemInvalid { .. } => "REFUND_ITEM_INVALID",
            CoreError::RefundExceedsQuantity { .. } => "REFUND_EXCEEDS_QUANTITY",
            CoreError::RefundExceedsItemTotal { .. } => "REFUND_EXCEEDS_ITEM_TOTAL",
            CoreError::RefundExceedsOrderTotal { .. } => "REFUND_EXCEEDS_ORDER_TOTAL",
            CoreError::TotalsMismatch { .. } => "TOTALS_MISMATCH",
            CoreError::LedgerChainBroken { .. } => "LEDGER_CHAIN_BROKEN",
            CoreError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            CoreError::LedgerUnavailable { .. } => "LEDGER_UNAVAILABLE",
            CoreError::Validation(_) => "VALIDATION_ERROR",
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors, raised before any business logic runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format (e.g., invalid UUID, malformed amount).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// The same value appears twice where it must be unique.
    #[error("{field} '{value}' appears more than once")]
    Duplicate { field: String, value: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience alias for results carrying [`CoreError`].
pub type CoreResult<T> = Result<T, CoreError>;
