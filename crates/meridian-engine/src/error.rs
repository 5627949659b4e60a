//! # Engine Error Types
//!
//! Error types for checkout, settlement and refund operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Engine Error Categories                           │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐  │
//! │  │   Validation    │  │   Contention    │  │     Integrity           │  │
//! │  │                 │  │                 │  │                         │  │
//! │  │  ItemUnavail.   │  │  CouponExhaust. │  │  DuplicateSettlement    │  │
//! │  │  CouponRejected │  │  Insufficient   │  │  RefundExceeds*         │  │
//! │  │  Config         │  │  SettlementTime │  │  InvalidTransition      │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘  │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐    │
//! │  │    Fatal                                                        │    │
//! │  │                                                                 │    │
//! │  │  LedgerChainBroken, Corrupted rows, payment captured but the    │    │
//! │  │  order could not be written. Processing of the order halts.     │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every error turns into a [`Rejection`] carrying a machine-readable code,
//! so a checkout UI can re-prompt instead of showing a bare failure.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use meridian_core::{CoreError, ErrorCategory};
use meridian_db::DbError;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    // =========================================================================
    // Domain and storage
    // =========================================================================
    /// A business rule rejected the request.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Storage failed.
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    // =========================================================================
    // Settlement
    // =========================================================================
    /// Another settlement took the coupon's last usage slot after the quote
    /// was built.
    ///
    /// ## When This Occurs
    /// - Two checkouts quote with `usage_count = limit - 1`; the second to
    ///   commit lands here
    /// - The customer used up their per-user limit in another tab
    #[error("Coupon '{code}' has no usage left")]
    CouponExhausted { code: String },

    /// Row locks were not acquired in time.
    #[error("Settlement timed out after {waited_ms} ms waiting for {resource}")]
    SettlementTimeout { resource: String, waited_ms: u64 },

    /// The quote already produced an order.
    #[error("Quote {quote_id} was already settled")]
    DuplicateSettlement { quote_id: String },

    /// The gateway took the money but the order could not be written. The
    /// gateway reference is kept so the charge can be voided or retried.
    #[error("Payment {gateway_transaction_id} captured for order {order_id} but settlement failed: {source}")]
    PaymentCapturedButNotSettled {
        order_id: String,
        gateway_transaction_id: String,
        #[source]
        source: Box<EngineError>,
    },

    /// Order, account or coupon does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    // =========================================================================
    // Configuration
    // =========================================================================
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Internal
    // =========================================================================
    /// An event sink refused or lost an event. The outbox row is retried.
    #[error("Event delivery failed: {0}")]
    EventDelivery(String),

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<meridian_core::ValidationError> for EngineError {
    fn from(err: meridian_core::ValidationError) -> Self {
        EngineError::Core(err.into())
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Db(err.into())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for EngineError {
    fn from(err: toml::ser::Error) -> Self {
        EngineError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl EngineError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// How the caller should react.
    ///
    /// ## Storage errors
    /// - Lost compare-and-swap or a busy database: contention
    /// - Corrupted rows: fatal
    /// - Anything else from storage: fatal, the order's state is unknown
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Core(err) => err.category(),
            EngineError::Db(err) if err.is_contention() => ErrorCategory::Contention,
            EngineError::Db(DbError::NotFound { .. }) => ErrorCategory::Validation,
            EngineError::Db(_) => ErrorCategory::Fatal,
            EngineError::CouponExhausted { .. } | EngineError::SettlementTimeout { .. } => ErrorCategory::Contention,
            EngineError::DuplicateSettlement { .. } => ErrorCategory::Integrity,
            EngineError::PaymentCapturedButNotSettled { .. } => ErrorCategory::Fatal,
            EngineError::NotFound { .. }
            | EngineError::InvalidConfig(_)
            | EngineError::ConfigLoadFailed(_)
            | EngineError::ConfigSaveFailed(_) => ErrorCategory::Validation,
            EngineError::EventDelivery(_) => ErrorCategory::Contention,
            EngineError::ChannelError(_) => ErrorCategory::Fatal,
        }
    }

    /// Machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Core(err) => err.code(),
            EngineError::Db(DbError::Conflict { .. }) => "CONCURRENT_UPDATE",
            EngineError::Db(DbError::PoolExhausted | DbError::Busy(_)) => "STORAGE_BUSY",
            EngineError::Db(DbError::NotFound { .. }) => "NOT_FOUND",
            EngineError::Db(DbError::Corrupted { .. }) => "STORAGE_CORRUPTED",
            EngineError::Db(_) => "STORAGE_ERROR",
            EngineError::CouponExhausted { .. } => "COUPON_EXHAUSTED",
            EngineError::SettlementTimeout { .. } => "SETTLEMENT_TIMEOUT",
            EngineError::DuplicateSettlement { .. } => "DUPLICATE_SETTLEMENT",
            EngineError::PaymentCapturedButNotSettled { .. } => "PAYMENT_CAPTURED_NOT_SETTLED",
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::InvalidConfig(_) | EngineError::ConfigLoadFailed(_) | EngineError::ConfigSaveFailed(_) => {
                "CONFIG_ERROR"
            }
            EngineError::EventDelivery(_) => "EVENT_DELIVERY_FAILED",
            EngineError::ChannelError(_) => "INTERNAL_ERROR",
        }
    }

    /// Contention failures are worth retrying with a fresh quote.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Storage is in an unknown state for the affected order.
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Fatal
    }

    pub fn rejection(&self) -> Rejection {
        Rejection::from(self)
    }
}

// =============================================================================
// Rejection
// =============================================================================

/// Serializable failure for callers.
///
/// ```json
/// {"code":"INSUFFICIENT_STOCK","category":"contention","message":"...","retryable":true}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
}

impl From<&EngineError> for Rejection {
    fn from(err: &EngineError) -> Self {
        Rejection {
            code: err.code().to_string(),
            category: err.category(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl From<EngineError> for Rejection {
    fn from(err: EngineError) -> Self {
        Rejection::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let stock = EngineError::Core(CoreError::InsufficientStock {
            item_id: "mug".into(),
            available: 0,
            requested: 1,
        });
        assert_eq!(stock.category(), ErrorCategory::Contention);
        assert!(stock.is_retryable());

        assert!(EngineError::CouponExhausted { code: "save5".into() }.is_retryable());
        assert!(EngineError::SettlementTimeout {
            resource: "inventory:mug".into(),
            waited_ms: 5000
        }
        .is_retryable());

        let dup = EngineError::DuplicateSettlement { quote_id: "q-1".into() };
        assert_eq!(dup.category(), ErrorCategory::Integrity);
        assert!(!dup.is_retryable());

        assert!(EngineError::Db(DbError::conflict("inventory_item", "mug")).is_retryable());
        let busy = EngineError::Db(DbError::Busy("database is locked".into()));
        assert!(busy.is_retryable());
        assert_eq!(busy.code(), "STORAGE_BUSY");
        assert!(EngineError::Db(DbError::corrupted("order_item", "i-1", "bad json")).is_fatal());
    }

    #[test]
    fn test_rejection_shape() {
        let err = EngineError::CouponExhausted { code: "save5".into() };
        let rejection = err.rejection();
        assert_eq!(rejection.code, "COUPON_EXHAUSTED");
        assert_eq!(rejection.category, ErrorCategory::Contention);
        assert!(rejection.retryable);
        assert!(rejection.message.contains("save5"));

        let json = serde_json::to_value(&rejection).unwrap();
        assert_eq!(json["category"], "contention");
    }

    #[test]
    fn test_payment_captured_keeps_reference() {
        let err = EngineError::PaymentCapturedButNotSettled {
            order_id: "o-1".into(),
            gateway_transaction_id: "ch_123".into(),
            source: Box::new(EngineError::CouponExhausted { code: "save5".into() }),
        };
        assert!(err.to_string().contains("ch_123"));
        assert!(err.is_fatal());
    }
}
