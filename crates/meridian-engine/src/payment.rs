//! # Payment Collaborator
//!
//! The engine asks a gateway to charge an amount and records only the
//! outcome and the gateway's reference. Card data never reaches it.
//!
//! ## Pay and Settle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  quote.total = 27.00, redemptions: gift card 10.00                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  PaymentRequest { order_id, amount: 17.00, currency, method }           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  PaymentGateway::charge ──► PaymentOutcome { Success, "ch_123" }        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  settle(quote, outcome)                                                 │
//! │       │                                                                 │
//! │       ├── Ok(order)                                                     │
//! │       └── Err ──► PaymentCapturedButNotSettled { "ch_123", source }     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use meridian_core::ledger::Redemption;
use meridian_core::Money;

/// What the engine sends to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub order_id: String,
    pub amount: Money,
    pub currency: String,
    /// Gateway method id, e.g. "card" or "cod".
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PaymentResult {
    Success,
    Failure { code: String, message: String },
}

/// The result of collecting payment for a quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub result: PaymentResult,
    #[serde(default)]
    pub gateway_transaction_id: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    /// Balances applied alongside (or instead of) the gateway charge.
    #[serde(default)]
    pub redemptions: Vec<Redemption>,
}

impl PaymentOutcome {
    pub fn success(method: impl Into<String>, gateway_transaction_id: impl Into<String>) -> Self {
        PaymentOutcome {
            result: PaymentResult::Success,
            gateway_transaction_id: Some(gateway_transaction_id.into()),
            method: Some(method.into()),
            redemptions: Vec::new(),
        }
    }

    pub fn failure(method: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        PaymentOutcome {
            result: PaymentResult::Failure {
                code: code.into(),
                message: message.into(),
            },
            gateway_transaction_id: None,
            method: Some(method.into()),
            redemptions: Vec::new(),
        }
    }

    /// An order paid entirely from balances.
    pub fn balances_only(redemptions: Vec<Redemption>) -> Self {
        PaymentOutcome {
            result: PaymentResult::Success,
            gateway_transaction_id: None,
            method: Some("balance".to_string()),
            redemptions,
        }
    }

    pub fn with_redemptions(mut self, redemptions: Vec<Redemption>) -> Self {
        self.redemptions = redemptions;
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.result, PaymentResult::Success)
    }

    /// Money covered by balances.
    pub fn redeemed(&self) -> Money {
        self.redemptions.iter().map(|r| r.amount).sum()
    }
}

/// Charges money through an external provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: &PaymentRequest) -> PaymentOutcome;
}
