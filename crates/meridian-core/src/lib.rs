//! # meridian-core: Pure Checkout Logic
//!
//! Everything the checkout engine decides, as plain functions over plain
//! data. No database, no network, no clock unless one is passed in.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Meridian Checkout Engine                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐    │
//! │  │                 meridian-engine (orchestration)                 │    │
//! │  │   quote ──► settle / pay_and_settle ──► transition ──► refund   │    │
//! │  └─────────────────────────────┬───────────────────────────────────┘    │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐    │
//! │  │               ★ meridian-core (THIS CRATE) ★                    │    │
//! │  │                                                                 │    │
//! │  │   ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐   │    │
//! │  │   │  money  │ │   tax   │ │ coupon  │ │  cart   │ │  order  │   │    │
//! │  │   │  rate   │ │  rates  │ │validator│ │  Quote  │ │ states  │   │    │
//! │  │   └─────────┘ └─────────┘ └─────────┘ └─────────┘ └─────────┘   │    │
//! │  │   ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐   │    │
//! │  │   │inventory│ │ refund  │ │ ledger  │ │customer │ │  event  │   │    │
//! │  │   └─────────┘ └─────────┘ └─────────┘ └─────────┘ └─────────┘   │    │
//! │  │                                                                 │    │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS            │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐    │
//! │  │                 meridian-db (SQLite repositories)               │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`money`] / [`rate`] - fixed-point amounts and percentages
//! - [`tax`] - rate resolution and tax lines
//! - [`coupon`] - coupon rules and discount allocation
//! - [`catalog`] - catalog snapshot and variation resolution
//! - [`inventory`] - stock reservation under backorder policies
//! - [`cart`] - the Cart Aggregator producing a [`Quote`](cart::Quote)
//! - [`order`] - order records, items, totals and the status machine
//! - [`refund`] - refund validation
//! - [`ledger`] - balance ledger chain rules
//! - [`customer`] - customer aggregates
//! - [`event`] - emitted domain events
//! - [`validation`] - input checks
//!
//! ## Example Usage
//!
//! ```rust
//! use meridian_core::Money;
//! use meridian_core::rate::Rate;
//!
//! let price: Money = "10.00".parse().unwrap();
//! let tax = price.multiply_quantity(2).apply_rate(Rate::from_percent(8)).round_dp(2);
//! assert_eq!(tax.to_string(), "1.60");
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cart;
pub mod catalog;
pub mod coupon;
pub mod customer;
pub mod error;
pub mod event;
pub mod inventory;
pub mod ledger;
pub mod money;
pub mod order;
pub mod rate;
pub mod refund;
pub mod tax;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use cart::{CartAggregator, Quote, QuoteRequest};
pub use error::{CoreError, CoreResult, ErrorCategory, ValidationError};
pub use money::Money;
pub use order::{Order, OrderStatus};
pub use rate::Rate;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Currency used when the store does not configure one.
pub const DEFAULT_CURRENCY: &str = "USD";

/// Maximum lines in one cart.
pub const MAX_CART_LINES: usize = 100;

/// Maximum quantity on one cart line.
///
/// ## Business Reason
/// Catches typos such as 10000 instead of 10 before stock is reserved.
pub const MAX_ITEM_QUANTITY: i64 = 9_999;

/// Maximum characters in an order note.
pub const MAX_NOTE_LENGTH: usize = 2_000;
