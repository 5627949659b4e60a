//! # meridian-engine: Checkout & Order Settlement
//!
//! Turns quotes into orders, and orders into refunds, without ever
//! selling stock, coupon slots or balance twice.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Checkout Engine                                  │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐   │
//! │  │                  CheckoutEngine (engine.rs)                      │   │
//! │  │                                                                  │   │
//! │  │  quote ──► settle / pay_and_settle ──► transition ──► refund     │   │
//! │  │  cancel · notes · ledgers · customer reads                       │   │
//! │  └────────────────────────────┬─────────────────────────────────────┘   │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                   │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐     │
//! │  │   RowLocks     │  │  meridian-db   │  │  EventDispatcher       │     │
//! │  │                │  │                │  │                        │     │
//! │  │ Sorted, per-   │  │ One SQLite     │  │ Reads event_outbox     │     │
//! │  │ row, time-     │  │ transaction    │  │ Hands rows to an       │     │
//! │  │ boxed mutexes  │  │ per operation  │  │ EventSink              │     │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘     │
//! │                                                                         │
//! │  COLLABORATORS:                                                         │
//! │  • Catalog       - product data for quoting (meridian-core)             │
//! │  • PaymentGateway - charges the card part of a payment                  │
//! │  • EventSink     - where committed events are delivered                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`config`] - TOML + environment configuration
//! - [`engine`] - `CheckoutEngine`, quoting and the order lifecycle
//! - [`settlement`] - quote to order in one transaction
//! - [`refund`] - partial and full refunds
//! - [`ledger`] - store credit, gift cards and loyalty points
//! - [`events`] - outbox dispatch
//! - [`locks`] - row locks
//! - [`payment`] - payment gateway seam
//! - [`error`] - engine errors and rejection codes
//!
//! ## Locking Discipline
//!
//! Every mutating operation reads what it needs first, then takes all of
//! its row locks in sorted order, then opens its transaction. No lock is
//! awaited while a connection is held.

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod ledger;
pub mod locks;
pub mod payment;
pub mod refund;
pub mod settlement;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{DatabaseSettings, EngineConfig, EventSettings, LoyaltySettings, SettlementSettings, StoreConfig};
pub use engine::CheckoutEngine;
pub use error::{EngineError, EngineResult, Rejection};
pub use events::{ChannelSink, DispatchReport, EventDispatcher, EventDispatcherHandle, EventSink, LogSink};
pub use locks::{LockSet, Resource, RowLocks};
pub use payment::{PaymentGateway, PaymentOutcome, PaymentRequest, PaymentResult};

use tracing_subscriber::EnvFilter;

/// Installs the default `tracing` subscriber.
///
/// `RUST_LOG` overrides the default filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,meridian=debug,sqlx=warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// =============================================================================
// Test Fixtures
// =============================================================================
