//! # meridian-db: Database Layer for the Meridian Checkout Engine
//!
//! SQLite storage for orders, coupons, inventory, customers, balance
//! ledgers, refunds and the event outbox, via sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Meridian Data Flow                               │
//! │                                                                         │
//! │  CheckoutEngine::settle(quote, outcome)                                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐    │
//! │  │                   meridian-db (THIS CRATE)                      │    │
//! │  │                                                                 │    │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐    │    │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │    │    │
//! │  │   │   (pool.rs)   │    │               │    │  (embedded)  │    │    │
//! │  │   │               │    │ OrderRepo     │    │              │    │    │
//! │  │   │ SqlitePool    │◄───│ CouponRepo    │    │ 001_initial_ │    │    │
//! │  │   │ Transactions  │    │ InventoryRepo │    │   schema.sql │    │    │
//! │  │   │               │    │ LedgerRepo …  │    │              │    │    │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘    │    │
//! │  │                                                                 │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐    │
//! │  │                     SQLite Database                             │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meridian_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("engine.db")).await?;
//! let order = db.orders().get(&order_id).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::coupon::{CouponRepository, CouponUsage};
pub use repository::customer::CustomerRepository;
pub use repository::event::{EventOutboxRepository, OutboxEntry};
pub use repository::inventory::InventoryRepository;
pub use repository::ledger::LedgerRepository;
pub use repository::order::OrderRepository;
pub use repository::refund::RefundRepository;
pub use repository::sequence::{SequenceRepository, ORDER_SEQUENCE};

/// sqlx types the engine needs for transaction signatures.
pub use sqlx::{Sqlite, SqliteConnection, Transaction};
