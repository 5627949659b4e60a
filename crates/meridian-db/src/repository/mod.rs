//! # Repository Module
//!
//! Database repository implementations for the checkout engine.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Two Ways In                                          │
//! │                                                                         │
//! │  Reads outside a transaction                                            │
//! │       db.orders().get(id)            ← &self, acquires from the pool    │
//! │                                                                         │
//! │  Writes inside a settlement                                             │
//! │       let mut tx = db.begin().await?;                                   │
//! │       OrderRepository::insert(&mut tx, &order)                          │
//! │       CouponRepository::try_increment_usage(&mut tx, id)                │
//! │       InventoryRepository::compare_and_swap(&mut tx, …)                 │
//! │       EventOutboxRepository::enqueue(&mut tx, &event)                   │
//! │       tx.commit().await?;            ← all or nothing                   │
//! │                                                                         │
//! │  Transactional functions take `&mut SqliteConnection`, so they work     │
//! │  with a `Transaction` or a plain pooled connection alike.               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`OrderRepository`](order::OrderRepository) - orders, items, notes, status history
//! - [`SequenceRepository`](sequence::SequenceRepository) - order numbers
//! - [`CouponRepository`](coupon::CouponRepository) - coupons, usage counter, usages
//! - [`InventoryRepository`](inventory::InventoryRepository) - stock records
//! - [`CustomerRepository`](customer::CustomerRepository) - customer aggregates
//! - [`LedgerRepository`](ledger::LedgerRepository) - balance ledgers and balance payments
//! - [`RefundRepository`](refund::RefundRepository) - refunds
//! - [`EventOutboxRepository`](event::EventOutboxRepository) - event outbox

pub mod coupon;
pub mod customer;
pub mod event;
pub mod inventory;
pub mod ledger;
pub mod order;
pub mod refund;
pub mod sequence;
