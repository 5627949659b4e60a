//! # Row Locks
//!
//! In-process exclusive access to the rows one settlement or refund writes.
//!
//! ## Locking Discipline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Two Checkouts, Shared Rows                           │
//! │                                                                         │
//! │  Checkout A wants: inventory:mug, coupon:c-1, customer:ada              │
//! │  Checkout B wants: coupon:c-1, inventory:mug                            │
//! │                                                                         │
//! │  Both sort first:                                                       │
//! │    Inventory(mug) < Coupon(c-1) < Customer(ada)                         │
//! │                                                                         │
//! │  A: lock inventory:mug ──► lock coupon:c-1 ──► lock customer:ada        │
//! │  B: lock inventory:mug (waits for A) ... ──► lock coupon:c-1            │
//! │                                                                         │
//! │  Same order everywhere means no cycle, so no deadlock. Each wait is     │
//! │  bounded by the settlement lock timeout; expiry becomes                 │
//! │  SettlementTimeout and every lock taken so far is released.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The locks serialize writers inside this process; the compare-and-swap
//! writes in meridian-db still catch anything that slips past them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

use meridian_core::ledger::LedgerKind;

use crate::error::{EngineError, EngineResult};

/// Entries kept before idle locks are pruned.
const PRUNE_THRESHOLD: usize = 1024;

/// A lockable row. The derived order is the global acquisition order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Resource {
    Order(String),
    Inventory(String),
    Coupon(String),
    Customer(String),
    Ledger(String),
}

impl Resource {
    pub fn ledger(kind: LedgerKind, owner: &str) -> Self {
        Resource::Ledger(format!("{kind:?}:{owner}"))
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Order(id) => write!(f, "order:{id}"),
            Resource::Inventory(id) => write!(f, "inventory:{id}"),
            Resource::Coupon(id) => write!(f, "coupon:{id}"),
            Resource::Customer(id) => write!(f, "customer:{id}"),
            Resource::Ledger(id) => write!(f, "ledger:{id}"),
        }
    }
}

/// Guards held until the settlement commits or aborts.
#[derive(Debug)]
pub struct LockSet {
    resources: Vec<Resource>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl LockSet {
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }
}

/// Per-row async mutexes, created on first use.
#[derive(Debug, Clone, Default)]
pub struct RowLocks {
    rows: Arc<Mutex<HashMap<Resource, Arc<AsyncMutex<()>>>>>,
}

impl RowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks every resource in global order, giving up after `timeout`.
    pub async fn acquire(&self, resources: impl IntoIterator<Item = Resource>, timeout: Duration) -> EngineResult<LockSet> {
        let mut resources: Vec<Resource> = resources.into_iter().collect();
        resources.sort();
        resources.dedup();

        let started = Instant::now();
        let deadline = started + timeout;
        let mut guards = Vec::with_capacity(resources.len());

        for resource in &resources {
            let mutex = self.mutex_for(resource);
            match tokio::time::timeout_at(deadline, mutex.lock_owned()).await {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    let waited_ms = started.elapsed().as_millis() as u64;
                    warn!(resource = %resource, waited_ms, "Timed out waiting for row lock");
                    return Err(EngineError::SettlementTimeout {
                        resource: resource.to_string(),
                        waited_ms,
                    });
                }
            }
        }

        debug!(count = resources.len(), "Row locks acquired");
        Ok(LockSet {
            resources,
            _guards: guards,
        })
    }

    /// Rows currently tracked, locked or not.
    pub fn tracked(&self) -> usize {
        self.rows.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn mutex_for(&self, resource: &Resource) -> Arc<AsyncMutex<()>> {
        let mut rows = self.rows.lock().unwrap_or_else(|p| p.into_inner());
        if rows.len() >= PRUNE_THRESHOLD {
            rows.retain(|_, m| Arc::strong_count(m) > 1);
        }
        rows.entry(resource.clone()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_order() {
        let mut resources = vec![
            Resource::Customer("ada".into()),
            Resource::Coupon("c-1".into()),
            Resource::Inventory("mug".into()),
            Resource::Inventory("cup".into()),
            Resource::Order("o-1".into()),
        ];
        resources.sort();
        assert_eq!(resources[0], Resource::Order("o-1".into()));
        assert_eq!(resources[1], Resource::Inventory("cup".into()));
        assert_eq!(resources[4], Resource::Customer("ada".into()));
        assert_eq!(Resource::Inventory("mug".into()).to_string(), "inventory:mug");
    }

    #[tokio::test]
    async fn test_duplicates_are_locked_once() {
        let locks = RowLocks::new();
        let set = locks
            .acquire(
                vec![Resource::Inventory("mug".into()), Resource::Inventory("mug".into())],
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert_eq!(set.resources().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_while_held() {
        let locks = RowLocks::new();
        let held = locks
            .acquire(vec![Resource::Coupon("c-1".into())], Duration::from_millis(100))
            .await
            .unwrap();

        let err = locks
            .acquire(
                vec![Resource::Inventory("mug".into()), Resource::Coupon("c-1".into())],
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SettlementTimeout { ref resource, .. } if resource == "coupon:c-1"));

        // the partially acquired inventory lock was released
        let again = locks
            .acquire(vec![Resource::Inventory("mug".into())], Duration::from_millis(50))
            .await;
        assert!(again.is_ok());
        drop(held);
    }

    #[tokio::test]
    async fn test_released_on_drop() {
        let locks = RowLocks::new();
        let first = locks
            .acquire(vec![Resource::Customer("ada".into())], Duration::from_millis(50))
            .await
            .unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire(vec![Resource::Customer("ada".into())], Duration::from_secs(5))
                    .await
                    .is_ok()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);
        assert!(waiter.await.unwrap());
        assert_eq!(locks.tracked(), 1);
    }
}
