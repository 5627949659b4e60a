//! # Inventory Repository
//!
//! Stock records keyed by item id (variation id, else product id).
//!
//! Writes are compare-and-swap on the quantity read: a writer that lost a
//! race sees [`DbError::Conflict`] instead of overwriting the winner's
//! decrement. The engine additionally serializes writers per item, so a
//! conflict here means something bypassed the engine.

use chrono::Utc;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use tracing::debug;

use crate::error::{DbError, DbResult};
use meridian_core::inventory::{BackorderPolicy, InventoryRecord, StockStatus};

#[derive(Debug, FromRow)]
struct InventoryRow {
    item_id: String,
    product_id: String,
    variation_id: Option<String>,
    manage_stock: bool,
    stock_quantity: i64,
    backorders: BackorderPolicy,
    low_stock_amount: Option<i64>,
    stock_status: StockStatus,
}

impl From<InventoryRow> for InventoryRecord {
    fn from(row: InventoryRow) -> Self {
        InventoryRecord {
            item_id: row.item_id,
            product_id: row.product_id,
            variation_id: row.variation_id,
            manage_stock: row.manage_stock,
            stock_quantity: row.stock_quantity,
            backorders: row.backorders,
            low_stock_amount: row.low_stock_amount,
            stock_status: row.stock_status,
        }
    }
}

const INVENTORY_COLUMNS: &str = r#"
    item_id, product_id, variation_id, manage_stock, stock_quantity,
    backorders, low_stock_amount, stock_status
"#;

/// Repository for inventory records.
#[derive(Debug, Clone)]
pub struct InventoryRepository {
    pool: SqlitePool,
}

impl InventoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        InventoryRepository { pool }
    }

    pub async fn get(&self, item_id: &str) -> DbResult<Option<InventoryRecord>> {
        let mut conn = self.pool.acquire().await?;
        Self::find(&mut conn, item_id).await
    }

    /// Loads the stored records for `item_ids`. Missing ids are absent from
    /// the map.
    pub async fn get_many(&self, item_ids: &[&str]) -> DbResult<HashMap<String, InventoryRecord>> {
        let mut conn = self.pool.acquire().await?;
        let mut records = HashMap::with_capacity(item_ids.len());
        for id in item_ids {
            if let Some(record) = Self::find(&mut conn, id).await? {
                records.insert(record.item_id.clone(), record);
            }
        }
        Ok(records)
    }

    /// Writes a record as given, replacing any stored quantity.
    ///
    /// For catalog sync and stock counts, not for checkout.
    pub async fn upsert(&self, record: &InventoryRecord) -> DbResult<()> {
        let mut record = record.clone();
        record.stock_status = record.derive_status();
        debug!(item_id = %record.item_id, quantity = record.stock_quantity, "Setting stock");

        sqlx::query(
            r#"
            INSERT INTO inventory_items (
                item_id, product_id, variation_id, manage_stock, stock_quantity,
                backorders, low_stock_amount, stock_status, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(item_id) DO UPDATE SET
                product_id = excluded.product_id,
                variation_id = excluded.variation_id,
                manage_stock = excluded.manage_stock,
                stock_quantity = excluded.stock_quantity,
                backorders = excluded.backorders,
                low_stock_amount = excluded.low_stock_amount,
                stock_status = excluded.stock_status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.item_id)
        .bind(&record.product_id)
        .bind(&record.variation_id)
        .bind(record.manage_stock)
        .bind(record.stock_quantity)
        .bind(record.backorders)
        .bind(record.low_stock_amount)
        .bind(record.stock_status)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Transactional operations
    // =========================================================================

    pub async fn find(conn: &mut SqliteConnection, item_id: &str) -> DbResult<Option<InventoryRecord>> {
        let sql = format!("SELECT {INVENTORY_COLUMNS} FROM inventory_items WHERE item_id = ?1");
        let row: Option<InventoryRow> = sqlx::query_as(&sql).bind(item_id).fetch_optional(&mut *conn).await?;
        Ok(row.map(InventoryRecord::from))
    }

    /// Returns the stored record, seeding it from `snapshot` the first time
    /// an item is seen.
    pub async fn load_or_seed(conn: &mut SqliteConnection, snapshot: &InventoryRecord) -> DbResult<InventoryRecord> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO inventory_items (
                item_id, product_id, variation_id, manage_stock, stock_quantity,
                backorders, low_stock_amount, stock_status, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&snapshot.item_id)
        .bind(&snapshot.product_id)
        .bind(&snapshot.variation_id)
        .bind(snapshot.manage_stock)
        .bind(snapshot.stock_quantity)
        .bind(snapshot.backorders)
        .bind(snapshot.low_stock_amount)
        .bind(snapshot.derive_status())
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        Self::find(conn, &snapshot.item_id)
            .await?
            .ok_or_else(|| DbError::not_found("inventory_item", &snapshot.item_id))
    }

    /// Stores `record`'s quantity and status if the stored quantity is still
    /// `expected`.
    pub async fn compare_and_swap(conn: &mut SqliteConnection, record: &InventoryRecord, expected: i64) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE inventory_items
            SET stock_quantity = ?2, stock_status = ?3, updated_at = ?4
            WHERE item_id = ?1 AND stock_quantity = ?5
            "#,
        )
        .bind(&record.item_id)
        .bind(record.stock_quantity)
        .bind(record.stock_status)
        .bind(Utc::now())
        .bind(expected)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::conflict("inventory_item", &record.item_id));
        }
        debug!(
            item_id = %record.item_id,
            from = expected,
            to = record.stock_quantity,
            "Stock updated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};

    #[tokio::test]
    async fn test_load_or_seed_keeps_stored_quantity() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.inventory()
            .upsert(&InventoryRecord::tracked("mug", "mug", 3, BackorderPolicy::No))
            .await
            .unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        // stale catalog snapshot says 10
        let snapshot = InventoryRecord::tracked("mug", "mug", 10, BackorderPolicy::No);
        let stored = InventoryRepository::load_or_seed(&mut conn, &snapshot).await.unwrap();
        assert_eq!(stored.stock_quantity, 3);

        let fresh = InventoryRecord::tracked("cup", "cup", 7, BackorderPolicy::Notify);
        let seeded = InventoryRepository::load_or_seed(&mut conn, &fresh).await.unwrap();
        assert_eq!(seeded.stock_quantity, 7);
        assert_eq!(seeded.backorders, BackorderPolicy::Notify);
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.inventory()
            .upsert(&InventoryRecord::tracked("mug", "mug", 1, BackorderPolicy::No))
            .await
            .unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        let mut record = InventoryRepository::find(&mut conn, "mug").await.unwrap().unwrap();
        let previous = record.stock_quantity;
        record.reserve(1).unwrap();
        InventoryRepository::compare_and_swap(&mut conn, &record, previous).await.unwrap();

        // second writer read the same quantity
        let err = InventoryRepository::compare_and_swap(&mut conn, &record, previous)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict { .. }));
        drop(conn);

        let stored = db.inventory().get("mug").await.unwrap().unwrap();
        assert_eq!(stored.stock_quantity, 0);
        assert_eq!(stored.stock_status, StockStatus::OutOfStock);
    }

    #[tokio::test]
    async fn test_schema_rejects_negative_stock_without_backorders() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut record = InventoryRecord::tracked("mug", "mug", 0, BackorderPolicy::No);
        record.stock_quantity = -1;
        assert!(db.inventory().upsert(&record).await.is_err());

        let mut backorderable = InventoryRecord::tracked("cup", "cup", 0, BackorderPolicy::Yes);
        backorderable.stock_quantity = -2;
        db.inventory().upsert(&backorderable).await.unwrap();
        let stored = db.inventory().get_many(&["cup", "missing"]).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored["cup"].stock_status, StockStatus::OnBackorder);
    }
}
