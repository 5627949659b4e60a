//! # Coupon Repository
//!
//! Coupon definitions, the usage counter and the usage audit trail.
//!
//! ## Last-Slot Race
//! ```text
//!   usage_limit = 5, usage_count = 4
//!
//!   settle A ──► UPDATE … SET usage_count = usage_count + 1
//!                WHERE id = ? AND usage_count < usage_limit   → 1 row  ✓
//!   settle B ──► same statement                               → 0 rows ✗
//!                                                              CouponExhausted
//! ```
//! The check and the increment are one statement, so the counter never
//! passes the limit whatever the interleaving.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use meridian_core::coupon::{Coupon, CouponStatus, DiscountType};
use meridian_core::Money;

#[derive(Debug, FromRow)]
struct CouponRow {
    id: String,
    code: String,
    discount_type: DiscountType,
    amount: i64,
    status: CouponStatus,
    date_expires: Option<DateTime<Utc>>,
    usage_count: i64,
    usage_limit: Option<i64>,
    usage_limit_per_user: Option<i64>,
    limit_usage_to_x_items: Option<i64>,
    individual_use: bool,
    product_ids: String,
    excluded_product_ids: String,
    category_ids: String,
    excluded_category_ids: String,
    exclude_sale_items: bool,
    minimum_amount: Option<i64>,
    maximum_amount: Option<i64>,
    email_restrictions: String,
    free_shipping: bool,
}

impl CouponRow {
    fn into_coupon(self) -> DbResult<Coupon> {
        let id = self.id.clone();
        let list = |column: &str, raw: &str| -> DbResult<Vec<String>> {
            serde_json::from_str(raw).map_err(|e| DbError::corrupted("coupon", &id, format!("{column}: {e}")))
        };
        Ok(Coupon {
            product_ids: list("product_ids", &self.product_ids)?,
            excluded_product_ids: list("excluded_product_ids", &self.excluded_product_ids)?,
            category_ids: list("category_ids", &self.category_ids)?,
            excluded_category_ids: list("excluded_category_ids", &self.excluded_category_ids)?,
            email_restrictions: list("email_restrictions", &self.email_restrictions)?,
            id: self.id,
            code: self.code,
            discount_type: self.discount_type,
            amount: Money::from_units(self.amount),
            status: self.status,
            date_expires: self.date_expires,
            usage_count: self.usage_count,
            usage_limit: self.usage_limit,
            usage_limit_per_user: self.usage_limit_per_user,
            limit_usage_to_x_items: self.limit_usage_to_x_items,
            individual_use: self.individual_use,
            exclude_sale_items: self.exclude_sale_items,
            minimum_amount: self.minimum_amount.map(Money::from_units),
            maximum_amount: self.maximum_amount.map(Money::from_units),
            free_shipping: self.free_shipping,
        })
    }
}

/// One use of a coupon by a settled order.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct CouponUsage {
    pub id: String,
    pub coupon_id: String,
    /// Cleared when the order is deleted.
    pub order_id: Option<String>,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    pub used_at: DateTime<Utc>,
}

impl CouponUsage {
    pub fn new(
        coupon_id: impl Into<String>,
        order_id: impl Into<String>,
        customer_id: Option<String>,
        customer_email: Option<String>,
        used_at: DateTime<Utc>,
    ) -> Self {
        CouponUsage {
            id: Uuid::new_v4().to_string(),
            coupon_id: coupon_id.into(),
            order_id: Some(order_id.into()),
            customer_id,
            customer_email,
            used_at,
        }
    }
}

const COUPON_COLUMNS: &str = r#"
    id, code, discount_type, amount, status, date_expires,
    usage_count, usage_limit, usage_limit_per_user, limit_usage_to_x_items,
    individual_use, product_ids, excluded_product_ids, category_ids,
    excluded_category_ids, exclude_sale_items, minimum_amount, maximum_amount,
    email_restrictions, free_shipping
"#;

/// Repository for coupons.
#[derive(Debug, Clone)]
pub struct CouponRepository {
    pool: SqlitePool,
}

impl CouponRepository {
    pub fn new(pool: SqlitePool) -> Self {
        CouponRepository { pool }
    }

    /// Looks a coupon up by code, case-insensitively.
    pub async fn get_by_code(&self, code: &str) -> DbResult<Option<Coupon>> {
        let mut conn = self.pool.acquire().await?;
        Self::find_by_code(&mut conn, code).await
    }

    /// Loads every coupon named in `codes`. Unknown codes are skipped.
    pub async fn get_by_codes(&self, codes: &[String]) -> DbResult<Vec<Coupon>> {
        let mut conn = self.pool.acquire().await?;
        let mut coupons = Vec::with_capacity(codes.len());
        for code in codes {
            if let Some(coupon) = Self::find_by_code(&mut conn, code).await? {
                coupons.push(coupon);
            }
        }
        Ok(coupons)
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<Coupon>> {
        let sql = format!("SELECT {COUPON_COLUMNS} FROM coupons WHERE id = ?1");
        let row: Option<CouponRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(CouponRow::into_coupon).transpose()
    }

    /// Inserts a new coupon or replaces the definition of an existing one.
    ///
    /// `usage_count` is never lowered by an upsert.
    pub async fn upsert(&self, coupon: &Coupon) -> DbResult<()> {
        let now = Utc::now();
        let code = Coupon::normalize_code(&coupon.code);
        debug!(coupon = %code, "Saving coupon");

        sqlx::query(
            r#"
            INSERT INTO coupons (
                id, code, discount_type, amount, status, date_expires,
                usage_count, usage_limit, usage_limit_per_user, limit_usage_to_x_items,
                individual_use, product_ids, excluded_product_ids, category_ids,
                excluded_category_ids, exclude_sale_items, minimum_amount, maximum_amount,
                email_restrictions, free_shipping, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6,
                ?7, ?8, ?9, ?10,
                ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18,
                ?19, ?20, ?21, ?21
            )
            ON CONFLICT(id) DO UPDATE SET
                code = excluded.code,
                discount_type = excluded.discount_type,
                amount = excluded.amount,
                status = excluded.status,
                date_expires = excluded.date_expires,
                usage_count = MAX(coupons.usage_count, excluded.usage_count),
                usage_limit = excluded.usage_limit,
                usage_limit_per_user = excluded.usage_limit_per_user,
                limit_usage_to_x_items = excluded.limit_usage_to_x_items,
                individual_use = excluded.individual_use,
                product_ids = excluded.product_ids,
                excluded_product_ids = excluded.excluded_product_ids,
                category_ids = excluded.category_ids,
                excluded_category_ids = excluded.excluded_category_ids,
                exclude_sale_items = excluded.exclude_sale_items,
                minimum_amount = excluded.minimum_amount,
                maximum_amount = excluded.maximum_amount,
                email_restrictions = excluded.email_restrictions,
                free_shipping = excluded.free_shipping,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&coupon.id)
        .bind(&code)
        .bind(coupon.discount_type)
        .bind(coupon.amount.units())
        .bind(coupon.status)
        .bind(coupon.date_expires)
        .bind(coupon.usage_count)
        .bind(coupon.usage_limit)
        .bind(coupon.usage_limit_per_user)
        .bind(coupon.limit_usage_to_x_items)
        .bind(coupon.individual_use)
        .bind(serde_json::to_string(&coupon.product_ids)?)
        .bind(serde_json::to_string(&coupon.excluded_product_ids)?)
        .bind(serde_json::to_string(&coupon.category_ids)?)
        .bind(serde_json::to_string(&coupon.excluded_category_ids)?)
        .bind(coupon.exclude_sale_items)
        .bind(coupon.minimum_amount.map(|m| m.units()))
        .bind(coupon.maximum_amount.map(|m| m.units()))
        .bind(serde_json::to_string(&coupon.email_restrictions)?)
        .bind(coupon.free_shipping)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Past uses of every coupon by one customer, keyed by coupon id.
    pub async fn usage_by_customer(&self, customer_id: &str) -> DbResult<HashMap<String, u32>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT coupon_id, COUNT(*)
            FROM coupon_usages
            WHERE customer_id = ?1
            GROUP BY coupon_id
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(coupon_id, count)| (coupon_id, count.max(0) as u32))
            .collect())
    }

    pub async fn usages(&self, coupon_id: &str) -> DbResult<Vec<CouponUsage>> {
        let rows = sqlx::query_as::<_, CouponUsage>(
            r#"
            SELECT id, coupon_id, order_id, customer_id, customer_email, used_at
            FROM coupon_usages
            WHERE coupon_id = ?1
            ORDER BY used_at ASC
            "#,
        )
        .bind(coupon_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // =========================================================================
    // Transactional operations
    // =========================================================================

    pub async fn find_by_code(conn: &mut SqliteConnection, code: &str) -> DbResult<Option<Coupon>> {
        let sql = format!("SELECT {COUPON_COLUMNS} FROM coupons WHERE code = ?1");
        let row: Option<CouponRow> = sqlx::query_as(&sql)
            .bind(Coupon::normalize_code(code))
            .fetch_optional(&mut *conn)
            .await?;
        row.map(CouponRow::into_coupon).transpose()
    }

    /// Takes one usage slot. Returns the new count, or `None` when the
    /// limit was already reached.
    pub async fn try_increment_usage(conn: &mut SqliteConnection, coupon_id: &str) -> DbResult<Option<i64>> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE coupons
            SET usage_count = usage_count + 1, updated_at = ?2
            WHERE id = ?1 AND (usage_limit IS NULL OR usage_count < usage_limit)
            RETURNING usage_count
            "#,
        )
        .bind(coupon_id)
        .bind(Utc::now())
        .fetch_optional(&mut *conn)
        .await?;
        Ok(count)
    }

    /// Uses of a coupon by one customer, matched on id, or on email for
    /// guest checkouts.
    pub async fn user_usage_count(
        conn: &mut SqliteConnection,
        coupon_id: &str,
        customer_id: Option<&str>,
        email: Option<&str>,
    ) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM coupon_usages
            WHERE coupon_id = ?1
              AND ((?2 IS NOT NULL AND customer_id = ?2)
                OR (?2 IS NULL AND ?3 IS NOT NULL AND customer_id IS NULL AND customer_email = ?3))
            "#,
        )
        .bind(coupon_id)
        .bind(customer_id)
        .bind(email)
        .fetch_one(&mut *conn)
        .await?;
        Ok(count)
    }

    pub async fn record_usage(conn: &mut SqliteConnection, usage: &CouponUsage) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO coupon_usages (id, coupon_id, order_id, customer_id, customer_email, used_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&usage.id)
        .bind(&usage.coupon_id)
        .bind(&usage.order_id)
        .bind(&usage.customer_id)
        .bind(&usage.customer_email)
        .bind(usage.used_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::order::tests::sample_order;
    use crate::repository::order::OrderRepository;
    use crate::{Database, DbConfig};

    fn limited(limit: i64) -> Coupon {
        let mut coupon = Coupon::new("c-1", "SAVE5", DiscountType::FixedCart, "5.00".parse().unwrap());
        coupon.usage_limit = Some(limit);
        coupon.product_ids = vec!["mug".to_string()];
        coupon
    }

    #[tokio::test]
    async fn test_upsert_and_lookup_is_case_insensitive() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.coupons().upsert(&limited(3)).await.unwrap();

        let coupon = db.coupons().get_by_code("  save5 ").await.unwrap().unwrap();
        assert_eq!(coupon.code, "save5");
        assert_eq!(coupon.product_ids, vec!["mug".to_string()]);
        assert_eq!(coupon.amount, "5.00".parse::<Money>().unwrap());
        assert!(!coupon.free_shipping);

        let found = db
            .coupons()
            .get_by_codes(&["SAVE5".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_free_shipping_flag_persists() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut coupon = limited(3);
        coupon.free_shipping = true;
        db.coupons().upsert(&coupon).await.unwrap();
        assert!(db.coupons().get("c-1").await.unwrap().unwrap().free_shipping);

        coupon.free_shipping = false;
        db.coupons().upsert(&coupon).await.unwrap();
        assert!(!db.coupons().get_by_code("save5").await.unwrap().unwrap().free_shipping);
    }

    #[tokio::test]
    async fn test_increment_stops_at_limit() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.coupons().upsert(&limited(2)).await.unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        assert_eq!(CouponRepository::try_increment_usage(&mut conn, "c-1").await.unwrap(), Some(1));
        assert_eq!(CouponRepository::try_increment_usage(&mut conn, "c-1").await.unwrap(), Some(2));
        assert_eq!(CouponRepository::try_increment_usage(&mut conn, "c-1").await.unwrap(), None);
        drop(conn);

        let coupon = db.coupons().get("c-1").await.unwrap().unwrap();
        assert_eq!(coupon.usage_count, 2);
    }

    #[tokio::test]
    async fn test_upsert_never_lowers_usage_count() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.coupons().upsert(&limited(5)).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        CouponRepository::try_increment_usage(&mut conn, "c-1").await.unwrap();
        drop(conn);

        db.coupons().upsert(&limited(5)).await.unwrap();
        assert_eq!(db.coupons().get("c-1").await.unwrap().unwrap().usage_count, 1);
    }

    #[tokio::test]
    async fn test_usage_survives_order_deletion() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.coupons().upsert(&limited(5)).await.unwrap();
        let order = sample_order(1);

        let mut conn = db.pool().acquire().await.unwrap();
        OrderRepository::insert(&mut conn, &order).await.unwrap();
        let usage = CouponUsage::new("c-1", &order.id, Some("cust-1".to_string()), None, Utc::now());
        CouponRepository::record_usage(&mut conn, &usage).await.unwrap();
        assert_eq!(
            CouponRepository::user_usage_count(&mut conn, "c-1", Some("cust-1"), None)
                .await
                .unwrap(),
            1
        );
        drop(conn);

        db.orders().delete(&order.id).await.unwrap();

        let usages = db.coupons().usages("c-1").await.unwrap();
        assert_eq!(usages.len(), 1);
        assert_eq!(usages[0].order_id, None);
        assert_eq!(db.coupons().usage_by_customer("cust-1").await.unwrap().get("c-1"), Some(&1));
    }

    #[tokio::test]
    async fn test_guest_usage_matches_on_email() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.coupons().upsert(&limited(5)).await.unwrap();
        let order = sample_order(1);

        let mut conn = db.pool().acquire().await.unwrap();
        OrderRepository::insert(&mut conn, &order).await.unwrap();
        let usage = CouponUsage::new("c-1", &order.id, None, Some("guest@example.com".to_string()), Utc::now());
        CouponRepository::record_usage(&mut conn, &usage).await.unwrap();

        let guest = CouponRepository::user_usage_count(&mut conn, "c-1", None, Some("guest@example.com"))
            .await
            .unwrap();
        let other = CouponRepository::user_usage_count(&mut conn, "c-1", None, Some("other@example.com"))
            .await
            .unwrap();
        assert_eq!((guest, other), (1, 0));
    }
}
