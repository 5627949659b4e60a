//! # Catalog Snapshot
//!
//! The read-only view of products the checkout is handed. Variations carry
//! optional overrides that fall back to their parent product.
//!
//! ## Resolution
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  Variation field group      present?   effective value              │
//! │  ──────────────────────     ────────   ───────────────────────────  │
//! │  pricing (price, sale)      yes        variation                     │
//! │                             no         parent product                │
//! │  tax (status, class)        per field, variation else parent         │
//! │  stock                      manage_stock = Some(true) → variation    │
//! │                             otherwise  → parent's record             │
//! │  shipping (virtual)         variation else parent                    │
//! │  purchasable                parent published AND variation enabled   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each field group resolves on its own; there is no inheritance.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::inventory::{BackorderPolicy, InventoryRecord, StockStatus};
use crate::money::Money;
use crate::types::{normalize_tax_class, ProductRef};

// =============================================================================
// Products and Variations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    #[default]
    Publish,
    Draft,
    Pending,
    Private,
    Trash,
}

/// Which parts of a sale a product's tax applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxStatus {
    #[default]
    Taxable,
    /// Only shipping for this item is taxed.
    Shipping,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub status: ProductStatus,
    #[serde(default = "default_true")]
    pub purchasable: bool,
    pub regular_price: Money,
    #[serde(default)]
    pub sale_price: Option<Money>,
    #[serde(default)]
    pub tax_status: TaxStatus,
    #[serde(default)]
    pub tax_class: String,
    #[serde(default)]
    pub category_ids: Vec<String>,
    /// Virtual products do not need shipping.
    #[serde(default)]
    pub is_virtual: bool,
    #[serde(default)]
    pub manage_stock: bool,
    #[serde(default)]
    pub stock_quantity: i64,
    #[serde(default)]
    pub backorders: BackorderPolicy,
    #[serde(default)]
    pub low_stock_amount: Option<i64>,
    #[serde(default)]
    pub stock_status: StockStatus,
}

fn default_true() -> bool {
    true
}

impl Product {
    /// Published, taxable, untracked product.
    pub fn simple(id: impl Into<String>, name: impl Into<String>, price: Money) -> Self {
        Product {
            id: id.into(),
            name: name.into(),
            sku: None,
            status: ProductStatus::Publish,
            purchasable: true,
            regular_price: price,
            sale_price: None,
            tax_status: TaxStatus::Taxable,
            tax_class: String::new(),
            category_ids: Vec::new(),
            is_virtual: false,
            manage_stock: false,
            stock_quantity: 0,
            backorders: BackorderPolicy::No,
            low_stock_amount: None,
            stock_status: StockStatus::InStock,
        }
    }

    /// Turns on stock tracking.
    pub fn with_stock(mut self, quantity: i64, backorders: BackorderPolicy) -> Self {
        self.manage_stock = true;
        self.stock_quantity = quantity;
        self.backorders = backorders;
        self
    }

    pub fn inventory(&self) -> InventoryRecord {
        let mut record = InventoryRecord {
            item_id: self.id.clone(),
            product_id: self.id.clone(),
            variation_id: None,
            manage_stock: self.manage_stock,
            stock_quantity: self.stock_quantity,
            backorders: self.backorders,
            low_stock_amount: self.low_stock_amount,
            stock_status: self.stock_status,
        };
        record.stock_status = record.derive_status();
        record
    }
}

/// A variation. `None` means "use the parent's value".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Variation {
    pub id: String,
    pub product_id: String,
    /// Appended to the parent name, e.g. "Red, Large".
    #[serde(default)]
    pub attributes_label: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub regular_price: Option<Money>,
    #[serde(default)]
    pub sale_price: Option<Money>,
    #[serde(default)]
    pub tax_status: Option<TaxStatus>,
    #[serde(default)]
    pub tax_class: Option<String>,
    #[serde(default)]
    pub is_virtual: Option<bool>,
    #[serde(default)]
    pub manage_stock: Option<bool>,
    #[serde(default)]
    pub stock_quantity: Option<i64>,
    #[serde(default)]
    pub backorders: Option<BackorderPolicy>,
    #[serde(default)]
    pub low_stock_amount: Option<i64>,
    #[serde(default)]
    pub stock_status: Option<StockStatus>,
}

impl Variation {
    pub fn new(id: impl Into<String>, product_id: impl Into<String>) -> Self {
        Variation {
            id: id.into(),
            product_id: product_id.into(),
            enabled: true,
            ..Default::default()
        }
    }
}

// =============================================================================
// Resolved Entry
// =============================================================================

/// Effective attributes of a product or variation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub item: ProductRef,
    pub name: String,
    pub sku: Option<String>,
    pub purchasable: bool,
    /// Effective unit price: sale price when set, else regular.
    pub price: Money,
    pub regular_price: Money,
    pub on_sale: bool,
    pub tax_status: TaxStatus,
    pub tax_class: String,
    pub category_ids: Vec<String>,
    pub requires_shipping: bool,
    /// Stock record that sales of this entry draw from.
    pub inventory: InventoryRecord,
}

impl CatalogEntry {
    pub fn is_taxable(&self) -> bool {
        self.tax_status == TaxStatus::Taxable
    }
}

/// Effective price group: `(price, regular, on_sale)`.
fn resolve_pricing(regular: Money, sale: Option<Money>) -> (Money, Money, bool) {
    match sale {
        Some(sale) if sale < regular => (sale, regular, true),
        _ => (regular, regular, false),
    }
}

/// Layers a variation over its parent.
pub fn resolve(product: &Product, variation: Option<&Variation>) -> CatalogEntry {
    let published = matches!(product.status, ProductStatus::Publish | ProductStatus::Private);

    let Some(variation) = variation else {
        let (price, regular_price, on_sale) = resolve_pricing(product.regular_price, product.sale_price);
        return CatalogEntry {
            item: ProductRef::product(product.id.clone()),
            name: product.name.clone(),
            sku: product.sku.clone(),
            purchasable: published && product.purchasable,
            price,
            regular_price,
            on_sale,
            tax_status: product.tax_status,
            tax_class: normalize_tax_class(&product.tax_class).to_string(),
            category_ids: product.category_ids.clone(),
            requires_shipping: !product.is_virtual,
            inventory: product.inventory(),
        };
    };

    let (price, regular_price, on_sale) = match variation.regular_price {
        Some(regular) => resolve_pricing(regular, variation.sale_price),
        None => resolve_pricing(product.regular_price, variation.sale_price.or(product.sale_price)),
    };

    let tax_class = variation.tax_class.as_deref().unwrap_or(&product.tax_class);

    let inventory = if variation.manage_stock == Some(true) {
        let mut record = InventoryRecord {
            item_id: variation.id.clone(),
            product_id: product.id.clone(),
            variation_id: Some(variation.id.clone()),
            manage_stock: true,
            stock_quantity: variation.stock_quantity.unwrap_or(0),
            backorders: variation.backorders.unwrap_or(product.backorders),
            low_stock_amount: variation.low_stock_amount.or(product.low_stock_amount),
            stock_status: StockStatus::InStock,
        };
        record.stock_status = record.derive_status();
        record
    } else if product.manage_stock {
        product.inventory()
    } else {
        // Neither tracks stock: the variation's own status flag decides.
        let mut record = InventoryRecord::untracked(variation.id.clone(), product.id.clone());
        record.variation_id = Some(variation.id.clone());
        record.stock_status = variation.stock_status.unwrap_or(product.stock_status);
        record
    };

    let name = match &variation.attributes_label {
        Some(label) if !label.is_empty() => format!("{} - {}", product.name, label),
        _ => product.name.clone(),
    };

    CatalogEntry {
        item: ProductRef::variation(product.id.clone(), variation.id.clone()),
        name,
        sku: variation.sku.clone().or_else(|| product.sku.clone()),
        purchasable: published && product.purchasable && variation.enabled,
        price,
        regular_price,
        on_sale,
        tax_status: variation.tax_status.unwrap_or(product.tax_status),
        tax_class: normalize_tax_class(tax_class).to_string(),
        category_ids: product.category_ids.clone(),
        requires_shipping: !variation.is_virtual.unwrap_or(product.is_virtual),
        inventory,
    }
}

// =============================================================================
// Catalog Collaborator
// =============================================================================

/// Source of product data for quoting.
pub trait Catalog: Send + Sync {
    /// Effective entry for a product or one of its variations, `None` when
    /// either does not exist.
    fn entry(&self, product_id: &str, variation_id: Option<&str>) -> Option<CatalogEntry>;
}

/// In-memory catalog, the usual [`Catalog`] implementation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    products: HashMap<String, Product>,
    variations: HashMap<String, Variation>,
}

impl CatalogSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_product(mut self, product: Product) -> Self {
        self.insert_product(product);
        self
    }

    pub fn with_variation(mut self, variation: Variation) -> Self {
        self.insert_variation(variation);
        self
    }

    pub fn insert_product(&mut self, product: Product) {
        self.products.insert(product.id.clone(), product);
    }

    pub fn insert_variation(&mut self, variation: Variation) {
        self.variations.insert(variation.id.clone(), variation);
    }

    pub fn product(&self, id: &str) -> Option<&Product> {
        self.products.get(id)
    }
}

impl Catalog for CatalogSnapshot {
    fn entry(&self, product_id: &str, variation_id: Option<&str>) -> Option<CatalogEntry> {
        let product = self.products.get(product_id)?;
        match variation_id {
            Some(id) => {
                let variation = self.variations.get(id).filter(|v| v.product_id == product.id)?;
                Some(resolve(product, Some(variation)))
            }
            None => Some(resolve(product, None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(s: &str) -> Money {
        s.parse().unwrap()
    }

    fn shirt() -> Product {
        let mut p = Product::simple("shirt", "Shirt", m("20.00"));
        p.tax_class = "clothing".to_string();
        p.category_ids = vec!["apparel".to_string()];
        p.with_stock(10, BackorderPolicy::No)
    }

    #[test]
    fn test_simple_product_entry() {
        let catalog = CatalogSnapshot::new().with_product(shirt());
        let entry = catalog.entry("shirt", None).unwrap();
        assert_eq!(entry.price, m("20.00"));
        assert!(!entry.on_sale);
        assert_eq!(entry.tax_class, "clothing");
        assert_eq!(entry.inventory.item_id, "shirt");
        assert!(entry.purchasable);
        assert!(catalog.entry("missing", None).is_none());
    }

    #[test]
    fn test_variation_falls_back_per_field_group() {
        let mut red = Variation::new("shirt-red", "shirt");
        red.attributes_label = Some("Red".to_string());
        red.sale_price = Some(m("15.00"));
        red.is_virtual = Some(true);

        let catalog = CatalogSnapshot::new().with_product(shirt()).with_variation(red);
        let entry = catalog.entry("shirt", Some("shirt-red")).unwrap();
        assert_eq!(entry.name, "Shirt - Red");
        assert_eq!(entry.price, m("15.00"));
        assert_eq!(entry.regular_price, m("20.00"));
        assert!(entry.on_sale);
        assert_eq!(entry.tax_class, "clothing");
        assert!(!entry.requires_shipping);
        assert_eq!(entry.inventory.item_id, "shirt");
    }

    #[test]
    fn test_variation_with_own_stock() {
        let mut blue = Variation::new("shirt-blue", "shirt");
        blue.manage_stock = Some(true);
        blue.stock_quantity = Some(0);

        let catalog = CatalogSnapshot::new().with_product(shirt()).with_variation(blue);
        let entry = catalog.entry("shirt", Some("shirt-blue")).unwrap();
        assert_eq!(entry.inventory.item_id, "shirt-blue");
        assert_eq!(entry.inventory.stock_status, StockStatus::OutOfStock);
    }

    #[test]
    fn test_disabled_or_draft_not_purchasable() {
        let mut green = Variation::new("shirt-green", "shirt");
        green.enabled = false;
        let mut draft = Product::simple("draft", "Draft", m("1.00"));
        draft.status = ProductStatus::Draft;

        let catalog = CatalogSnapshot::new()
            .with_product(shirt())
            .with_product(draft)
            .with_variation(green);
        assert!(!catalog.entry("shirt", Some("shirt-green")).unwrap().purchasable);
        assert!(!catalog.entry("draft", None).unwrap().purchasable);
        assert!(catalog.entry("draft", Some("shirt-green")).is_none());
    }
}
