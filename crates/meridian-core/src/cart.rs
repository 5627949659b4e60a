//! # Cart Aggregator
//!
//! Turns a cart into a [`Quote`]: priced lines, coupons, shipping, fees, tax
//! and totals. Pure: nothing is reserved or written, an abandoned quote is
//! simply dropped.
//!
//! ## Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  QuoteRequest                                                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  1. Lines      catalog lookup, purchasable, stock  → ItemUnavailable    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  2. Subtotals  unit price × quantity (exact)                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  3. Coupons    in submission order, each on what    → CouponRejected    │
//! │       │        earlier coupons left                                     │
//! │       ▼                                                                 │
//! │  4. Tax        per line on (subtotal − discount),                       │
//! │       │        added or extracted per prices_include_tax                │
//! │       ▼                                                                 │
//! │  5. Shipping   quoted total + its own tax           → InvalidShipping   │
//! │       │        Fees taxed like lines                  Selection         │
//! │       ▼                                                                 │
//! │  6. Totals     derived from the order items the quote would become      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Coupon order matters: `["TENPCT", "FIVEOFF"]` and `["FIVEOFF", "TENPCT"]`
//! can produce different totals. Submission order is kept.
//!
//! With tax-inclusive prices, discounts come off the gross price and the
//! line's tax is re-extracted from what is left. Shipping and fees are
//! always net.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

use crate::catalog::{Catalog, CatalogEntry};
use crate::coupon::{
    Coupon, CouponBook, CouponCart, CouponDecision, CouponLine, CouponRejection, CouponValidator, DiscountType,
};
use crate::error::{CoreError, CoreResult, UnavailableReason, ValidationError};
use crate::inventory::InventoryRecord;
use crate::money::Money;
use crate::order::{build_order_items, OrderTotals};
use crate::rate::Rate;
use crate::tax::{self, TaxContext, TaxLine};
use crate::types::{CustomerContext, Jurisdiction};
use crate::validation::{
    validate_cart_size, validate_coupon_code, validate_fee_count, validate_non_negative, validate_quantity,
};
use crate::DEFAULT_CURRENCY;

// =============================================================================
// Request
// =============================================================================

/// One line the customer wants to buy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: String,
    #[serde(default)]
    pub variation_id: Option<String>,
    pub quantity: i64,
}

impl CartLine {
    pub fn new(product_id: impl Into<String>, quantity: i64) -> Self {
        CartLine {
            product_id: product_id.into(),
            variation_id: None,
            quantity,
        }
    }

    pub fn variation(product_id: impl Into<String>, variation_id: impl Into<String>, quantity: i64) -> Self {
        CartLine {
            product_id: product_id.into(),
            variation_id: Some(variation_id.into()),
            quantity,
        }
    }

    fn leaf_id(&self) -> &str {
        self.variation_id.as_deref().unwrap_or(&self.product_id)
    }
}

/// A shipping rate already quoted by the shipping collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingSelection {
    pub method_id: String,
    pub label: String,
    /// Net of tax.
    pub total: Money,
}

impl ShippingSelection {
    pub fn new(method_id: impl Into<String>, label: impl Into<String>, total: Money) -> Self {
        ShippingSelection {
            method_id: method_id.into(),
            label: label.into(),
            total,
        }
    }
}

/// An extra charge on the order. Taxed only when it names a tax class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRequest {
    pub name: String,
    pub amount: Money,
    #[serde(default)]
    pub tax_class: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub lines: Vec<CartLine>,
    /// Applied in this order.
    #[serde(default)]
    pub coupon_codes: Vec<String>,
    #[serde(default)]
    pub shipping: Option<ShippingSelection>,
    #[serde(default)]
    pub fees: Vec<FeeRequest>,
    #[serde(default)]
    pub customer: CustomerContext,
}

impl QuoteRequest {
    pub fn new(lines: Vec<CartLine>) -> Self {
        QuoteRequest {
            lines,
            ..Default::default()
        }
    }

    pub fn coupon(mut self, code: impl Into<String>) -> Self {
        self.coupon_codes.push(code.into());
        self
    }

    pub fn shipping(mut self, selection: ShippingSelection) -> Self {
        self.shipping = Some(selection);
        self
    }

    pub fn fee(mut self, fee: FeeRequest) -> Self {
        self.fees.push(fee);
        self
    }

    pub fn customer(mut self, customer: CustomerContext) -> Self {
        self.customer = customer;
        self
    }
}

// =============================================================================
// Quote
// =============================================================================

/// A priced cart line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteLine {
    pub product_id: String,
    pub variation_id: Option<String>,
    pub name: String,
    pub sku: Option<String>,
    pub quantity: i64,
    /// As listed; gross when prices include tax.
    pub unit_price: Money,
    pub tax_class: String,
    pub on_sale: bool,
    /// Net, before discounts.
    pub subtotal: Money,
    pub subtotal_tax: Money,
    /// Net discount taken from this line.
    pub discount: Money,
    pub discount_tax: Money,
    /// Net, after discounts.
    pub total: Money,
    pub total_tax: Money,
    pub taxes: Vec<TaxLine>,
    /// Stock record seen at quote time.
    pub inventory: InventoryRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteCoupon {
    pub coupon_id: String,
    pub code: String,
    pub discount_type: DiscountType,
    /// Net discount across all lines.
    pub discount: Money,
    pub discount_tax: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteShipping {
    pub method_id: String,
    pub label: String,
    pub total: Money,
    pub total_tax: Money,
    pub taxes: Vec<TaxLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteFee {
    pub name: String,
    pub tax_class: Option<String>,
    pub total: Money,
    pub total_tax: Money,
    pub taxes: Vec<TaxLine>,
}

/// Tax collected by one rate across the quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteTax {
    pub rate_id: String,
    pub label: String,
    pub rate: Rate,
    pub compound: bool,
    /// From lines and fees.
    pub tax_amount: Money,
    pub shipping_tax_amount: Money,
}

/// The pre-order breakdown handed to settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub currency: String,
    pub prices_include_tax: bool,
    pub jurisdiction: Jurisdiction,
    pub customer: CustomerContext,
    pub lines: Vec<QuoteLine>,
    pub coupons: Vec<QuoteCoupon>,
    pub shipping: Option<QuoteShipping>,
    pub fees: Vec<QuoteFee>,
    pub taxes: Vec<QuoteTax>,
    pub totals: OrderTotals,
}

impl Quote {
    /// Re-derives the totals from the quote's parts.
    pub fn verify_totals(&self) -> CoreResult<()> {
        self.totals.verify(&build_order_items(self, &self.id))
    }

    pub fn total(&self) -> Money {
        self.totals.total
    }

    /// Tracked stock the quote draws on, summed per record and sorted by
    /// record id.
    pub fn stock_demand(&self) -> Vec<(InventoryRecord, i64)> {
        let mut demand: BTreeMap<String, (InventoryRecord, i64)> = BTreeMap::new();
        for line in self.lines.iter().filter(|l| l.inventory.manage_stock) {
            demand
                .entry(line.inventory.item_id.clone())
                .or_insert_with(|| (line.inventory.clone(), 0))
                .1 += line.quantity;
        }
        demand.into_values().collect()
    }
}

// =============================================================================
// Aggregator
// =============================================================================

/// Builds quotes against a catalog, a coupon book and a tax context.
///
/// ## Example
/// ```rust
/// use meridian_core::cart::{CartAggregator, CartLine, QuoteRequest, ShippingSelection};
/// use meridian_core::catalog::{CatalogSnapshot, Product};
/// use meridian_core::coupon::CouponBook;
/// use meridian_core::money::Money;
/// use meridian_core::rate::Rate;
/// use meridian_core::tax::{TaxContext, TaxRate, TaxTable};
/// use meridian_core::types::Jurisdiction;
///
/// let catalog = CatalogSnapshot::new().with_product(Product::simple("mug", "Mug", "10.00".parse().unwrap()));
/// let mut rate = TaxRate::simple("us", "US", Rate::from_percent(8));
/// rate.shipping = true;
/// let tax = TaxContext::new(Jurisdiction::country("US"), TaxTable::new(vec![rate]));
/// let coupons = CouponBook::default();
///
/// let request = QuoteRequest::new(vec![CartLine::new("mug", 2)])
///     .shipping(ShippingSelection::new("flat_rate", "Flat rate", "5.00".parse().unwrap()));
/// let quote = CartAggregator::new(&catalog, &coupons, &tax).quote(&request).unwrap();
/// assert_eq!(quote.totals.total, "27.00".parse::<Money>().unwrap());
/// ```
pub struct CartAggregator<'a> {
    catalog: &'a dyn Catalog,
    coupons: &'a CouponBook,
    tax: &'a TaxContext,
    currency: String,
    now: DateTime<Utc>,
}

struct PricedLine<'r> {
    request: &'r CartLine,
    entry: CatalogEntry,
}

impl<'a> CartAggregator<'a> {
    pub fn new(catalog: &'a dyn Catalog, coupons: &'a CouponBook, tax: &'a TaxContext) -> Self {
        CartAggregator {
            catalog,
            coupons,
            tax,
            currency: DEFAULT_CURRENCY.to_string(),
            now: Utc::now(),
        }
    }

    pub fn currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    /// Clock used for coupon expiry.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn quote(&self, request: &QuoteRequest) -> CoreResult<Quote> {
        if request.lines.is_empty() {
            return Err(CoreError::EmptyCart);
        }
        validate_cart_size(request.lines.len())?;

        let priced = self.price_lines(&request.lines)?;
        let mut coupon_lines: Vec<CouponLine> = priced
            .iter()
            .map(|p| {
                let subtotal = p.entry.price.multiply_quantity(p.request.quantity);
                CouponLine {
                    product_id: p.entry.item.product_id.clone(),
                    variation_id: p.entry.item.variation_id.clone(),
                    category_ids: p.entry.category_ids.clone(),
                    quantity: p.request.quantity,
                    on_sale: p.entry.on_sale,
                    subtotal,
                    remaining: subtotal,
                }
            })
            .collect();

        let (applied, allocations) = self.apply_coupons(request, &mut coupon_lines)?;
        let lines = self.tax_lines(&priced, &coupon_lines);
        let coupons = split_coupon_discounts(&lines, &applied, &allocations);
        let free_shipping = applied.iter().any(|c| c.free_shipping);
        let shipping = self.shipping(request, &priced, free_shipping)?;
        let fees = self.fees(&request.fees)?;
        let taxes = summarize_taxes(&lines, &fees, shipping.as_ref());

        let mut quote = Quote {
            id: Uuid::new_v4().to_string(),
            created_at: self.now,
            currency: self.currency.clone(),
            prices_include_tax: self.tax.prices_include_tax,
            jurisdiction: self.tax.jurisdiction.clone(),
            customer: request.customer.clone(),
            lines,
            coupons,
            shipping,
            fees,
            taxes,
            totals: OrderTotals::default(),
        };
        quote.totals = OrderTotals::derive(&build_order_items(&quote, &quote.id));
        Ok(quote)
    }

    /// Step 1: catalog lookup and availability, with quantities of lines
    /// sharing a stock record added up.
    fn price_lines<'r>(&self, lines: &'r [CartLine]) -> CoreResult<Vec<PricedLine<'r>>> {
        let mut demand: HashMap<String, i64> = HashMap::new();
        let mut priced = Vec::with_capacity(lines.len());

        for line in lines {
            validate_quantity(line.quantity)?;
            let unavailable = |reason| CoreError::ItemUnavailable {
                product_id: line.leaf_id().to_string(),
                reason,
            };

            let entry = self
                .catalog
                .entry(&line.product_id, line.variation_id.as_deref())
                .ok_or_else(|| unavailable(UnavailableReason::NotFound))?;
            if !entry.purchasable {
                return Err(unavailable(UnavailableReason::NotPurchasable));
            }
            validate_non_negative("price", entry.price)?;

            let wanted = demand.entry(entry.inventory.item_id.clone()).or_insert(0);
            *wanted += line.quantity;
            if !entry.inventory.can_fulfil(*wanted) {
                return Err(unavailable(UnavailableReason::OutOfStock));
            }

            priced.push(PricedLine { request: line, entry });
        }

        Ok(priced)
    }

    /// Step 3: each coupon sees what earlier ones left.
    fn apply_coupons(
        &self,
        request: &QuoteRequest,
        coupon_lines: &mut [CouponLine],
    ) -> CoreResult<(Vec<Coupon>, Vec<Vec<Money>>)> {
        let validator = CouponValidator::new(self.now);
        let mut seen = HashSet::new();
        let mut applied: Vec<Coupon> = Vec::new();
        let mut allocations: Vec<Vec<Money>> = Vec::new();

        for code in &request.coupon_codes {
            validate_coupon_code(code)?;
            let rejected = |reason| CoreError::CouponRejected {
                code: code.trim().to_string(),
                reason,
            };

            if !seen.insert(Coupon::normalize_code(code)) {
                return Err(rejected(CouponRejection::AlreadyApplied));
            }
            let coupon = self
                .coupons
                .get(code)
                .ok_or_else(|| rejected(CouponRejection::NotFound))?;

            let cart = CouponCart {
                lines: &*coupon_lines,
                applied: &applied,
            };
            match validator.validate(coupon, cart, &request.customer) {
                CouponDecision::Accept { allocations: split, .. } => {
                    for (line, amount) in coupon_lines.iter_mut().zip(&split) {
                        line.remaining -= *amount;
                    }
                    applied.push(coupon.clone());
                    allocations.push(split);
                }
                CouponDecision::Reject(reason) => return Err(rejected(reason)),
            }
        }

        Ok((applied, allocations))
    }

    /// Step 4: tax before and after discounts.
    fn tax_lines(&self, priced: &[PricedLine<'_>], coupon_lines: &[CouponLine]) -> Vec<QuoteLine> {
        let inclusive = self.tax.prices_include_tax;
        let decimals = self.tax.price_decimals;

        priced
            .iter()
            .zip(coupon_lines)
            .map(|(p, c)| {
                let rates = if p.entry.is_taxable() {
                    self.tax.table.rates(&self.tax.jurisdiction, &p.entry.tax_class)
                } else {
                    Vec::new()
                };

                let subtotal_tax = tax::total(&tax::calculate(c.subtotal, &rates, inclusive, decimals));
                let taxes = tax::calculate(c.remaining, &rates, inclusive, decimals);
                let total_tax = tax::total(&taxes);
                let (subtotal, total) = if inclusive {
                    (c.subtotal - subtotal_tax, c.remaining - total_tax)
                } else {
                    (c.subtotal, c.remaining)
                };

                QuoteLine {
                    product_id: p.entry.item.product_id.clone(),
                    variation_id: p.entry.item.variation_id.clone(),
                    name: p.entry.name.clone(),
                    sku: p.entry.sku.clone(),
                    quantity: p.request.quantity,
                    unit_price: p.entry.price,
                    tax_class: p.entry.tax_class.clone(),
                    on_sale: p.entry.on_sale,
                    subtotal,
                    subtotal_tax,
                    discount: subtotal - total,
                    discount_tax: subtotal_tax - total_tax,
                    total,
                    total_tax,
                    taxes,
                    inventory: p.entry.inventory.clone(),
                }
            })
            .collect()
    }

    /// Step 5a. An accepted free-shipping coupon keeps the selected method
    /// but charges nothing for it.
    fn shipping(
        &self,
        request: &QuoteRequest,
        priced: &[PricedLine<'_>],
        free_shipping: bool,
    ) -> CoreResult<Option<QuoteShipping>> {
        let Some(selection) = &request.shipping else {
            if priced.iter().any(|p| p.entry.requires_shipping) {
                return Err(CoreError::InvalidShippingSelection {
                    reason: "cart contains items that need shipping".to_string(),
                });
            }
            return Ok(None);
        };

        if selection.method_id.trim().is_empty() {
            return Err(CoreError::InvalidShippingSelection {
                reason: "shipping method is required".to_string(),
            });
        }
        if selection.total.is_negative() {
            return Err(CoreError::InvalidShippingSelection {
                reason: format!("shipping total {} is negative", selection.total),
            });
        }
        validate_non_negative("shipping.total", selection.total)?;

        let (total, taxes) = if free_shipping {
            (Money::ZERO, Vec::new())
        } else {
            let rates = self
                .tax
                .table
                .shipping_rates(&self.tax.jurisdiction, &self.tax.shipping_tax_class);
            let taxes = tax::calculate(selection.total, &rates, false, self.tax.price_decimals);
            (selection.total, taxes)
        };

        Ok(Some(QuoteShipping {
            method_id: selection.method_id.clone(),
            label: selection.label.clone(),
            total,
            total_tax: tax::total(&taxes),
            taxes,
        }))
    }

    /// Step 5b.
    fn fees(&self, fees: &[FeeRequest]) -> CoreResult<Vec<QuoteFee>> {
        validate_fee_count(fees.len())?;
        fees.iter()
            .map(|fee| -> CoreResult<QuoteFee> {
                if fee.name.trim().is_empty() {
                    return Err(ValidationError::Required {
                        field: "fee.name".to_string(),
                    }
                    .into());
                }
                validate_non_negative("fee.amount", fee.amount)?;

                let taxes = match &fee.tax_class {
                    Some(class) => tax::calculate(
                        fee.amount,
                        &self.tax.table.rates(&self.tax.jurisdiction, class),
                        false,
                        self.tax.price_decimals,
                    ),
                    None => Vec::new(),
                };
                Ok(QuoteFee {
                    name: fee.name.trim().to_string(),
                    tax_class: fee.tax_class.clone(),
                    total: fee.amount,
                    total_tax: tax::total(&taxes),
                    taxes,
                })
            })
            .collect()
    }
}

/// Splits each line's net discount (and its tax) across the coupons that
/// touched it, weighted by what each coupon took.
fn split_coupon_discounts(lines: &[QuoteLine], applied: &[Coupon], allocations: &[Vec<Money>]) -> Vec<QuoteCoupon> {
    let mut coupons: Vec<QuoteCoupon> = applied
        .iter()
        .map(|c| QuoteCoupon {
            coupon_id: c.id.clone(),
            code: c.code.clone(),
            discount_type: c.discount_type,
            discount: Money::ZERO,
            discount_tax: Money::ZERO,
        })
        .collect();

    for (i, line) in lines.iter().enumerate() {
        let weights: Vec<Money> = allocations.iter().map(|a| a[i]).collect();
        if weights.iter().all(|w| w.is_zero()) {
            continue;
        }
        let discounts = line.discount.allocate(&weights);
        let discount_taxes = line.discount_tax.allocate(&weights);
        for (coupon, (discount, discount_tax)) in coupons.iter_mut().zip(discounts.into_iter().zip(discount_taxes)) {
            coupon.discount += discount;
            coupon.discount_tax += discount_tax;
        }
    }

    coupons
}

fn summarize_taxes(lines: &[QuoteLine], fees: &[QuoteFee], shipping: Option<&QuoteShipping>) -> Vec<QuoteTax> {
    let mut summary: Vec<QuoteTax> = Vec::new();
    let mut add = |line: &TaxLine, on_shipping: bool| {
        let index = match summary.iter().position(|t| t.rate_id == line.rate_id) {
            Some(index) => index,
            None => {
                summary.push(QuoteTax {
                    rate_id: line.rate_id.clone(),
                    label: line.label.clone(),
                    rate: line.rate,
                    compound: line.compound,
                    tax_amount: Money::ZERO,
                    shipping_tax_amount: Money::ZERO,
                });
                summary.len() - 1
            }
        };
        if on_shipping {
            summary[index].shipping_tax_amount += line.amount;
        } else {
            summary[index].tax_amount += line.amount;
        }
    };

    for line in lines.iter().flat_map(|l| &l.taxes).chain(fees.iter().flat_map(|f| &f.taxes)) {
        add(line, false);
    }
    for line in shipping.iter().flat_map(|s| &s.taxes) {
        add(line, true);
    }

    summary
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogSnapshot, Product};
    use crate::inventory::BackorderPolicy;
    use crate::tax::{TaxRate, TaxTable};

    fn m(s: &str) -> Money {
        s.parse().unwrap()
    }

    fn catalog() -> CatalogSnapshot {
        let mut ebook = Product::simple("ebook", "E-book", m("8.00"));
        ebook.is_virtual = true;
        CatalogSnapshot::new()
            .with_product(Product::simple("mug", "Mug", m("10.00")).with_stock(5, BackorderPolicy::No))
            .with_product(ebook)
    }

    fn us_tax() -> TaxContext {
        let mut rate = TaxRate::simple("us", "US", Rate::from_percent(8));
        rate.label = "Sales tax".to_string();
        rate.shipping = true;
        TaxContext::new(Jurisdiction::country("US"), TaxTable::new(vec![rate]))
    }

    fn flat_rate() -> ShippingSelection {
        ShippingSelection::new("flat_rate", "Flat rate", m("5.00"))
    }

    #[test]
    fn test_basic_cart_totals() {
        let (catalog, coupons, tax) = (catalog(), CouponBook::default(), us_tax());
        let request = QuoteRequest::new(vec![CartLine::new("mug", 2)]).shipping(flat_rate());
        let quote = CartAggregator::new(&catalog, &coupons, &tax).quote(&request).unwrap();

        assert_eq!(quote.totals.subtotal, m("20.00"));
        assert_eq!(quote.totals.cart_tax, m("1.60"));
        assert_eq!(quote.totals.shipping_total, m("5.00"));
        assert_eq!(quote.totals.shipping_tax, m("0.40"));
        assert_eq!(quote.totals.total, m("27.00"));
        assert_eq!(quote.taxes.len(), 1);
        assert_eq!(quote.taxes[0].tax_amount, m("1.60"));
        assert_eq!(quote.taxes[0].shipping_tax_amount, m("0.40"));
        assert!(quote.verify_totals().is_ok());
    }

    #[test]
    fn test_fixed_cart_coupon_before_tax() {
        let (catalog, tax) = (catalog(), us_tax());
        let coupons = CouponBook::new(vec![Coupon::new("c1", "FIVEOFF", DiscountType::FixedCart, m("5.00"))]);
        let request = QuoteRequest::new(vec![CartLine::new("mug", 2)])
            .coupon("fiveoff")
            .shipping(flat_rate());
        let quote = CartAggregator::new(&catalog, &coupons, &tax).quote(&request).unwrap();

        assert_eq!(quote.lines[0].total, m("15.00"));
        assert_eq!(quote.totals.cart_tax, m("1.20"));
        assert_eq!(quote.totals.discount_total, m("5.00"));
        assert_eq!(quote.totals.discount_tax, m("0.40"));
        assert_eq!(quote.totals.total, m("21.60"));
        assert_eq!(quote.coupons[0].discount, m("5.00"));
    }

    #[test]
    fn test_coupon_order_is_significant() {
        let (catalog, tax) = (catalog(), us_tax());
        let coupons = CouponBook::new(vec![
            Coupon::new("c1", "FIVEOFF", DiscountType::FixedCart, m("5.00")),
            Coupon::new("c2", "HALF", DiscountType::Percent, m("50")),
        ]);
        let aggregator = CartAggregator::new(&catalog, &coupons, &tax);

        let fixed_first = QuoteRequest::new(vec![CartLine::new("ebook", 1)]).coupon("FIVEOFF").coupon("HALF");
        let percent_first = QuoteRequest::new(vec![CartLine::new("ebook", 1)]).coupon("HALF").coupon("FIVEOFF");

        // 8.00 - 5.00 = 3.00, half of that is 1.50 → 1.50 left
        assert_eq!(aggregator.quote(&fixed_first).unwrap().lines[0].total, m("1.50"));
        // half of 8.00 is 4.00, 4.00 - 5.00 clamps at 0
        assert_eq!(aggregator.quote(&percent_first).unwrap().lines[0].total, Money::ZERO);
    }

    #[test]
    fn test_tax_inclusive_prices() {
        let catalog = CatalogSnapshot::new().with_product({
            let mut p = Product::simple("tee", "Tee", m("10.80"));
            p.is_virtual = true;
            p
        });
        let tax = us_tax().prices_include_tax(true);
        let coupons = CouponBook::new(vec![Coupon::new("c1", "OFF", DiscountType::FixedCart, m("1.08"))]);
        let aggregator = CartAggregator::new(&catalog, &coupons, &tax);

        let quote = aggregator.quote(&QuoteRequest::new(vec![CartLine::new("tee", 1)])).unwrap();
        assert_eq!(quote.lines[0].subtotal, m("10.00"));
        assert_eq!(quote.lines[0].total_tax, m("0.80"));
        assert_eq!(quote.totals.total, m("10.80"));

        let quote = aggregator
            .quote(&QuoteRequest::new(vec![CartLine::new("tee", 1)]).coupon("OFF"))
            .unwrap();
        assert_eq!(quote.lines[0].total, m("9.00"));
        assert_eq!(quote.totals.discount_total, m("1.00"));
        assert_eq!(quote.totals.discount_tax, m("0.08"));
        assert_eq!(quote.totals.total, m("9.72"));
        assert!(quote.verify_totals().is_ok());
    }

    #[test]
    fn test_fees_are_taxed_when_classed() {
        let (catalog, coupons, tax) = (catalog(), CouponBook::default(), us_tax());
        let request = QuoteRequest::new(vec![CartLine::new("ebook", 1)])
            .fee(FeeRequest {
                name: "Gift wrap".to_string(),
                amount: m("2.00"),
                tax_class: Some("standard".to_string()),
            })
            .fee(FeeRequest {
                name: "Handling".to_string(),
                amount: m("1.00"),
                tax_class: None,
            });
        let quote = CartAggregator::new(&catalog, &coupons, &tax).quote(&request).unwrap();

        assert_eq!(quote.totals.fee_total, m("3.00"));
        assert_eq!(quote.totals.cart_tax, m("0.80"));
        assert_eq!(quote.totals.total, m("11.80"));
    }

    #[test]
    fn test_amounts_past_the_input_ceiling_are_rejected() {
        let (catalog, coupons, tax) = (catalog(), CouponBook::default(), us_tax());
        let aggregator = CartAggregator::new(&catalog, &coupons, &tax);
        let too_much = Money::MAX + m("0.01");

        let fee = QuoteRequest::new(vec![CartLine::new("ebook", 1)]).fee(FeeRequest {
            name: "Handling".to_string(),
            amount: too_much,
            tax_class: None,
        });
        assert!(matches!(
            aggregator.quote(&fee),
            Err(CoreError::Validation(ValidationError::OutOfRange { .. }))
        ));

        let shipping = QuoteRequest::new(vec![CartLine::new("mug", 1)])
            .shipping(ShippingSelection::new("flat_rate", "Flat rate", too_much));
        assert!(matches!(
            aggregator.quote(&shipping),
            Err(CoreError::Validation(ValidationError::OutOfRange { .. }))
        ));

        let mut many = QuoteRequest::new(vec![CartLine::new("ebook", 1)]);
        for i in 0..=crate::MAX_CART_LINES {
            many = many.fee(FeeRequest {
                name: format!("Fee {i}"),
                amount: m("0.01"),
                tax_class: None,
            });
        }
        assert!(matches!(
            aggregator.quote(&many),
            Err(CoreError::Validation(ValidationError::OutOfRange { .. }))
        ));
    }

    #[test]
    fn test_unavailable_items() {
        let (catalog, coupons, tax) = (catalog(), CouponBook::default(), us_tax());
        let aggregator = CartAggregator::new(&catalog, &coupons, &tax);

        let missing = QuoteRequest::new(vec![CartLine::new("nope", 1)]);
        assert!(matches!(
            aggregator.quote(&missing),
            Err(CoreError::ItemUnavailable { reason: UnavailableReason::NotFound, .. })
        ));

        let too_many = QuoteRequest::new(vec![CartLine::new("mug", 3), CartLine::new("mug", 3)]).shipping(flat_rate());
        assert!(matches!(
            aggregator.quote(&too_many),
            Err(CoreError::ItemUnavailable { reason: UnavailableReason::OutOfStock, .. })
        ));

        assert!(matches!(aggregator.quote(&QuoteRequest::default()), Err(CoreError::EmptyCart)));
    }

    #[test]
    fn test_shipping_selection_rules() {
        let (catalog, coupons, tax) = (catalog(), CouponBook::default(), us_tax());
        let aggregator = CartAggregator::new(&catalog, &coupons, &tax);

        let no_shipping = QuoteRequest::new(vec![CartLine::new("mug", 1)]);
        assert!(matches!(
            aggregator.quote(&no_shipping),
            Err(CoreError::InvalidShippingSelection { .. })
        ));

        let negative = QuoteRequest::new(vec![CartLine::new("mug", 1)])
            .shipping(ShippingSelection::new("flat_rate", "Flat", m("-1.00")));
        assert!(matches!(aggregator.quote(&negative), Err(CoreError::InvalidShippingSelection { .. })));

        let virtual_only = QuoteRequest::new(vec![CartLine::new("ebook", 1)]);
        assert!(aggregator.quote(&virtual_only).unwrap().shipping.is_none());
    }

    #[test]
    fn test_free_shipping_coupon_zeroes_shipping() {
        let (catalog, tax) = (catalog(), us_tax());
        let mut free = Coupon::new("c1", "SHIPFREE", DiscountType::FixedCart, Money::ZERO);
        free.free_shipping = true;
        let coupons = CouponBook::new(vec![
            free,
            Coupon::new("c2", "FIVEOFF", DiscountType::FixedCart, m("5.00")),
        ]);
        let aggregator = CartAggregator::new(&catalog, &coupons, &tax);

        let quote = aggregator
            .quote(&QuoteRequest::new(vec![CartLine::new("mug", 2)]).shipping(flat_rate()).coupon("shipfree"))
            .unwrap();
        let shipping = quote.shipping.as_ref().unwrap();
        assert_eq!(shipping.method_id, "flat_rate");
        assert_eq!(shipping.total, Money::ZERO);
        assert!(shipping.taxes.is_empty());
        assert_eq!(quote.totals.shipping_total, Money::ZERO);
        assert_eq!(quote.totals.shipping_tax, Money::ZERO);
        assert_eq!(quote.totals.total, m("21.60"));
        quote.verify_totals().unwrap();

        // an ordinary coupon leaves shipping alone
        let quote = aggregator
            .quote(&QuoteRequest::new(vec![CartLine::new("mug", 2)]).shipping(flat_rate()).coupon("FIVEOFF"))
            .unwrap();
        assert_eq!(quote.totals.shipping_total, m("5.00"));
        assert_eq!(quote.totals.shipping_tax, m("0.40"));
    }

    #[test]
    fn test_coupon_rejections_surface() {
        let (catalog, tax) = (catalog(), us_tax());
        let coupons = CouponBook::new(vec![Coupon::new("c1", "TEN", DiscountType::Percent, m("10"))]);
        let aggregator = CartAggregator::new(&catalog, &coupons, &tax);

        let twice = QuoteRequest::new(vec![CartLine::new("ebook", 1)]).coupon("TEN").coupon("ten");
        assert!(matches!(
            aggregator.quote(&twice),
            Err(CoreError::CouponRejected { reason: CouponRejection::AlreadyApplied, .. })
        ));

        let unknown = QuoteRequest::new(vec![CartLine::new("ebook", 1)]).coupon("GHOST");
        assert!(matches!(
            aggregator.quote(&unknown),
            Err(CoreError::CouponRejected { reason: CouponRejection::NotFound, .. })
        ));
    }

    #[test]
    fn test_stock_demand_sums_lines() {
        let (catalog, coupons, tax) = (catalog(), CouponBook::default(), us_tax());
        let request = QuoteRequest::new(vec![CartLine::new("mug", 1), CartLine::new("ebook", 1), CartLine::new("mug", 2)])
            .shipping(flat_rate());
        let quote = CartAggregator::new(&catalog, &coupons, &tax).quote(&request).unwrap();

        let demand = quote.stock_demand();
        assert_eq!(demand.len(), 1);
        assert_eq!(demand[0].0.item_id, "mug");
        assert_eq!(demand[0].1, 3);
    }
}
