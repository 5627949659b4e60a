//! # Coupon Validator
//!
//! Decides whether a coupon may be applied to a cart and how much it takes
//! off each line.
//!
//! ## Check Order
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  validate(coupon, cart, customer)       first failure wins              │
//! │                                                                         │
//! │  1. expired               date_expires < now         → Expired          │
//! │  2. not yet usable        status draft / pending     → NotActive        │
//! │  3. usage_limit           usage_count >= limit       → UsageLimitReached│
//! │  4. per-user limit        customer uses >= limit     → UserUsage...     │
//! │  5. cart amount           below min / above max      → Minimum/Maximum  │
//! │  6. applicability         email, products,           → EmailRestricted  │
//! │                           categories, sale items       NotApplicable    │
//! │                                                        NoEligibleItems  │
//! │  7. individual use        conflicts with applied     → IndividualUse... │
//! │                                                                         │
//! │  Accept → discount + per-line allocation                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Discounts
//! - `percent` / `percent_product`: percentage of each eligible line's
//!   *remaining* base (after coupons applied earlier in the same cart)
//! - `fixed_cart`: flat amount spread over eligible lines in proportion to
//!   their remaining base, never more than what remains
//! - `fixed_product`: amount × quantity per eligible line, clamped per line
//!
//! Acceptance here is only a reservation. `usage_count` is incremented at
//! settlement commit, which rechecks the limit under a lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::money::Money;
use crate::rate::Rate;
use crate::types::CustomerContext;

// =============================================================================
// Coupon Model
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    /// Percentage off the cart.
    Percent,
    /// Flat amount off the cart.
    FixedCart,
    /// Flat amount off each matching unit.
    FixedProduct,
    /// Percentage off matching products.
    PercentProduct,
}

impl DiscountType {
    pub fn is_percentage(&self) -> bool {
        matches!(self, DiscountType::Percent | DiscountType::PercentProduct)
    }

    pub fn is_product_level(&self) -> bool {
        matches!(self, DiscountType::FixedProduct | DiscountType::PercentProduct)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum CouponStatus {
    #[default]
    Publish,
    Draft,
    Pending,
    /// Usable, just not advertised.
    Private,
}

impl CouponStatus {
    pub fn is_usable(&self) -> bool {
        matches!(self, CouponStatus::Publish | CouponStatus::Private)
    }
}

/// A coupon as the validator sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coupon {
    pub id: String,
    /// Unique per store, compared case-insensitively.
    pub code: String,
    pub discount_type: DiscountType,
    /// Money for fixed types; for percentage types the percent value
    /// (10.0000 means 10%).
    pub amount: Money,
    #[serde(default)]
    pub status: CouponStatus,
    #[serde(default)]
    pub date_expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_count: i64,
    #[serde(default)]
    pub usage_limit: Option<i64>,
    #[serde(default)]
    pub usage_limit_per_user: Option<i64>,
    /// Caps how many units a product-level coupon discounts.
    #[serde(default)]
    pub limit_usage_to_x_items: Option<i64>,
    #[serde(default)]
    pub individual_use: bool,
    #[serde(default)]
    pub product_ids: Vec<String>,
    #[serde(default)]
    pub excluded_product_ids: Vec<String>,
    #[serde(default)]
    pub category_ids: Vec<String>,
    #[serde(default)]
    pub excluded_category_ids: Vec<String>,
    #[serde(default)]
    pub exclude_sale_items: bool,
    #[serde(default)]
    pub minimum_amount: Option<Money>,
    #[serde(default)]
    pub maximum_amount: Option<Money>,
    /// Exact addresses or `*@domain` patterns.
    #[serde(default)]
    pub email_restrictions: Vec<String>,
    /// Zeroes the order's shipping when accepted.
    #[serde(default)]
    pub free_shipping: bool,
}

impl Coupon {
    /// A published coupon with no restrictions.
    pub fn new(id: impl Into<String>, code: impl Into<String>, discount_type: DiscountType, amount: Money) -> Self {
        Coupon {
            id: id.into(),
            code: code.into(),
            discount_type,
            amount,
            status: CouponStatus::Publish,
            date_expires: None,
            usage_count: 0,
            usage_limit: None,
            usage_limit_per_user: None,
            limit_usage_to_x_items: None,
            individual_use: false,
            product_ids: Vec::new(),
            excluded_product_ids: Vec::new(),
            category_ids: Vec::new(),
            excluded_category_ids: Vec::new(),
            exclude_sale_items: false,
            minimum_amount: None,
            maximum_amount: None,
            email_restrictions: Vec::new(),
            free_shipping: false,
        }
    }

    /// Lookup key for codes.
    pub fn normalize_code(code: &str) -> String {
        code.trim().to_lowercase()
    }

    /// The percentage for percent types.
    pub fn percentage(&self) -> Rate {
        Rate::from_ppm(self.amount.units().clamp(0, Rate::PPM_SCALE as i64) as u32)
    }

    pub fn remaining_uses(&self) -> Option<i64> {
        self.usage_limit.map(|limit| (limit - self.usage_count).max(0))
    }

    fn email_allowed(&self, email: Option<&str>) -> bool {
        if self.email_restrictions.is_empty() {
            return true;
        }
        let Some(email) = email else {
            return false;
        };
        let email = email.trim().to_lowercase();
        self.email_restrictions.iter().any(|allowed| {
            let allowed = allowed.trim().to_lowercase();
            match allowed.strip_prefix('*') {
                Some(suffix) => email.ends_with(suffix),
                None => allowed == email,
            }
        })
    }

    fn line_matches(&self, line: &CouponLine) -> bool {
        let named = |ids: &[String]| {
            ids.iter()
                .any(|id| id == &line.product_id || line.variation_id.as_deref() == Some(id.as_str()))
        };
        let in_category = |ids: &[String]| ids.iter().any(|id| line.category_ids.contains(id));

        if !self.product_ids.is_empty() && !named(&self.product_ids) {
            return false;
        }
        if named(&self.excluded_product_ids) {
            return false;
        }
        if !self.category_ids.is_empty() && !in_category(&self.category_ids) {
            return false;
        }
        !in_category(&self.excluded_category_ids)
    }

    fn line_eligible(&self, line: &CouponLine) -> bool {
        self.line_matches(line) && !(self.exclude_sale_items && line.on_sale) && line.remaining.is_positive()
    }
}

// =============================================================================
// Rejection Reasons
// =============================================================================

/// Machine-readable reason a coupon was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CouponRejection {
    NotFound,
    AlreadyApplied,
    Expired,
    NotActive,
    UsageLimitReached,
    UserUsageLimitReached,
    MinimumNotMet { minimum: Money, subtotal: Money },
    MaximumExceeded { maximum: Money, subtotal: Money },
    EmailRestricted,
    /// No line satisfies the product and category rules.
    NotApplicable,
    /// Lines match, but all of them are on sale (when excluded) or already
    /// fully discounted.
    NoEligibleItems,
    IndividualUseConflict { other_code: String },
}

impl CouponRejection {
    pub fn code(&self) -> &'static str {
        match self {
            CouponRejection::NotFound => "COUPON_NOT_FOUND",
            CouponRejection::AlreadyApplied => "COUPON_ALREADY_APPLIED",
            CouponRejection::Expired => "COUPON_EXPIRED",
            CouponRejection::NotActive => "COUPON_NOT_ACTIVE",
            CouponRejection::UsageLimitReached => "COUPON_USAGE_LIMIT_REACHED",
            CouponRejection::UserUsageLimitReached => "COUPON_USER_USAGE_LIMIT_REACHED",
            CouponRejection::MinimumNotMet { .. } => "COUPON_MINIMUM_NOT_MET",
            CouponRejection::MaximumExceeded { .. } => "COUPON_MAXIMUM_EXCEEDED",
            CouponRejection::EmailRestricted => "COUPON_EMAIL_RESTRICTED",
            CouponRejection::NotApplicable => "COUPON_NOT_APPLICABLE",
            CouponRejection::NoEligibleItems => "COUPON_NO_ELIGIBLE_ITEMS",
            CouponRejection::IndividualUseConflict { .. } => "COUPON_INDIVIDUAL_USE_CONFLICT",
        }
    }
}

impl fmt::Display for CouponRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CouponRejection::NotFound => write!(f, "coupon does not exist"),
            CouponRejection::AlreadyApplied => write!(f, "coupon is already applied"),
            CouponRejection::Expired => write!(f, "coupon has expired"),
            CouponRejection::NotActive => write!(f, "coupon is not active yet"),
            CouponRejection::UsageLimitReached => write!(f, "coupon usage limit has been reached"),
            CouponRejection::UserUsageLimitReached => {
                write!(f, "customer has used this coupon the maximum number of times")
            }
            CouponRejection::MinimumNotMet { minimum, subtotal } => {
                write!(f, "minimum spend is {}, cart is {}", minimum, subtotal)
            }
            CouponRejection::MaximumExceeded { maximum, subtotal } => {
                write!(f, "maximum spend is {}, cart is {}", maximum, subtotal)
            }
            CouponRejection::EmailRestricted => write!(f, "coupon is restricted to other email addresses"),
            CouponRejection::NotApplicable => write!(f, "coupon does not apply to any item in the cart"),
            CouponRejection::NoEligibleItems => write!(f, "no item in the cart can take this discount"),
            CouponRejection::IndividualUseConflict { other_code } => {
                write!(f, "coupon cannot be combined with '{}'", other_code)
            }
        }
    }
}

// =============================================================================
// Validation Input / Output
// =============================================================================

/// A cart line as seen by the validator.
#[derive(Debug, Clone)]
pub struct CouponLine {
    pub product_id: String,
    pub variation_id: Option<String>,
    pub category_ids: Vec<String>,
    pub quantity: i64,
    pub on_sale: bool,
    /// Price × quantity before any coupon.
    pub subtotal: Money,
    /// What is left after coupons applied earlier.
    pub remaining: Money,
}

/// The cart a coupon is validated against.
#[derive(Debug, Clone, Copy)]
pub struct CouponCart<'a> {
    pub lines: &'a [CouponLine],
    /// Coupons accepted earlier, in submission order.
    pub applied: &'a [Coupon],
}

impl CouponCart<'_> {
    pub fn subtotal(&self) -> Money {
        self.lines.iter().map(|l| l.subtotal).sum()
    }
}

/// Outcome of [`CouponValidator::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CouponDecision {
    /// `allocations[i]` is the discount taken from `cart.lines[i]`.
    Accept {
        discount: Money,
        allocations: Vec<Money>,
    },
    Reject(CouponRejection),
}

// =============================================================================
// Validator
// =============================================================================

/// Stateless apart from the clock it checks expiry against.
#[derive(Debug, Clone, Copy)]
pub struct CouponValidator {
    now: DateTime<Utc>,
}

impl CouponValidator {
    pub fn new(now: DateTime<Utc>) -> Self {
        CouponValidator { now }
    }

    /// Runs the checks in order and computes the discount on acceptance.
    pub fn validate(&self, coupon: &Coupon, cart: CouponCart<'_>, customer: &CustomerContext) -> CouponDecision {
        match self.check(coupon, cart, customer) {
            Ok(eligible) => {
                let allocations = discount_allocations(coupon, cart.lines, &eligible);
                let discount = allocations.iter().sum();
                CouponDecision::Accept { discount, allocations }
            }
            Err(reason) => CouponDecision::Reject(reason),
        }
    }

    /// Returns the eligibility mask on success.
    fn check(&self, coupon: &Coupon, cart: CouponCart<'_>, customer: &CustomerContext) -> Result<Vec<bool>, CouponRejection> {
        if coupon.date_expires.is_some_and(|expires| expires < self.now) {
            return Err(CouponRejection::Expired);
        }

        if !coupon.status.is_usable() {
            return Err(CouponRejection::NotActive);
        }

        if coupon.remaining_uses() == Some(0) {
            return Err(CouponRejection::UsageLimitReached);
        }

        if let Some(per_user) = coupon.usage_limit_per_user {
            if i64::from(customer.uses_of(&coupon.id)) >= per_user {
                return Err(CouponRejection::UserUsageLimitReached);
            }
        }

        let subtotal = cart.subtotal();
        if let Some(minimum) = coupon.minimum_amount {
            if subtotal < minimum {
                return Err(CouponRejection::MinimumNotMet { minimum, subtotal });
            }
        }
        if let Some(maximum) = coupon.maximum_amount {
            if subtotal > maximum {
                return Err(CouponRejection::MaximumExceeded { maximum, subtotal });
            }
        }

        if !coupon.email_allowed(customer.email.as_deref()) {
            return Err(CouponRejection::EmailRestricted);
        }
        if !cart.lines.iter().any(|l| coupon.line_matches(l)) {
            return Err(CouponRejection::NotApplicable);
        }
        let eligible: Vec<bool> = cart.lines.iter().map(|l| coupon.line_eligible(l)).collect();
        if !eligible.iter().any(|e| *e) {
            return Err(CouponRejection::NoEligibleItems);
        }

        if coupon.individual_use {
            if let Some(other) = cart.applied.first() {
                return Err(CouponRejection::IndividualUseConflict {
                    other_code: other.code.clone(),
                });
            }
        }
        if let Some(other) = cart.applied.iter().find(|c| c.individual_use) {
            return Err(CouponRejection::IndividualUseConflict {
                other_code: other.code.clone(),
            });
        }

        Ok(eligible)
    }
}

fn discount_allocations(coupon: &Coupon, lines: &[CouponLine], eligible: &[bool]) -> Vec<Money> {
    let mut allocations = vec![Money::ZERO; lines.len()];
    let mut units_left = coupon.limit_usage_to_x_items.filter(|_| coupon.discount_type.is_product_level());

    match coupon.discount_type {
        DiscountType::Percent | DiscountType::PercentProduct => {
            let pct = coupon.percentage();
            for (i, line) in lines.iter().enumerate() {
                if !eligible[i] || !line.remaining.is_positive() {
                    continue;
                }
                let units = take_units(&mut units_left, line.quantity);
                let base = if units == line.quantity {
                    line.remaining
                } else {
                    (line.remaining * units).divide_by(line.quantity).unwrap_or(Money::ZERO)
                };
                allocations[i] = base.apply_rate(pct).min(line.remaining);
            }
        }
        DiscountType::FixedProduct => {
            for (i, line) in lines.iter().enumerate() {
                if !eligible[i] || !line.remaining.is_positive() {
                    continue;
                }
                let units = take_units(&mut units_left, line.quantity);
                allocations[i] = coupon.amount.multiply_quantity(units).clamp_non_negative().min(line.remaining);
            }
        }
        DiscountType::FixedCart => {
            let weights: Vec<Money> = lines
                .iter()
                .enumerate()
                .map(|(i, l)| if eligible[i] { l.remaining.clamp_non_negative() } else { Money::ZERO })
                .collect();
            let available: Money = weights.iter().sum();
            let discount = coupon.amount.clamp_non_negative().min(available);
            if discount.is_positive() {
                allocations = discount.allocate(&weights);
            }
        }
    }

    allocations
}

// =============================================================================
// Coupon Book
// =============================================================================

/// Coupons available to a quote, looked up by code in any case.
#[derive(Debug, Clone, Default)]
pub struct CouponBook {
    by_code: HashMap<String, Coupon>,
}

impl CouponBook {
    pub fn new(coupons: impl IntoIterator<Item = Coupon>) -> Self {
        let mut book = CouponBook::default();
        for coupon in coupons {
            book.insert(coupon);
        }
        book
    }

    pub fn insert(&mut self, coupon: Coupon) {
        self.by_code.insert(Coupon::normalize_code(&coupon.code), coupon);
    }

    pub fn get(&self, code: &str) -> Option<&Coupon> {
        self.by_code.get(&Coupon::normalize_code(code))
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

/// Units of a line a product coupon may still discount.
fn take_units(units_left: &mut Option<i64>, quantity: i64) -> i64 {
    match units_left {
        Some(left) => {
            let units = quantity.min(*left).max(0);
            *left -= units;
            units
        }
        None => quantity,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
