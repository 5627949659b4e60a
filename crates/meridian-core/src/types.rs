//! # Shared Types
//!
//! Small value types used across the checkout modules.
//!
//! ```text
//! ┌─────────────────────┐  ┌─────────────────────┐  ┌─────────────────────┐
//! │    Jurisdiction     │  │  CustomerContext    │  │     ProductRef      │
//! │  ─────────────────  │  │  ─────────────────  │  │  ─────────────────  │
//! │  country  "US"      │  │  customer_id        │  │  product_id         │
//! │  state    "CA"      │  │  email              │  │  variation_id?      │
//! │  postcode "90210"   │  │  coupon_usage       │  │                     │
//! │  city     "LA"      │  │  (coupon → uses)    │  │                     │
//! └─────────────────────┘  └─────────────────────┘  └─────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tax class used when a product does not name one.
pub const STANDARD_TAX_CLASS: &str = "standard";

/// Normalizes an empty tax class to [`STANDARD_TAX_CLASS`].
pub fn normalize_tax_class(class: &str) -> &str {
    if class.trim().is_empty() {
        STANDARD_TAX_CLASS
    } else {
        class
    }
}

// =============================================================================
// Jurisdiction
// =============================================================================

/// The geographic key used to resolve tax rates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jurisdiction {
    /// ISO 3166-1 alpha-2 country code.
    pub country: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub postcode: String,
    #[serde(default)]
    pub city: String,
}

impl Jurisdiction {
    pub fn new(
        country: impl Into<String>,
        state: impl Into<String>,
        postcode: impl Into<String>,
        city: impl Into<String>,
    ) -> Self {
        Jurisdiction {
            country: country.into(),
            state: state.into(),
            postcode: postcode.into(),
            city: city.into(),
        }
    }

    /// Country-only jurisdiction.
    pub fn country(country: impl Into<String>) -> Self {
        Jurisdiction {
            country: country.into(),
            ..Default::default()
        }
    }
}

// =============================================================================
// Product Reference
// =============================================================================

/// Points at a product, or at one variation of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductRef {
    pub product_id: String,
    #[serde(default)]
    pub variation_id: Option<String>,
}

impl ProductRef {
    pub fn product(product_id: impl Into<String>) -> Self {
        ProductRef {
            product_id: product_id.into(),
            variation_id: None,
        }
    }

    pub fn variation(product_id: impl Into<String>, variation_id: impl Into<String>) -> Self {
        ProductRef {
            product_id: product_id.into(),
            variation_id: Some(variation_id.into()),
        }
    }

    /// The most specific id: the variation when present.
    pub fn leaf_id(&self) -> &str {
        self.variation_id.as_deref().unwrap_or(&self.product_id)
    }

    /// True when `id` names either the product or the variation.
    pub fn is(&self, id: &str) -> bool {
        self.product_id == id || self.variation_id.as_deref() == Some(id)
    }
}

// =============================================================================
// Customer Context
// =============================================================================

/// What the checkout knows about who is buying.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerContext {
    /// Registered customer; `None` for guests.
    #[serde(default)]
    pub customer_id: Option<String>,

    /// Billing email, used by coupon email restrictions.
    #[serde(default)]
    pub email: Option<String>,

    /// Past uses per coupon id by this customer (or email for guests).
    #[serde(default)]
    pub coupon_usage: HashMap<String, u32>,
}

impl CustomerContext {
    pub fn guest() -> Self {
        Self::default()
    }

    pub fn registered(customer_id: impl Into<String>, email: impl Into<String>) -> Self {
        CustomerContext {
            customer_id: Some(customer_id.into()),
            email: Some(email.into()),
            coupon_usage: HashMap::new(),
        }
    }

    /// How many times this customer already used `coupon_id`.
    pub fn uses_of(&self, coupon_id: &str) -> u32 {
        self.coupon_usage.get(coupon_id).copied().unwrap_or(0)
    }
}
