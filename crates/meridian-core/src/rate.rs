//! # Rates
//!
//! Percentages for tax rates and percentage coupons.
//!
//! Stored as parts-per-million of the amount, which gives four decimal places
//! of percent: `8.875%` is `88_750`. A coupon's percentage amount stored as
//! [`Money`](crate::money::Money) maps onto the same integer (10.0000 percent
//! is 100_000 units and 100_000 ppm).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// A percentage with four decimals of precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rate(u32);

impl Rate {
    /// ppm representing 100%.
    pub const PPM_SCALE: u32 = 1_000_000;

    #[inline]
    pub const fn from_ppm(ppm: u32) -> Self {
        Rate(ppm)
    }

    /// 825 bps = 8.25%.
    #[inline]
    pub const fn from_bps(bps: u32) -> Self {
        Rate(bps * 100)
    }

    #[inline]
    pub const fn from_percent(percent: u32) -> Self {
        Rate(percent * 10_000)
    }

    #[inline]
    pub const fn ppm(&self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn zero() -> Self {
        Rate(0)
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Sum of two rates (non-compound rates sharing a priority).
    #[inline]
    pub const fn combine(self, other: Rate) -> Rate {
        Rate(self.0 + other.0)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / 10_000;
        let mut fraction = format!("{:04}", self.0 % 10_000);
        while fraction.ends_with('0') {
            fraction.pop();
        }
        if fraction.is_empty() {
            write!(f, "{}%", whole)
        } else {
            write!(f, "{}.{}%", whole, fraction)
        }
    }
}

/// Parses a percentage such as `"8"`, `"8.875"` or `"8.875%"`.
impl FromStr for Rate {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidFormat {
            field: "rate".to_string(),
            reason: format!("'{}' is not a percentage with at most four decimals", s),
        };

        let trimmed = s.trim().trim_end_matches('%');
        let (whole, fraction) = trimmed.split_once('.').unwrap_or((trimmed, ""));
        if whole.is_empty() || fraction.len() > 4 {
            return Err(invalid());
        }

        let whole: u32 = whole.parse().map_err(|_| invalid())?;
        let fraction: u32 = if fraction.is_empty() {
            0
        } else {
            format!("{:0<4}", fraction).parse().map_err(|_| invalid())?
        };

        whole
            .checked_mul(10_000)
            .and_then(|w| w.checked_add(fraction))
            .map(Rate)
            .ok_or_else(invalid)
    }
}
