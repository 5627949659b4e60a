//! # Money Module
//!
//! Fixed-point monetary values for every amount the engine touches.
//!
//! ## Representation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SCALE 4 FIXED POINT                                                    │
//! │                                                                         │
//! │    10.00   ──►  Money(100_000)                                          │
//! │     0.0825 ──►  Money(825)                                              │
//! │    -5.50   ──►  Money(-55_000)                                          │
//! │                                                                         │
//! │  Addition, subtraction and quantity multiplication are exact.           │
//! │  Rounding happens ONLY at named rounding points:                        │
//! │    • round_dp()      tax line totals (store price decimals)             │
//! │    • apply_rate()    percentage of an amount, back to scale 4           │
//! │    • extract_rate()  tax portion of a tax-inclusive amount              │
//! │    • allocate()      per-line splits, remainder distributed exactly     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use meridian_core::money::Money;
//! use meridian_core::rate::Rate;
//!
//! let price: Money = "10.00".parse().unwrap();
//! let line = price.multiply_quantity(2);
//! let tax = line.apply_rate(Rate::from_percent(8)).round_dp(2);
//! assert_eq!(tax.to_string(), "1.60");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};
use std::str::FromStr;

use crate::error::ValidationError;
use crate::rate::Rate;

/// Number of decimal places carried by [`Money`].
pub const SCALE: u32 = 4;

/// Units per one major currency unit (10^SCALE).
pub const UNITS_PER_MAJOR: i64 = 10_000;

// =============================================================================
// Money Type
// =============================================================================

/// A signed amount in ten-thousandths of the settlement currency.
///
/// ## Design Decisions
/// - **i64**: negative values carry refunds, discounts and ledger debits
/// - **Scale 4**: percentages and tax-inclusive splits keep sub-cent detail
///   until a rounding point, so summed lines never drift
/// - **Transparent serde**: serialized as the raw integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Zero.
    pub const ZERO: Money = Money(0);

    /// Largest amount accepted as input (100,000,000.0000).
    ///
    /// A full cart at this unit price still sums inside `i64`.
    pub const MAX: Money = Money(1_000_000_000_000);

    /// Creates a value from raw scale-4 units.
    #[inline]
    pub const fn from_units(units: i64) -> Self {
        Money(units)
    }

    /// Raw scale-4 units.
    #[inline]
    pub const fn units(&self) -> i64 {
        self.0
    }

    /// Creates a value from major and minor (hundredths) parts.
    ///
    /// ## Example
    /// ```rust
    /// use meridian_core::money::Money;
    ///
    /// assert_eq!(Money::from_major_minor(10, 99).units(), 109_900);
    /// assert_eq!(Money::from_major_minor(-5, 50).units(), -55_000);
    /// ```
    ///
    /// Only the major part carries the sign: `(-5, 50)` is -5.50.
    #[inline]
    pub const fn from_major_minor(major: i64, minor: i64) -> Self {
        if major < 0 {
            Money(major * UNITS_PER_MAJOR - minor * 100)
        } else {
            Money(major * UNITS_PER_MAJOR + minor * 100)
        }
    }

    /// Creates a value from an integer count of the currency's minor unit,
    /// where the minor unit has `decimals` places (2 for cents).
    pub fn from_minor(minor: i64, decimals: u32) -> Self {
        let decimals = decimals.min(SCALE);
        Money(minor * 10_i64.pow(SCALE - decimals))
    }

    /// Whole major units, truncated toward zero.
    #[inline]
    pub const fn major(&self) -> i64 {
        self.0 / UNITS_PER_MAJOR
    }

    /// Fractional units (always 0..=9999).
    #[inline]
    pub const fn fraction(&self) -> i64 {
        (self.0 % UNITS_PER_MAJOR).abs()
    }

    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub const fn abs(&self) -> Self {
        Money(self.0.abs())
    }

    /// Negative values become zero.
    #[inline]
    pub fn clamp_non_negative(self) -> Self {
        Money(self.0.max(0))
    }

    /// Multiplies by a quantity. Exact.
    ///
    /// ## Example
    /// ```rust
    /// use meridian_core::money::Money;
    ///
    /// let unit_price = Money::from_major_minor(2, 99);
    /// assert_eq!(unit_price.multiply_quantity(3), Money::from_major_minor(8, 97));
    /// ```
    #[inline]
    pub const fn multiply_quantity(&self, qty: i64) -> Self {
        Money(self.0 * qty)
    }

    /// Rounds to `dp` decimal places, half away from zero.
    ///
    /// This is the tax-line rounding point. `dp >= 4` is a no-op.
    ///
    /// ## Example
    /// ```rust
    /// use meridian_core::money::Money;
    ///
    /// assert_eq!(Money::from_units(8_250).round_dp(2), Money::from_units(8_300));
    /// assert_eq!(Money::from_units(-8_250).round_dp(2), Money::from_units(-8_300));
    /// assert_eq!(Money::from_units(8_249).round_dp(2), Money::from_units(8_200));
    /// ```
    pub fn round_dp(self, dp: u32) -> Self {
        if dp >= SCALE {
            return self;
        }
        let step = 10_i128.pow(SCALE - dp);
        let rounded = div_round_half_away(self.0 as i128, step) * step;
        Money(rounded as i64)
    }

    /// Returns `self × rate`, rounded half away from zero to scale 4.
    pub fn apply_rate(self, rate: Rate) -> Self {
        let product = self.0 as i128 * rate.ppm() as i128;
        Money(div_round_half_away(product, Rate::PPM_SCALE as i128) as i64)
    }

    /// Returns the tax portion of a tax-inclusive amount:
    /// `self × r / (1 + r)`, rounded half away from zero to scale 4.
    ///
    /// ## Example
    /// ```rust
    /// use meridian_core::money::Money;
    /// use meridian_core::rate::Rate;
    ///
    /// let gross = Money::from_major_minor(10, 80);
    /// assert_eq!(gross.extract_rate(Rate::from_percent(8)), Money::from_major_minor(0, 80));
    /// ```
    pub fn extract_rate(self, rate: Rate) -> Self {
        let numerator = self.0 as i128 * rate.ppm() as i128;
        let denominator = Rate::PPM_SCALE as i128 + rate.ppm() as i128;
        Money(div_round_half_away(numerator, denominator) as i64)
    }

    /// Divides `self` by `1 + rate`, rounded half away from zero.
    pub fn remove_rate(self, rate: Rate) -> Self {
        let numerator = self.0 as i128 * Rate::PPM_SCALE as i128;
        let denominator = Rate::PPM_SCALE as i128 + rate.ppm() as i128;
        Money(div_round_half_away(numerator, denominator) as i64)
    }

    /// Divides by a positive count, half away from zero. Returns `None` for 0.
    pub fn divide_by(self, count: i64) -> Option<Self> {
        if count == 0 {
            return None;
        }
        Some(Money(div_round_half_away(self.0 as i128, count as i128) as i64))
    }

    /// Splits `self` across `weights` proportionally.
    ///
    /// The parts always sum to exactly `self`. Leftover units from truncation
    /// go one at a time to the parts with the largest remainders (earlier
    /// index wins ties). When every weight is zero the whole amount lands on
    /// the first part.
    ///
    /// ## Example
    /// ```rust
    /// use meridian_core::money::Money;
    ///
    /// let parts = Money::from_units(10).allocate(&[Money::from_units(1); 3]);
    /// assert_eq!(parts, vec![Money::from_units(4), Money::from_units(3), Money::from_units(3)]);
    /// ```
    pub fn allocate(self, weights: &[Money]) -> Vec<Money> {
        if weights.is_empty() {
            return Vec::new();
        }

        let total_weight: i128 = weights.iter().map(|w| w.0.max(0) as i128).sum();
        let mut parts = vec![Money::ZERO; weights.len()];

        if total_weight == 0 {
            parts[0] = self;
            return parts;
        }

        let sign: i128 = if self.0 < 0 { -1 } else { 1 };
        let amount = (self.0 as i128).abs();

        let mut remainders: Vec<(usize, i128)> = Vec::with_capacity(weights.len());
        let mut assigned: i128 = 0;
        for (i, weight) in weights.iter().enumerate() {
            let scaled = amount * weight.0.max(0) as i128;
            let share = scaled / total_weight;
            parts[i] = Money((share * sign) as i64);
            assigned += share;
            remainders.push((i, scaled % total_weight));
        }

        remainders.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let mut leftover = amount - assigned;
        for (i, _) in remainders {
            if leftover == 0 {
                break;
            }
            parts[i] = Money(parts[i].0 + sign as i64);
            leftover -= 1;
        }

        parts
    }
}

/// Integer division rounding half away from zero. `d` must be positive.
fn div_round_half_away(n: i128, d: i128) -> i128 {
    let q = n / d;
    let r = n % d;
    if r.abs() * 2 >= d {
        q + n.signum()
    } else {
        q
    }
}

// =============================================================================
// Parsing and Display
// =============================================================================

/// Shows at least two decimals and trims trailing zeros beyond them:
/// `27.00`, `1.2345`, `-0.50`.
impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let mut fraction = format!("{:04}", self.fraction());
        while fraction.len() > 2 && fraction.ends_with('0') {
            fraction.pop();
        }
        write!(f, "{}{}.{}", sign, self.major().abs(), fraction)
    }
}

/// Parses plain decimal strings with up to four fractional digits.
impl FromStr for Money {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ValidationError::InvalidFormat {
            field: "amount".to_string(),
            reason: reason.to_string(),
        };

        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        if digits.is_empty() {
            return Err(invalid("empty amount"));
        }

        let (whole, fraction) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if fraction.len() > SCALE as usize {
            return Err(invalid("more than four decimal places"));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid("not a decimal number"));
        }

        let whole_units: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid("amount out of range"))?
        };
        let padded = format!("{:0<4}", fraction);
        let fraction_units: i64 = padded.parse().map_err(|_| invalid("not a decimal number"))?;

        let units = whole_units
            .checked_mul(UNITS_PER_MAJOR)
            .and_then(|u| u.checked_add(fraction_units))
            .ok_or_else(|| invalid("amount out of range"))?;

        Ok(Money(if negative { -units } else { units }))
    }
}

// =============================================================================
// Operators
// =============================================================================

impl Add for Money {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sub for Money {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Money(self.0 - other.0)
    }
}

impl SubAssign for Money {
    #[inline]
    fn sub_assign(&mut self, other: Self) {
        self.0 -= other.0;
    }
}

impl Neg for Money {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self {
        Money(-self.0)
    }
}

impl Mul<i64> for Money {
    type Output = Self;

    #[inline]
    fn mul(self, qty: i64) -> Self {
        Money(self.0 * qty)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, m| acc + *m)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn m(s: &str) -> Money {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(m("10.00").units(), 100_000);
        assert_eq!(m("0.0825").units(), 825);
        assert_eq!(m("-5.5").units(), -55_000);
        assert_eq!(m("7").units(), 70_000);

        assert_eq!(m("27").to_string(), "27.00");
        assert_eq!(m("1.2345").to_string(), "1.2345");
        assert_eq!(m("-0.5").to_string(), "-0.50");
        assert_eq!(Money::ZERO.to_string(), "0.00");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Money>().is_err());
        assert!("1.23456".parse::<Money>().is_err());
        assert!("12a".parse::<Money>().is_err());
        assert!("-".parse::<Money>().is_err());
    }

    #[test]
    fn test_from_minor() {
        assert_eq!(Money::from_minor(1099, 2), m("10.99"));
        assert_eq!(Money::from_minor(5, 0), m("5"));
    }

    #[test]
    fn test_round_dp_half_away_from_zero() {
        assert_eq!(m("0.825").round_dp(2), m("0.83"));
        assert_eq!(m("-0.825").round_dp(2), m("-0.83"));
        assert_eq!(m("0.8249").round_dp(2), m("0.82"));
        assert_eq!(m("1.2345").round_dp(4), m("1.2345"));
        assert_eq!(m("2.5").round_dp(0), m("3"));
    }

    #[test]
    fn test_apply_rate() {
        assert_eq!(m("20.00").apply_rate(Rate::from_percent(8)), m("1.60"));
        assert_eq!(m("10.00").apply_rate(Rate::from_bps(825)), m("0.825"));
        assert_eq!(m("0.0001").apply_rate(Rate::from_percent(50)), m("0.0001"));
    }

    #[test]
    fn test_extract_and_remove_rate() {
        let gross = m("10.80");
        let rate = Rate::from_percent(8);
        assert_eq!(gross.extract_rate(rate), m("0.80"));
        assert_eq!(gross.remove_rate(rate), m("10.00"));
    }

    #[test]
    fn test_divide_by() {
        assert_eq!(m("10.00").divide_by(3), Some(m("3.3333")));
        assert_eq!(m("20.00").divide_by(3), Some(m("6.6667")));
        assert_eq!(m("1").divide_by(0), None);
    }

    #[test]
    fn test_allocate_sums_exactly() {
        let parts = m("5.00").allocate(&[m("10.00"), m("20.00"), m("0.01")]);
        let total: Money = parts.iter().sum();
        assert_eq!(total, m("5.00"));
        assert!(parts[1] > parts[0]);

        let negative = m("-0.0010").allocate(&[Money::from_units(1); 3]);
        assert_eq!(negative.iter().sum::<Money>(), m("-0.0010"));
    }

    #[test]
    fn test_allocate_zero_weights() {
        let parts = m("3.00").allocate(&[Money::ZERO, Money::ZERO]);
        assert_eq!(parts, vec![m("3.00"), Money::ZERO]);
        assert!(m("3.00").allocate(&[]).is_empty());
    }

    #[test]
    fn test_max_cart_fits_in_i64() {
        let line = Money::MAX.units() as i128 * crate::MAX_ITEM_QUANTITY as i128;
        let cart = line * crate::MAX_CART_LINES as i128;
        assert!(cart < i64::MAX as i128);
    }

    #[test]
    fn test_arithmetic() {
        let a = m("10.00");
        let b = m("5.00");
        assert_eq!(a + b, m("15.00"));
        assert_eq!(a - b, m("5.00"));
        assert_eq!(a * 3, m("30.00"));
        assert_eq!(-a, m("-10.00"));
        assert_eq!((b - a).clamp_non_negative(), Money::ZERO);
    }
}
