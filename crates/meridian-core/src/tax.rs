//! # Tax Calculator
//!
//! Resolves which rates apply to a jurisdiction and tax class, and turns a
//! taxable amount into tax lines.
//!
//! ## Rate Resolution
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  rates(jurisdiction, tax_class)                                         │
//! │                                                                         │
//! │  1. Keep rates for the tax class whose location fields all match        │
//! │     (empty field = any; postcode supports 902* and 90000...90299)       │
//! │                                                                         │
//! │  2. Group by priority                                                   │
//! │                                                                         │
//! │  3. Inside each priority keep only the most specific tier:              │
//! │       postcode/city (3)  >  state (2)  >  country (1)  >  global (0)    │
//! │                                                                         │
//! │  4. Order by priority ascending, then table order                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Line Calculation
//! ```text
//!   base 10.00, rates: 5% (p1) + 2% compound (p2)
//!
//!   non-compound on base      5% × 10.00          = 0.50
//!   compound on running total 2% × (10.00 + 0.50) = 0.21
//!                                                  ─────
//!                                                   0.71
//! ```
//! Every line is rounded to the store's price decimals on its own. With
//! tax-inclusive prices the net base is derived first and the last line
//! absorbs rounding so the lines sum to exactly `gross - net`.
//!
//! No storage access: the caller hands in a [`TaxTable`] snapshot.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::money::Money;
use crate::rate::Rate;
use crate::types::{normalize_tax_class, Jurisdiction, STANDARD_TAX_CLASS};

// =============================================================================
// Tax Rate
// =============================================================================

/// One row of the rate table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxRate {
    pub id: String,
    pub label: String,
    /// Empty matches any country.
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub state: String,
    /// Exact, `prefix*` or `low...high`.
    #[serde(default)]
    pub postcode: String,
    #[serde(default)]
    pub city: String,
    pub rate: Rate,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub compound: bool,
    /// Also taxes shipping charged in this class.
    #[serde(default)]
    pub shipping: bool,
    #[serde(default = "default_tax_class")]
    pub tax_class: String,
    /// Tie-breaker inside a priority.
    #[serde(default)]
    pub order: u32,
}

fn default_priority() -> u32 {
    1
}

fn default_tax_class() -> String {
    STANDARD_TAX_CLASS.to_string()
}

impl TaxRate {
    /// A country-wide, non-compound standard rate.
    pub fn simple(id: impl Into<String>, country: impl Into<String>, rate: Rate) -> Self {
        let id = id.into();
        TaxRate {
            label: id.clone(),
            id,
            country: country.into(),
            state: String::new(),
            postcode: String::new(),
            city: String::new(),
            rate,
            priority: default_priority(),
            compound: false,
            shipping: false,
            tax_class: default_tax_class(),
            order: 0,
        }
    }

    /// True when every non-empty location field matches.
    pub fn matches(&self, jurisdiction: &Jurisdiction) -> bool {
        if !self.country.is_empty() && !self.country.eq_ignore_ascii_case(&jurisdiction.country) {
            return false;
        }
        if !self.state.is_empty() && !self.state.eq_ignore_ascii_case(&jurisdiction.state) {
            return false;
        }
        if !self.postcode.is_empty() && !postcode_matches(&self.postcode, &jurisdiction.postcode) {
            return false;
        }
        if !self.city.is_empty() && self.city.to_lowercase() != jurisdiction.city.to_lowercase() {
            return false;
        }
        true
    }

    /// Higher is more specific.
    pub fn specificity(&self) -> u8 {
        if !self.postcode.is_empty() || !self.city.is_empty() {
            3
        } else if !self.state.is_empty() {
            2
        } else if !self.country.is_empty() {
            1
        } else {
            0
        }
    }

    fn applies_to_class(&self, tax_class: &str) -> bool {
        normalize_tax_class(&self.tax_class) == normalize_tax_class(tax_class)
    }
}

fn normalize_postcode(postcode: &str) -> String {
    postcode
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

fn postcode_matches(pattern: &str, postcode: &str) -> bool {
    let pattern = normalize_postcode(pattern);
    let postcode = normalize_postcode(postcode);

    if let Some(prefix) = pattern.strip_suffix('*') {
        return postcode.starts_with(prefix);
    }

    if let Some((low, high)) = pattern.split_once("...") {
        return match (low.parse::<u64>(), high.parse::<u64>(), postcode.parse::<u64>()) {
            (Ok(low), Ok(high), Ok(code)) => low <= code && code <= high,
            _ => false,
        };
    }

    pattern == postcode
}

// =============================================================================
// Tax Table
// =============================================================================

/// Snapshot of the store's tax rates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaxTable {
    rates: Vec<TaxRate>,
}

impl TaxTable {
    pub fn new(rates: Vec<TaxRate>) -> Self {
        TaxTable { rates }
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// Rates applying to `tax_class` in `jurisdiction`, priority ascending.
    pub fn rates(&self, jurisdiction: &Jurisdiction, tax_class: &str) -> Vec<TaxRate> {
        let mut by_priority: BTreeMap<u32, Vec<&TaxRate>> = BTreeMap::new();
        for rate in self
            .rates
            .iter()
            .filter(|r| r.applies_to_class(tax_class) && r.matches(jurisdiction))
        {
            by_priority.entry(rate.priority).or_default().push(rate);
        }

        let mut resolved = Vec::new();
        for (_, group) in by_priority {
            let best = group.iter().map(|r| r.specificity()).max().unwrap_or(0);
            let mut winners: Vec<&TaxRate> =
                group.into_iter().filter(|r| r.specificity() == best).collect();
            winners.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
            resolved.extend(winners.into_iter().cloned());
        }
        resolved
    }

    /// Resolved rates for the shipping tax class that are flagged for shipping.
    pub fn shipping_rates(&self, jurisdiction: &Jurisdiction, tax_class: &str) -> Vec<TaxRate> {
        self.rates(jurisdiction, tax_class)
            .into_iter()
            .filter(|r| r.shipping)
            .collect()
    }
}

// =============================================================================
// Tax Context
// =============================================================================

/// Everything the aggregator needs to tax a cart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxContext {
    pub jurisdiction: Jurisdiction,
    pub table: TaxTable,
    /// Catalog prices already contain tax; extract instead of adding.
    pub prices_include_tax: bool,
    /// Rounding point for tax lines (2 for cents).
    pub price_decimals: u32,
    /// Tax class used for shipping charges.
    pub shipping_tax_class: String,
}

impl TaxContext {
    pub fn new(jurisdiction: Jurisdiction, table: TaxTable) -> Self {
        TaxContext {
            jurisdiction,
            table,
            prices_include_tax: false,
            price_decimals: 2,
            shipping_tax_class: STANDARD_TAX_CLASS.to_string(),
        }
    }

    pub fn prices_include_tax(mut self, inclusive: bool) -> Self {
        self.prices_include_tax = inclusive;
        self
    }

    pub fn price_decimals(mut self, decimals: u32) -> Self {
        self.price_decimals = decimals;
        self
    }

    pub fn shipping_tax_class(mut self, class: impl Into<String>) -> Self {
        self.shipping_tax_class = class.into();
        self
    }
}

// =============================================================================
// Tax Lines
// =============================================================================

/// Tax charged by one rate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxLine {
    pub rate_id: String,
    pub label: String,
    pub rate: Rate,
    pub compound: bool,
    pub amount: Money,
}

/// Computes one tax line per rate for `amount`.
///
/// `rates` must come from [`TaxTable::rates`] (priority order). With
/// `inclusive`, `amount` is treated as gross and the lines are the tax
/// contained in it.
pub fn calculate(amount: Money, rates: &[TaxRate], inclusive: bool, decimals: u32) -> Vec<TaxLine> {
    if rates.is_empty() {
        return Vec::new();
    }

    let base = if inclusive { net_of(amount, rates) } else { amount };
    let mut lines = exclusive_lines(base, rates, decimals);

    if inclusive {
        let target = (amount - base).round_dp(decimals);
        let computed: Money = lines.iter().map(|l| l.amount).sum();
        if let Some(last) = lines.last_mut() {
            last.amount += target - computed;
        }
    }

    lines
}

/// Sum of the line amounts.
pub fn total(lines: &[TaxLine]) -> Money {
    lines.iter().map(|l| l.amount).sum()
}

/// Adds `lines` into `into`, merging by rate id.
pub fn merge_lines(into: &mut Vec<TaxLine>, lines: &[TaxLine]) {
    for line in lines {
        match into.iter_mut().find(|l| l.rate_id == line.rate_id) {
            Some(existing) => existing.amount += line.amount,
            None => into.push(line.clone()),
        }
    }
}

fn exclusive_lines(base: Money, rates: &[TaxRate], decimals: u32) -> Vec<TaxLine> {
    let simple_total: Money = rates
        .iter()
        .filter(|r| !r.compound)
        .map(|r| base.apply_rate(r.rate).round_dp(decimals))
        .sum();

    let mut running = base + simple_total;
    rates
        .iter()
        .map(|r| {
            let amount = if r.compound {
                let tax = running.apply_rate(r.rate).round_dp(decimals);
                running += tax;
                tax
            } else {
                base.apply_rate(r.rate).round_dp(decimals)
            };
            TaxLine {
                rate_id: r.id.clone(),
                label: r.label.clone(),
                rate: r.rate,
                compound: r.compound,
                amount,
            }
        })
        .collect()
}

/// gross / ((1 + Σ simple) × Π(1 + compound))
fn net_of(gross: Money, rates: &[TaxRate]) -> Money {
    let simple = rates
        .iter()
        .filter(|r| !r.compound)
        .fold(Rate::zero(), |acc, r| acc.combine(r.rate));

    let mut net = gross;
    for compound in rates.iter().rev().filter(|r| r.compound) {
        net = net.remove_rate(compound.rate);
    }
    net.remove_rate(simple)
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

    fn rate(id: &str, percent: &str) -> TaxRate {
        TaxRate::simple(id, "US", percent.parse().unwrap())
    }

    fn la() -> Jurisdiction {
        Jurisdiction::new("US", "CA", "90012", "Los Angeles")
    }

    #[test]
    fn test_basic_exclusive_tax() {
        let lines = calculate(m("20.00"), &[rate("us", "8")], false, 2);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].amount, m("1.60"));
    }

    #[test]
    fn test_most_specific_match_wins_within_priority() {
        let mut state = rate("ca", "7.25");
        state.state = "CA".into();
        let mut city = rate("la", "9.5");
        city.state = "CA".into();
        city.city = "los angeles".into();
        let country = rate("us", "5");

        let table = TaxTable::new(vec![country.clone(), state.clone(), city.clone()]);
        let resolved = table.rates(&la(), "standard");
        assert_eq!(resolved, vec![city]);

        let sf = Jurisdiction::new("US", "CA", "94103", "San Francisco");
        assert_eq!(table.rates(&sf, "standard"), vec![state]);

        let ny = Jurisdiction::new("US", "NY", "10001", "New York");
        assert_eq!(table.rates(&ny, "standard"), vec![country]);
    }

    #[test]
    fn test_same_priority_rates_are_summed() {
        let mut county = rate("county", "1");
        county.postcode = "900*".into();
        let mut district = rate("district", "0.5");
        district.postcode = "90000...90099".into();

        let table = TaxTable::new(vec![county, district]);
        let resolved = table.rates(&la(), "");
        assert_eq!(resolved.len(), 2);

        let lines = calculate(m("100.00"), &resolved, false, 2);
        assert_eq!(total(&lines), m("1.50"));
    }

    #[test]
    fn test_compound_applies_on_running_total() {
        let base = rate("base", "5");
        let mut compound = rate("extra", "2");
        compound.priority = 2;
        compound.compound = true;

        let table = TaxTable::new(vec![compound, base]);
        let resolved = table.rates(&la(), "standard");
        assert_eq!(resolved[0].id, "base");

        let lines = calculate(m("10.00"), &resolved, false, 2);
        assert_eq!(lines[0].amount, m("0.50"));
        assert_eq!(lines[1].amount, m("0.21"));
    }

    #[test]
    fn test_inclusive_extraction() {
        let lines = calculate(m("10.80"), &[rate("us", "8")], true, 2);
        assert_eq!(total(&lines), m("0.80"));

        let base = rate("base", "5");
        let mut compound = rate("extra", "2");
        compound.priority = 2;
        compound.compound = true;
        // 10.00 × 1.05 × 1.02 = 10.71
        let lines = calculate(m("10.71"), &[base, compound], true, 2);
        assert_eq!(total(&lines), m("0.71"));
    }

    #[test]
    fn test_postcode_patterns() {
        assert!(postcode_matches("902*", "90210"));
        assert!(!postcode_matches("902*", "90110"));
        assert!(postcode_matches("90000...90299", "90210"));
        assert!(!postcode_matches("90000...90299", "90300"));
        assert!(postcode_matches("sw1a 1aa", "SW1A1AA"));
        assert!(!postcode_matches("1...x", "5"));
    }

    #[test]
    fn test_tax_class_filter_and_shipping_flag() {
        let mut reduced = rate("reduced", "2");
        reduced.tax_class = "reduced-rate".into();
        let mut standard = rate("std", "8");
        standard.shipping = true;
        let table = TaxTable::new(vec![reduced, standard]);

        assert_eq!(table.rates(&la(), "reduced-rate").len(), 1);
        assert_eq!(table.shipping_rates(&la(), "standard").len(), 1);
        assert!(table.shipping_rates(&la(), "reduced-rate").is_empty());
    }

    #[test]
    fn test_merge_lines() {
        let mut into = calculate(m("10.00"), &[rate("us", "8")], false, 2);
        let more = calculate(m("5.00"), &[rate("us", "8")], false, 2);
        merge_lines(&mut into, &more);
        assert_eq!(into.len(), 1);
        assert_eq!(into[0].amount, m("1.20"));
    }
}
