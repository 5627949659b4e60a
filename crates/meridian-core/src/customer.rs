//! # Customer Aggregates
//!
//! Per-customer counters that settlement maintains when an order reaches
//! `completed` for the first time.
//!
//! The storage layer must serialize updates for one customer: the average
//! is recomputed from the freshly updated total, so two interleaved updates
//! would lose one order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::money::Money;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerStats {
    pub customer_id: String,
    pub email: Option<String>,
    pub orders_count: i64,
    pub total_spent: Money,
    pub average_order_value: Money,
    pub is_paying_customer: bool,
    pub last_order_id: Option<String>,
    pub last_order_at: Option<DateTime<Utc>>,
}

impl CustomerStats {
    pub fn new(customer_id: impl Into<String>) -> Self {
        CustomerStats {
            customer_id: customer_id.into(),
            email: None,
            orders_count: 0,
            total_spent: Money::ZERO,
            average_order_value: Money::ZERO,
            is_paying_customer: false,
            last_order_id: None,
            last_order_at: None,
        }
    }

    /// Folds one completed order into the aggregates.
    ///
    /// Callers guard against counting the same order twice.
    pub fn record_completed_order(&mut self, order_id: &str, total: Money, at: DateTime<Utc>) {
        self.orders_count += 1;
        self.total_spent += total;
        self.average_order_value = self.total_spent.divide_by(self.orders_count).unwrap_or(Money::ZERO);
        self.is_paying_customer = true;
        self.last_order_id = Some(order_id.to_string());
        self.last_order_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_completed_order() {
        let mut stats = CustomerStats::new("cust-1");
        stats.record_completed_order("o-1", "27.00".parse().unwrap(), Utc::now());
        stats.record_completed_order("o-2", "10.00".parse().unwrap(), Utc::now());

        assert_eq!(stats.orders_count, 2);
        assert_eq!(stats.total_spent, "37.00".parse::<Money>().unwrap());
        assert_eq!(stats.average_order_value, "18.50".parse::<Money>().unwrap());
        assert!(stats.is_paying_customer);
        assert_eq!(stats.last_order_id.as_deref(), Some("o-2"));
    }

    #[test]
    fn test_average_keeps_scale_four() {
        let mut stats = CustomerStats::new("cust-1");
        for id in ["a", "b", "c"] {
            stats.record_completed_order(id, if id == "a" { "10.00".parse().unwrap() } else { Money::ZERO }, Utc::now());
        }
        assert_eq!(stats.average_order_value, "3.3333".parse::<Money>().unwrap());
    }
}
