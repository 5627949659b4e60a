//! # Domain Events
//!
//! Facts emitted for reporting and notification. They are written to the
//! outbox in the same transaction as the change they describe and delivered
//! at least once, so consumers must tolerate duplicates.
//!
//! ```json
//! {"type":"order_status_changed","order_id":"…","number":1041,"from":"processing","to":"completed"}
//! ```

use serde::{Deserialize, Serialize};

use crate::money::Money;
use crate::order::OrderStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    OrderStatusChanged {
        order_id: String,
        number: i64,
        /// `None` when the order was just created.
        from: Option<OrderStatus>,
        to: OrderStatus,
    },
    LowStockCrossed {
        item_id: String,
        product_id: String,
        stock_quantity: i64,
        threshold: i64,
    },
    BackorderPlaced {
        order_id: String,
        item_id: String,
        backordered: i64,
        /// The record's policy asks for a notification.
        notify: bool,
    },
    CouponUsageRecorded {
        coupon_id: String,
        code: String,
        order_id: String,
        usage_count: i64,
    },
    RefundIssued {
        order_id: String,
        refund_id: String,
        amount: Money,
        /// Refunds now cover the whole order.
        full: bool,
    },
}

impl DomainEvent {
    /// Stable name, stored beside the payload.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::OrderStatusChanged { .. } => "order_status_changed",
            DomainEvent::LowStockCrossed { .. } => "low_stock_crossed",
            DomainEvent::BackorderPlaced { .. } => "backorder_placed",
            DomainEvent::CouponUsageRecorded { .. } => "coupon_usage_recorded",
            DomainEvent::RefundIssued { .. } => "refund_issued",
        }
    }

    /// Id of the entity the event is about.
    pub fn aggregate_id(&self) -> &str {
        match self {
            DomainEvent::OrderStatusChanged { order_id, .. }
            | DomainEvent::BackorderPlaced { order_id, .. }
            | DomainEvent::RefundIssued { order_id, .. } => order_id,
            DomainEvent::LowStockCrossed { item_id, .. } => item_id,
            DomainEvent::CouponUsageRecorded { coupon_id, .. } => coupon_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_shape() {
        let event = DomainEvent::OrderStatusChanged {
            order_id: "o-1".to_string(),
            number: 1041,
            from: Some(OrderStatus::Processing),
            to: OrderStatus::Completed,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "order_status_changed");
        assert_eq!(json["from"], "processing");
        assert_eq!(json["to"], "completed");
        assert_eq!(event.event_type(), "order_status_changed");
        assert_eq!(event.aggregate_id(), "o-1");

        let back: DomainEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
