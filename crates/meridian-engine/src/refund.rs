//! # Refunds
//!
//! Partial or full refunds of completed orders.
//!
//! ## Refund Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          refund(request)                                │
//! │                                                                         │
//! │  lock order, restocked inventory rows, ledgers of balance payments      │
//! │  BEGIN                                                                  │
//! │    order + past refunds ──► plan_refund                                 │
//! │         │                     per item:  qty  ≤ bought                  │
//! │         │                                amount ≤ item gross            │
//! │         │                     per order: Σ refunds ≤ total              │
//! │         ▼                                                               │
//! │    insert Refund + RefundItems                                          │
//! │    restock (if asked)                                                   │
//! │    credit outstanding balance payments first, in redemption order       │
//! │    Σ refunds == total?  ──► completed ─► refunded                       │
//! │    refund_issued event                                                  │
//! │  COMMIT                                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Whatever balances do not take back is owed through the original
//! payment method; the engine records the amount but does not call the
//! gateway.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use meridian_core::event::DomainEvent;
use meridian_core::ledger::{self, LedgerReason};
use meridian_core::order::{OrderItemDetail, OrderNote};
use meridian_core::refund::{plan_refund, Refund, RefundHistory, RefundItem, RefundRequest};
use meridian_core::OrderStatus;
use meridian_db::{LedgerRepository, OrderRepository, RefundRepository};

use crate::engine::{enqueue_all, restock, CheckoutEngine};
use crate::error::{EngineError, EngineResult};
use crate::ledger::append;
use crate::locks::Resource;

impl CheckoutEngine {
    /// Records a refund against a completed order.
    pub async fn refund(&self, request: &RefundRequest) -> EngineResult<Refund> {
        let order_id = request.order_id.as_str();
        let current = self.order(order_id).await?;
        let payments = self.db().ledgers().payments_for(order_id).await?;

        let mut resources = vec![Resource::Order(order_id.to_string())];
        if request.restock {
            for line in &request.lines {
                if let Some(OrderItemDetail::LineItem {
                    stock_item_id: Some(stock_item_id),
                    ..
                }) = current.item(&line.order_item_id).map(|item| &item.detail)
                {
                    resources.push(Resource::Inventory(stock_item_id.clone()));
                }
            }
        }
        for payment in &payments {
            if let Some(account) = self.db().ledgers().get_account_by_id(&payment.account_id).await? {
                resources.push(Resource::ledger(account.kind, &account.owner));
            }
        }
        let _locks = self.lock(resources).await?;

        let now = Utc::now();
        let mut tx = self.db().begin().await?;
        let mut order = OrderRepository::find(&mut tx, order_id)
            .await?
            .ok_or_else(|| EngineError::not_found("order", order_id))?;
        let history = RefundHistory::from_refunds(&RefundRepository::for_order(&mut tx, order_id).await?);

        let plan = plan_refund(&order, request, &history)
            .inspect_err(|e| warn!(order_id = %order_id, error = %e, "Refund rejected"))?;

        let refund_id = Uuid::new_v4().to_string();
        let refund = Refund {
            id: refund_id.clone(),
            order_id: order.id.clone(),
            amount: plan.amount,
            reason: request.reason.clone(),
            restocked: !plan.restock.is_empty(),
            created_at: now,
            items: plan
                .lines
                .iter()
                .map(|line| RefundItem {
                    id: Uuid::new_v4().to_string(),
                    refund_id: refund_id.clone(),
                    order_item_id: line.order_item_id.clone(),
                    quantity: line.quantity,
                    amount: line.amount,
                })
                .collect(),
        };
        RefundRepository::insert(&mut tx, &refund).await?;

        for (item_id, quantity) in &plan.restock {
            restock(&mut tx, item_id, *quantity).await?;
        }

        let payments = LedgerRepository::payments_for_order(&mut tx, order_id).await?;
        for reversal in ledger::plan_reversals(&payments, plan.amount) {
            append(
                &mut tx,
                &reversal.account_id,
                reversal.units,
                LedgerReason::Refunded,
                Some(order_id),
                Some(&refund_id),
                now,
            )
            .await?;
            LedgerRepository::record_payment_refund(&mut tx, &reversal.payment_id, reversal.amount, reversal.units)
                .await?;
        }

        let expected = order.status;
        let mut events = Vec::new();
        if plan.fully_refunded {
            self.move_to(&mut tx, &mut order, OrderStatus::Refunded, now, &mut events)
                .await?;
        } else {
            order.updated_at = now;
        }

        let content = match &request.reason {
            Some(reason) => format!("Refunded {} {}: {}", plan.amount, order.currency, reason),
            None => format!("Refunded {} {}.", plan.amount, order.currency),
        };
        OrderRepository::insert_note(&mut tx, &OrderNote::system(&order.id, content, now)).await?;

        events.push(DomainEvent::RefundIssued {
            order_id: order.id.clone(),
            refund_id: refund_id.clone(),
            amount: plan.amount,
            full: plan.fully_refunded,
        });

        OrderRepository::update_state(&mut tx, &order, expected).await?;
        enqueue_all(&mut tx, &events).await?;
        tx.commit().await?;

        info!(
            order_id = %order.id,
            refund_id = %refund_id,
            amount = %plan.amount,
            full = plan.fully_refunded,
            "Refund issued"
        );
        Ok(refund)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::EngineError;
    use crate::payment::PaymentOutcome;
    use crate::testing::{cart, engine, us};
    use meridian_core::cart::{CartLine, ShippingSelection};
    use meridian_core::ledger::{LedgerKind, Redemption};
    use meridian_core::order::OrderItemKind;
    use meridian_core::refund::{RefundLineRequest, RefundRequest};
    use meridian_core::{CoreError, Money, Order, OrderStatus};

    fn m(s: &str) -> Money {
        s.parse().unwrap()
    }

    fn request(order: &Order, lines: Vec<RefundLineRequest>, restock: bool) -> RefundRequest {
        RefundRequest {
            order_id: order.id.clone(),
            lines,
            reason: None,
            restock,
        }
    }

    fn mug_line(order: &Order) -> String {
        order.line_items().next().unwrap().id.clone()
    }

    #[tokio::test]
    async fn test_partial_refunds_until_full() {
        let engine = engine().await;
        let quote = engine.quote(&cart(vec![CartLine::new("mug", 2)]), us()).await.unwrap();
        let order = engine.settle(&quote, &PaymentOutcome::success("card", "ch_1")).await.unwrap();
        let line = mug_line(&order);

        let first = engine
            .refund(&request(&order, vec![RefundLineRequest::units(&line, 1)], false))
            .await
            .unwrap();
        assert_eq!(first.amount, m("10.80"));
        assert_eq!(engine.order(&order.id).await.unwrap().status, OrderStatus::Completed);

        engine
            .refund(&request(&order, vec![RefundLineRequest::units(&line, 1)], false))
            .await
            .unwrap();
        let refunded = engine.order(&order.id).await.unwrap();
        assert_eq!(refunded.status, OrderStatus::Refunded);

        let err = engine
            .refund(&request(&order, vec![RefundLineRequest::units(&line, 1)], false))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Core(CoreError::RefundNotAllowed { .. })));
        assert_eq!(engine.refunds(&order.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_repeated_refund_rejected_by_cumulative_check() {
        let engine = engine().await;
        let request_lines = cart(vec![CartLine::new("mug", 2)])
            .shipping(ShippingSelection::new("flat_rate", "Flat rate", m("5.00")));
        let quote = engine.quote(&request_lines, us()).await.unwrap();
        let order = engine.settle(&quote, &PaymentOutcome::success("card", "ch_1")).await.unwrap();
        let line = mug_line(&order);

        let all = request(&order, vec![RefundLineRequest::units(&line, 2)], false);
        engine.refund(&all).await.unwrap();
        // shipping is still unrefunded so the order stays completed
        assert_eq!(engine.order(&order.id).await.unwrap().status, OrderStatus::Completed);

        let err = engine.refund(&all).await.unwrap_err();
        assert!(matches!(err, EngineError::Core(CoreError::RefundExceedsQuantity { .. })));
        assert_eq!(err.category(), meridian_core::ErrorCategory::Integrity);

        let shipping = order.items.iter().find(|i| i.kind() == OrderItemKind::Shipping).unwrap();
        let too_much = request(&order, vec![RefundLineRequest::amount(&shipping.id, m("6.00"))], false);
        assert!(matches!(
            engine.refund(&too_much).await.unwrap_err(),
            EngineError::Core(CoreError::RefundExceedsItemTotal { .. })
        ));

        let rest = request(&order, vec![RefundLineRequest::amount(&shipping.id, m("5.40"))], false);
        engine.refund(&rest).await.unwrap();
        assert_eq!(engine.order(&order.id).await.unwrap().status, OrderStatus::Refunded);
    }

    #[tokio::test]
    async fn test_refund_restocks() {
        let engine = engine().await;
        let quote = engine.quote(&cart(vec![CartLine::new("mug", 3)]), us()).await.unwrap();
        let order = engine.settle(&quote, &PaymentOutcome::success("card", "ch_1")).await.unwrap();
        assert_eq!(engine.db().inventory().get("mug").await.unwrap().unwrap().stock_quantity, 2);

        let refund = engine
            .refund(&request(&order, vec![RefundLineRequest::units(mug_line(&order), 2)], true))
            .await
            .unwrap();
        assert!(refund.restocked);
        assert_eq!(engine.db().inventory().get("mug").await.unwrap().unwrap().stock_quantity, 4);

        let events = engine.db().events().for_aggregate(&order.id).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == "refund_issued"));
    }

    #[tokio::test]
    async fn test_refund_credits_balances_first() {
        let engine = engine().await;
        engine.issue_gift_card("GIFT-1", m("5.00"), None).await.unwrap();

        // 2 × 10.00 + 1.60 tax = 21.60, 5.00 from the gift card
        let quote = engine.quote(&cart(vec![CartLine::new("mug", 2)]), us()).await.unwrap();
        let outcome = PaymentOutcome::success("card", "ch_1")
            .with_redemptions(vec![Redemption::money(LedgerKind::GiftCard, "GIFT-1", m("5.00"))]);
        let order = engine.settle(&quote, &outcome).await.unwrap();
        assert_eq!(engine.ledger_account(LedgerKind::GiftCard, "GIFT-1").await.unwrap().balance, 0);

        engine
            .refund(&request(&order, vec![RefundLineRequest::amount(mug_line(&order), m("3.00"))], false))
            .await
            .unwrap();
        let card = engine.ledger_account(LedgerKind::GiftCard, "GIFT-1").await.unwrap();
        assert_eq!(card.balance, m("3.00").units());

        engine
            .refund(&request(&order, vec![RefundLineRequest::amount(mug_line(&order), m("7.00"))], false))
            .await
            .unwrap();
        let card = engine.ledger_account(LedgerKind::GiftCard, "GIFT-1").await.unwrap();
        assert_eq!(card.balance, m("5.00").units());
        assert_eq!(engine.replay_ledger(LedgerKind::GiftCard, "GIFT-1").await.unwrap(), m("5.00").units());
    }

    #[tokio::test]
    async fn test_refund_requires_completed_order() {
        let engine = engine().await;
        let quote = engine.quote(&cart(vec![CartLine::new("mug", 1)]), us()).await.unwrap();
        let outcome = PaymentOutcome::failure("card", "card_declined", "Declined");
        let order = engine.settle(&quote, &outcome).await.unwrap();

        let err = engine
            .refund(&request(&order, vec![RefundLineRequest::units(mug_line(&order), 1)], false))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Core(CoreError::RefundNotAllowed { .. })));
        assert_eq!(err.code(), "REFUND_NOT_ALLOWED");
    }
}
