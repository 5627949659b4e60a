//! # Event Dispatcher
//!
//! Delivers outbox rows to an [`EventSink`], at least once.
//!
//! ## Dispatch Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Event Dispatch Flow                              │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐    │
//! │  │                    event_outbox Table                           │    │
//! │  │                                                                 │    │
//! │  │  id │ event_type            │ aggregate │ attempts │ delivered  │    │
//! │  │  ───┼───────────────────────┼───────────┼──────────┼─────────── │    │
//! │  │  1  │ order_status_changed  │ order-1   │ 0        │ NULL       │    │
//! │  │  2  │ coupon_usage_recorded │ coupon-7  │ 2        │ NULL       │    │
//! │  │  3  │ refund_issued         │ order-1   │ 10       │ NULL  dead │    │
//! │  └────────────────────────────┬────────────────────────────────────┘    │
//! │                               │                                         │
//! │                               ▼                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐    │
//! │  │                    EventDispatcher                              │    │
//! │  │                                                                 │    │
//! │  │  1. Poll:    undelivered, attempts < max_attempts, oldest first │    │
//! │  │  2. Decode:  payload ──► DomainEvent                            │    │
//! │  │  3. Deliver: EventSink::deliver(event)                          │    │
//! │  │  4. Mark:    delivered_at = now   or   attempts += 1, last_error│    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! │                                                                         │
//! │  TIMING:                                                                │
//! │  • Poll interval: 5 seconds (configurable)                              │
//! │  • Batch size: 100 entries (configurable)                               │
//! │  • Max attempts: 10 (then logged and skipped)                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A crash between delivery and marking redelivers the row, so sinks must
//! tolerate duplicates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use meridian_core::event::DomainEvent;
use meridian_db::{Database, OutboxEntry};

use crate::config::EventSettings;
use crate::error::{EngineError, EngineResult};

// =============================================================================
// Sinks
// =============================================================================

/// Where events go: a message bus, a webhook, a reporting store.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, entry: &OutboxEntry, event: &DomainEvent) -> EngineResult<()>;
}

/// Writes each event to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn deliver(&self, entry: &OutboxEntry, event: &DomainEvent) -> EngineResult<()> {
        info!(
            id = %entry.id,
            event_type = %entry.event_type,
            aggregate_id = %entry.aggregate_id,
            event = ?event,
            "Event"
        );
        Ok(())
    }
}

/// Forwards events to an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<DomainEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<DomainEvent>) -> Self {
        ChannelSink { tx }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn deliver(&self, _entry: &OutboxEntry, event: &DomainEvent) -> EngineResult<()> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| EngineError::EventDelivery("Event channel closed".into()))
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Counts from one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Polls the outbox and hands events to a sink.
pub struct EventDispatcher {
    db: Database,
    settings: EventSettings,
    sink: Arc<dyn EventSink>,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for stopping the dispatcher.
#[derive(Clone)]
pub struct EventDispatcherHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl EventDispatcherHandle {
    /// Stops the loop after the current pass.
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| EngineError::ChannelError("Shutdown channel closed".into()))
    }
}

impl EventDispatcher {
    pub fn new(db: Database, settings: EventSettings, sink: Arc<dyn EventSink>) -> (Self, EventDispatcherHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let dispatcher = EventDispatcher {
            db,
            settings,
            sink,
            shutdown_rx,
        };
        (dispatcher, EventDispatcherHandle { shutdown_tx })
    }

    /// Runs until shut down. Spawn it as a background task.
    pub async fn run(mut self) {
        info!("Event dispatcher starting");

        let mut interval = tokio::time::interval(Duration::from_secs(self.settings.poll_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.process_once().await {
                        error!(?e, "Failed to dispatch events");
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Event dispatcher shutting down");
                    break;
                }
            }
        }

        info!("Event dispatcher stopped");
    }

    /// Delivers one batch of pending events.
    pub async fn process_once(&self) -> EngineResult<DispatchReport> {
        let events = self.db.events();
        let entries = events
            .get_pending(self.settings.batch_size, self.settings.max_attempts)
            .await?;

        if entries.is_empty() {
            debug!("No pending events");
            return Ok(DispatchReport::default());
        }

        debug!(count = entries.len(), "Dispatching events");
        let mut report = DispatchReport::default();

        for entry in entries {
            let result = match entry.event() {
                Ok(event) => self.sink.deliver(&entry, &event).await,
                Err(e) => Err(e.into()),
            };

            match result {
                Ok(()) => {
                    events.mark_delivered(&entry.id).await?;
                    report.delivered += 1;
                }
                Err(e) => {
                    let attempts = entry.attempts + 1;
                    warn!(
                        id = %entry.id,
                        event_type = %entry.event_type,
                        attempts,
                        error = %e,
                        "Event delivery failed"
                    );
                    events.mark_failed(&entry.id, &e.to_string()).await?;
                    report.failed += 1;

                    if attempts >= i64::from(self.settings.max_attempts) {
                        error!(
                            id = %entry.id,
                            event_type = %entry.event_type,
                            aggregate_id = %entry.aggregate_id,
                            "Event exceeded max delivery attempts; skipping"
                        );
                    }
                }
            }
        }

        if report.delivered > 0 || report.failed > 0 {
            info!(delivered = report.delivered, failed = report.failed, "Event batch dispatched");
        }
        Ok(report)
    }

    /// Events that will not be retried.
    pub async fn dead_letters(&self) -> EngineResult<i64> {
        Ok(self.db.events().count_dead(self.settings.max_attempts).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::payment::PaymentOutcome;
    use crate::testing::{cart, engine, us};
    use meridian_core::cart::CartLine;
    use meridian_core::OrderStatus;

    /// Fails the first `failures` deliveries, then records.
    struct FlakySink {
        failures: Mutex<usize>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventSink for FlakySink {
        async fn deliver(&self, entry: &OutboxEntry, _event: &DomainEvent) -> EngineResult<()> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(EngineError::EventDelivery("webhook returned 503".into()));
            }
            self.seen.lock().unwrap().push(entry.event_type.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_settlement_events_delivered_through_channel() {
        let engine = engine().await;
        let quote = engine.quote(&cart(vec![CartLine::new("mug", 3)]), us()).await.unwrap();
        let order = engine.settle(&quote, &PaymentOutcome::success("card", "ch_1")).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let (dispatcher, _handle) =
            EventDispatcher::new(engine.db().clone(), engine.config().events.clone(), Arc::new(ChannelSink::new(tx)));
        let report = dispatcher.process_once().await.unwrap();
        assert_eq!(report.failed, 0);

        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.push(event);
        }
        assert_eq!(received.len(), report.delivered);

        let statuses: Vec<_> = received
            .iter()
            .filter_map(|e| match e {
                DomainEvent::OrderStatusChanged { order_id, to, .. } if order_id == &order.id => Some(*to),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![OrderStatus::Pending, OrderStatus::Processing, OrderStatus::Completed]
        );
        // 5 on hand, 3 sold, threshold 2
        assert!(received
            .iter()
            .any(|e| matches!(e, DomainEvent::LowStockCrossed { item_id, stock_quantity: 2, .. } if item_id == "mug")));

        assert_eq!(dispatcher.process_once().await.unwrap(), DispatchReport::default());
        assert_eq!(engine.db().events().count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_delivery_retried_then_dead() {
        let engine = engine().await;
        let quote = engine.quote(&cart(vec![CartLine::new("poster", 1)]), us()).await.unwrap();
        engine.settle(&quote, &PaymentOutcome::success("card", "ch_1")).await.unwrap();
        let pending = engine.db().events().count_pending().await.unwrap() as usize;

        let mut settings = engine.config().events.clone();
        settings.max_attempts = 2;
        let sink = Arc::new(FlakySink {
            failures: Mutex::new(pending + 1),
            seen: Mutex::new(Vec::new()),
        });
        let (dispatcher, _handle) = EventDispatcher::new(engine.db().clone(), settings, sink.clone());

        let first = dispatcher.process_once().await.unwrap();
        assert_eq!(first.failed, pending);

        // one more failure exhausts the first row; the rest go through
        let second = dispatcher.process_once().await.unwrap();
        assert_eq!(second.failed, 1);
        assert_eq!(second.delivered, pending - 1);
        assert_eq!(dispatcher.dead_letters().await.unwrap(), 1);
        assert_eq!(sink.seen.lock().unwrap().len(), pending - 1);

        assert_eq!(dispatcher.process_once().await.unwrap(), DispatchReport::default());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let engine = engine().await;
        let (dispatcher, handle) = EventDispatcher::new(engine.db().clone(), engine.config().events.clone(), Arc::new(LogSink));
        let task = tokio::spawn(dispatcher.run());
        handle.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
