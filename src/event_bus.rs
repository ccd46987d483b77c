// =============================================================================
// Event Bus — typed pub/sub with bounded per-subscriber queues
// =============================================================================
//
// `publish` never blocks: each subscriber owns a bounded `mpsc` queue, and a
// full queue drops the message *for that subscriber only* while incrementing
// a per-subscriber drop counter. Subscriber registration is guarded by a
// `parking_lot::RwLock`; `publish` only needs the read lock, so publishers
// never contend with each other.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::order::Order;
use crate::domain::position::Position;
use crate::domain::stop_loss::StopLossSide;

/// Default bounded capacity for a subscriber's delivery queue.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 100;

/// Every message type the engine publishes onto the bus.
#[derive(Debug, Clone, Serialize)]
pub enum EngineEvent {
    PriceTick {
        symbol: String,
        price: f64,
    },
    StrategySignal {
        strategy_id: String,
        signal: crate::domain::strategy::Signal,
    },
    OrderSubmitted {
        order: Order,
    },
    OrderAccepted {
        order: Order,
    },
    OrderRejected {
        order_id: String,
        reason: String,
    },
    OrderFilled {
        order: Order,
        fill_price: f64,
        fill_qty: f64,
    },
    OrderUpdate {
        order: Order,
    },
    PositionChange {
        position: Position,
    },
    RiskAlert {
        user_id: Option<String>,
        kind: String,
        reason: String,
    },
    StrategyError {
        strategy_id: String,
        message: String,
    },
    StopLossTriggered {
        strategy_id: String,
        symbol: String,
        side_to_close: StopLossSide,
        reason: String,
    },
}

impl EngineEvent {
    /// Coarse topic name, useful for metrics/log grouping.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::PriceTick { .. } => "PriceTick",
            Self::StrategySignal { .. } => "StrategySignal",
            Self::OrderSubmitted { .. } => "OrderSubmitted",
            Self::OrderAccepted { .. } => "OrderAccepted",
            Self::OrderRejected { .. } => "OrderRejected",
            Self::OrderFilled { .. } => "OrderFilled",
            Self::OrderUpdate { .. } => "OrderUpdate",
            Self::PositionChange { .. } => "PositionChange",
            Self::RiskAlert { .. } => "RiskAlert",
            Self::StrategyError { .. } => "StrategyError",
            Self::StopLossTriggered { .. } => "StopLossTriggered",
        }
    }
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<EngineEvent>,
    dropped: Arc<AtomicU64>,
}

/// A subscription handle. Dropping it unregisters the subscriber from the
/// bus on its next publish (lazily — see `Bus::publish`'s dead-sender reap).
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<EngineEvent>,
    pub dropped_counter: Arc<AtomicU64>,
}

/// Non-blocking typed pub/sub bus.
pub struct Bus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Bus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Register a new subscriber and return its handle. The caller owns the
    /// receiver end and should drop it (or the whole `Subscription`) to
    /// unsubscribe.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        self.subscribers.write().push(Subscriber {
            id,
            sender: tx,
            dropped: dropped.clone(),
        });

        Subscription {
            id,
            receiver: rx,
            dropped_counter: dropped,
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().retain(|s| s.id != id);
    }

    /// Publish `event` to every current subscriber. Non-blocking: a full
    /// subscriber queue drops the message and increments that subscriber's
    /// counter. Dead (receiver-dropped) subscribers are reaped here.
    pub fn publish(&self, event: EngineEvent) {
        let topic = event.topic();
        let subscribers = self.subscribers.read();
        let mut dead: Vec<u64> = Vec::new();

        for sub in subscribers.iter() {
            match sub.sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(topic, subscriber_id = sub.id, "event dropped: subscriber queue full");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(sub.id);
                }
            }
        }
        drop(subscribers);

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write();
            subscribers.retain(|s| !dead.contains(&s.id));
            debug!(count = dead.len(), "reaped dead bus subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> EngineEvent {
        EngineEvent::PriceTick {
            symbol: "BTCUSDT".into(),
            price: 50000.0,
        }
    }

    #[test]
    fn publish_with_no_subscribers_is_a_no_op() {
        let bus = Bus::new();
        bus.publish(sample_event());
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = Bus::new();
        let mut sub = bus.subscribe();
        bus.publish(sample_event());
        let received = sub.receiver.recv().await.unwrap();
        assert_eq!(received.topic(), "PriceTick");
    }

    #[tokio::test]
    async fn full_queue_drops_for_that_subscriber_only() {
        let bus = Bus::with_capacity(1);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        bus.publish(sample_event());
        bus.publish(sample_event());

        assert_eq!(slow.dropped_counter.load(Ordering::Relaxed), 1);

        // The fast subscriber still received its first message even though
        // the slow one overflowed.
        assert!(fast.receiver.try_recv().is_ok());
        assert!(slow.receiver.try_recv().is_ok());
    }

    #[tokio::test]
    async fn dropped_receiver_is_reaped_on_next_publish() {
        let bus = Bus::new();
        let sub = bus.subscribe();
        drop(sub);
        bus.publish(sample_event());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_handle() {
        let bus = Bus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe(sub.id);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
