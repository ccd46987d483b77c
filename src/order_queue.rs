// =============================================================================
// Order Queue — bounded durable FIFO with overflow buffer
// =============================================================================
//
// `enqueue` never blocks: it tries the bounded main channel, falls back to
// an overflow buffer, and only drops (with a `RiskAlert`-worthy error) once
// both are full. When a WAL is configured, the ENQUEUE record is durable
// before the order is visible in either the channel or the overflow buffer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::domain::order::Order;
use crate::error::EngineError;
use crate::wal::Wal;

pub const DEFAULT_CAPACITY: usize = 200;
pub const DEFAULT_OVERFLOW_CAPACITY: usize = 200;

#[derive(Default)]
pub struct QueueCounters {
    pub enqueued: AtomicU64,
    pub dequeued: AtomicU64,
    pub overflowed: AtomicU64,
    pub dropped: AtomicU64,
}

pub struct OrderQueue {
    sender: mpsc::Sender<Order>,
    receiver: Mutex<mpsc::Receiver<Order>>,
    overflow: Mutex<VecDeque<Order>>,
    overflow_capacity: usize,
    wal: Option<Arc<Wal>>,
    counters: QueueCounters,
    /// Running `Σ qty × price` over every order currently sitting in the
    /// main channel or the overflow buffer. Updated on every successful
    /// enqueue/dequeue so `pending_notional` never has to peek inside the
    /// channel (which `tokio::sync::mpsc` does not support).
    pending_notional: Mutex<f64>,
}

impl OrderQueue {
    pub fn new(capacity: usize, overflow_capacity: usize, wal: Option<Arc<Wal>>) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Mutex::new(receiver),
            overflow: Mutex::new(VecDeque::new()),
            overflow_capacity,
            wal,
            counters: QueueCounters::default(),
            pending_notional: Mutex::new(0.0),
        }
    }

    /// Non-blocking enqueue. WAL-durable before becoming visible, per the
    /// WAL contract: serialize ENQUEUE, append+fsync, then push.
    pub fn enqueue(&self, order: Order) -> Result<(), EngineError> {
        if let Some(wal) = &self.wal {
            wal.append_enqueue(&order)?;
        }

        let notional = order.qty * order.price;

        match self.sender.try_send(order) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                *self.pending_notional.lock() += notional;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(order)) => {
                let mut overflow = self.overflow.lock();
                if overflow.len() < self.overflow_capacity {
                    overflow.push_back(order);
                    self.counters.overflowed.fetch_add(1, Ordering::Relaxed);
                    self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                    *self.pending_notional.lock() += notional;
                    Ok(())
                } else {
                    let order_id = order.order_id.clone();
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    Err(EngineError::QueueOverflow { order_id })
                }
            }
            Err(mpsc::error::TrySendError::Closed(order)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Err(EngineError::QueueOverflow {
                    order_id: order.order_id,
                })
            }
        }
    }

    /// Pull the next order: prefers the overflow buffer (oldest overflowed
    /// orders drain first) then the main channel.
    pub async fn dequeue(&self) -> Option<Order> {
        {
            let mut overflow = self.overflow.lock();
            if let Some(order) = overflow.pop_front() {
                self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
                *self.pending_notional.lock() -= order.qty * order.price;
                return Some(order);
            }
        }

        let order = self.receiver.lock().recv().await;
        if let Some(order) = &order {
            self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
            *self.pending_notional.lock() -= order.qty * order.price;
        }
        order
    }

    pub fn mark_complete(&self, order_id: &str) -> Result<(), EngineError> {
        if let Some(wal) = &self.wal {
            wal.append_complete(order_id)?;
        }
        Ok(())
    }

    /// `Σ qty × price` over every order currently in the main channel or
    /// the overflow buffer. Consulted by the risk manager's exposure check.
    pub fn pending_notional(&self) -> f64 {
        *self.pending_notional.lock()
    }

    pub fn counters_snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.counters.enqueued.load(Ordering::Relaxed),
            self.counters.dequeued.load(Ordering::Relaxed),
            self.counters.overflowed.load(Ordering::Relaxed),
            self.counters.dropped.load(Ordering::Relaxed),
        )
    }

    /// Re-push orders recovered from the WAL at startup.
    pub fn requeue_recovered(&self, orders: Vec<Order>) {
        for order in orders {
            let _ = self.enqueue(order);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketType, OrderType, Side};

    fn sample_order() -> Order {
        Order::new("u1", "BTCUSDT", Side::Buy, OrderType::Market, 1.0, 100.0, MarketType::Spot)
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_roundtrips() {
        let queue = OrderQueue::new(DEFAULT_CAPACITY, DEFAULT_OVERFLOW_CAPACITY, None);
        let order = sample_order();
        queue.enqueue(order.clone()).unwrap();
        let dequeued = queue.dequeue().await.unwrap();
        assert_eq!(dequeued.order_id, order.order_id);
    }

    #[tokio::test]
    async fn full_main_channel_spills_into_overflow() {
        let queue = OrderQueue::new(1, 4, None);
        queue.enqueue(sample_order()).unwrap(); // fills main channel capacity=1
        queue.enqueue(sample_order()).unwrap(); // spills to overflow
        let (enqueued, _, overflowed, _) = queue.counters_snapshot();
        assert_eq!(enqueued, 2);
        assert_eq!(overflowed, 1);
    }

    #[tokio::test]
    async fn overflow_full_drops_with_error() {
        let queue = OrderQueue::new(1, 1, None);
        queue.enqueue(sample_order()).unwrap();
        queue.enqueue(sample_order()).unwrap();
        let err = queue.enqueue(sample_order()).unwrap_err();
        assert_eq!(err.code(), "QUEUE_OVERFLOW");
        let (_, _, _, dropped) = queue.counters_snapshot();
        assert_eq!(dropped, 1);
    }

    #[tokio::test]
    async fn pending_notional_sums_overflow_orders() {
        let queue = OrderQueue::new(1, 4, None);
        queue.enqueue(sample_order()).unwrap(); // main channel
        queue.enqueue(sample_order()).unwrap(); // overflow: qty=1 price=100
        assert_eq!(queue.pending_notional(), 200.0);
    }

    #[tokio::test]
    async fn pending_notional_includes_in_flight_channel_orders() {
        let queue = OrderQueue::new(4, 4, None);
        queue.enqueue(sample_order()).unwrap(); // stays in the main channel
        assert_eq!(queue.pending_notional(), 100.0);
    }

    #[tokio::test]
    async fn pending_notional_drops_to_zero_after_full_drain() {
        let queue = OrderQueue::new(1, 4, None);
        queue.enqueue(sample_order()).unwrap();
        queue.enqueue(sample_order()).unwrap();
        queue.dequeue().await.unwrap();
        queue.dequeue().await.unwrap();
        assert_eq!(queue.pending_notional(), 0.0);
    }

    #[tokio::test]
    async fn dequeue_prefers_overflow_over_main_channel() {
        let queue = OrderQueue::new(1, 4, None);
        let mut first = sample_order();
        first.price = 1.0;
        let mut second = sample_order();
        second.price = 2.0;

        queue.enqueue(first).unwrap(); // goes to main channel
        queue.enqueue(second.clone()).unwrap(); // goes to overflow

        let dequeued = queue.dequeue().await.unwrap();
        assert_eq!(dequeued.order_id, second.order_id);
    }
}
