// =============================================================================
// Market Feed — tick intake: the seam between an external price source and
// the price cache / indicator engine / strategy dispatcher
// =============================================================================
//
// Concrete exchange WebSocket/REST wire protocols are out of scope for this
// engine (see spec §1) — the engine only consumes ticks, it does not fetch
// them. `intake` is that consumption point: every `(symbol, price)` pair
// that reaches it is published as a `PriceTick` event (for the stop-loss
// consumer and any other subscriber) and forwarded to the strategy
// dispatcher's bounded channel, which itself updates the price cache and
// indicator engine before fanning the tick out (see
// `strategy_engine::StrategyEngine::dispatch_tick`).
//
// `run_demo_feed` is a self-contained synthetic source used only when no
// live feed is wired in — it exists so the binary is runnable standalone in
// dry-run mode without a real exchange connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::event_bus::{Bus, EngineEvent};

/// Publish a tick on the bus and forward it to the strategy dispatcher.
/// Never blocks the caller beyond a bounded channel send: a full dispatch
/// channel means the strategy engine is behind, and the tick is dropped
/// rather than backing up the feed.
pub fn intake(bus: &Bus, dispatch_tx: &mpsc::Sender<(String, f64)>, symbol: &str, price: f64) {
    if !price.is_finite() || price <= 0.0 {
        return;
    }

    bus.publish(EngineEvent::PriceTick {
        symbol: symbol.to_string(),
        price,
    });

    if let Err(e) = dispatch_tx.try_send((symbol.to_string(), price)) {
        warn!(symbol, error = %e, "dropped tick: strategy dispatch channel full or closed");
    }
}

/// Deterministic, seedless random-walk generator over `symbols`, one tick
/// per symbol every `interval`. Only meant to exercise the pipeline when no
/// real market data source is configured; never used when `dry_run` is off.
pub fn run_demo_feed(
    symbols: Vec<String>,
    starting_prices: Vec<f64>,
    bus: Arc<Bus>,
    dispatch_tx: mpsc::Sender<(String, f64)>,
    interval: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut prices: Vec<f64> = starting_prices;
        let mut ticker = tokio::time::interval(interval);
        let mut step: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            for (i, symbol) in symbols.iter().enumerate() {
                step = step.wrapping_add(1);
                let drift = pseudo_random_walk(step.wrapping_add(i as u64 * 7919));
                prices[i] = (prices[i] * (1.0 + drift)).max(0.01);
                intake(&bus, &dispatch_tx, symbol, prices[i]);
            }
        }
    });
}

/// A small xorshift-derived sequence, not `rand`, so the demo feed never
/// touches a CSPRNG reserved for credential/nonce generation (`crypto.rs`).
/// Returns a value in roughly `[-0.002, 0.002]`.
fn pseudo_random_walk(seed: u64) -> f64 {
    let mut x = seed ^ 0x9E3779B97F4A7C15;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    let unit = (x % 4001) as f64 / 4000.0; // [0, 1]
    (unit - 0.5) * 0.004
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn intake_publishes_tick_and_forwards_to_dispatch() {
        let bus = Bus::new();
        let mut sub = bus.subscribe();
        let (tx, mut rx) = mpsc::channel(4);

        intake(&bus, &tx, "BTCUSDT", 100.0);

        let event = sub.receiver.recv().await.unwrap();
        assert!(matches!(event, EngineEvent::PriceTick { symbol, price } if symbol == "BTCUSDT" && price == 100.0));

        let (symbol, price) = rx.recv().await.unwrap();
        assert_eq!(symbol, "BTCUSDT");
        assert_eq!(price, 100.0);
    }

    #[test]
    fn intake_rejects_non_finite_or_non_positive_prices() {
        let bus = Bus::new();
        let (tx, mut rx) = mpsc::channel(4);
        intake(&bus, &tx, "BTCUSDT", 0.0);
        intake(&bus, &tx, "BTCUSDT", -1.0);
        intake(&bus, &tx, "BTCUSDT", f64::NAN);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn pseudo_random_walk_stays_within_bounds() {
        for seed in 0..1000u64 {
            let v = pseudo_random_walk(seed);
            assert!(v >= -0.002 && v <= 0.002);
        }
    }
}
