// =============================================================================
// Strategy Engine — bounded-concurrency dispatcher over user strategy instances
// =============================================================================
//
// Strategy *content* (the actual trading decision) lives behind the
// `Strategy` trait (see `domain::strategy`) and is registered per
// `strategy_type`; this module only owns the dispatch loop: refresh the
// shared price/indicator state, fan a tick out to every active instance
// tracking that symbol, and isolate panics per instance so one bad strategy
// never takes others down with it.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::domain::strategy::{Strategy, StrategyInstance};
use crate::error::EngineError;
use crate::event_bus::{Bus, EngineEvent};
use crate::indicators::engine::IndicatorEngine;
use crate::persistence::Store;
use crate::price_cache::PriceCache;
use crate::types::StrategyStatus;

/// `max(4, 2 × logical_cpus)` — the dispatch worker pool's slot count.
fn default_worker_pool_size() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (2 * cpus).max(4)
}

struct StrategyEntry {
    instance: RwLock<StrategyInstance>,
    implementation: Arc<dyn Strategy>,
    /// Held for the duration of an `on_tick` call so two ticks for the same
    /// instance can never run concurrently, even if a slow tick is still
    /// in flight when the next one arrives.
    dispatch_lock: AsyncMutex<()>,
}

pub struct StrategyEngine {
    entries: RwLock<HashMap<String, Arc<StrategyEntry>>>,
    registry: RwLock<HashMap<String, Arc<dyn Strategy>>>,
    store: Arc<dyn Store>,
    bus: Arc<Bus>,
    indicators: Arc<IndicatorEngine>,
    prices: Arc<PriceCache>,
    worker_slots: Arc<Semaphore>,
}

impl StrategyEngine {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<Bus>,
        indicators: Arc<IndicatorEngine>,
        prices: Arc<PriceCache>,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            registry: RwLock::new(HashMap::new()),
            store,
            bus,
            indicators,
            prices,
            worker_slots: Arc::new(Semaphore::new(default_worker_pool_size())),
        }
    }

    /// Wire a concrete implementation to every instance tagged with
    /// `strategy_type`. Must be called before `load_from_store`/`add` for
    /// that type, or the instance is skipped.
    pub fn register_type(&self, strategy_type: impl Into<String>, implementation: Arc<dyn Strategy>) {
        self.registry.write().insert(strategy_type.into(), implementation);
    }

    /// Load every `active=true` instance from the store and wire it to its
    /// registered implementation. Instances whose type has none registered
    /// are left in the store untouched but not dispatched to.
    pub async fn load_from_store(&self) -> Result<(), EngineError> {
        let rows = self.store.list_active_strategies().await?;
        for row in rows {
            self.add(row);
        }
        Ok(())
    }

    pub fn add(&self, instance: StrategyInstance) {
        let implementation = match self.registry.read().get(&instance.strategy_type).cloned() {
            Some(imp) => imp,
            None => {
                warn!(
                    strategy_id = instance.id,
                    strategy_type = instance.strategy_type,
                    "no implementation registered for strategy type, skipping dispatch"
                );
                return;
            }
        };
        let id = instance.id.clone();
        self.entries.write().insert(
            id,
            Arc::new(StrategyEntry {
                instance: RwLock::new(instance),
                implementation,
                dispatch_lock: AsyncMutex::new(()),
            }),
        );
    }

    pub fn remove(&self, strategy_id: &str) {
        self.entries.write().remove(strategy_id);
    }

    pub fn pause(&self, strategy_id: &str) {
        if let Some(entry) = self.entries.read().get(strategy_id) {
            entry.instance.write().status = StrategyStatus::Paused;
        }
    }

    pub fn resume(&self, strategy_id: &str) {
        if let Some(entry) = self.entries.read().get(strategy_id) {
            entry.instance.write().status = StrategyStatus::Active;
        }
    }

    pub fn get_state(&self, strategy_id: &str) -> Option<StrategyInstance> {
        self.entries.read().get(strategy_id).map(|e| e.instance.read().clone())
    }

    pub fn set_state(&self, strategy_id: &str, instance: StrategyInstance) {
        if let Some(entry) = self.entries.read().get(strategy_id) {
            *entry.instance.write() = instance;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handle one incoming tick: refresh the shared price/indicator state,
    /// then fan out to every active, non-paused instance tracking `symbol`.
    /// No ordering is guaranteed across strategies on the same tick.
    pub async fn dispatch_tick(self: &Arc<Self>, symbol: &str, price: f64) {
        self.prices.set(symbol, price);
        let indicators = Arc::new(self.indicators.update(symbol, price));

        let targets: Vec<Arc<StrategyEntry>> = self
            .entries
            .read()
            .values()
            .filter(|e| {
                let inst = e.instance.read();
                inst.symbol == symbol && inst.is_active()
            })
            .cloned()
            .collect();

        let mut handles = Vec::with_capacity(targets.len());
        for entry in targets {
            let permit = match self.worker_slots.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => continue, // pool closed during shutdown
            };
            let bus = self.bus.clone();
            let store = self.store.clone();
            let symbol = symbol.to_string();
            let indicators = indicators.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let _guard = entry.dispatch_lock.lock().await;

                let strategy_id = entry.instance.read().id.clone();
                let implementation = entry.implementation.clone();

                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    implementation.on_tick(&symbol, price, indicators.as_ref())
                }));

                match result {
                    Ok(Some(signal)) => {
                        bus.publish(EngineEvent::StrategySignal {
                            strategy_id,
                            signal,
                        });
                    }
                    Ok(None) => {}
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!(strategy_id, message, "strategy panicked, quarantining instance");

                        let quarantined = {
                            let mut inst = entry.instance.write();
                            inst.status = StrategyStatus::Error;
                            inst.clone()
                        };
                        if let Err(e) = store.put_strategy(quarantined).await {
                            warn!(strategy_id, error = %e, "failed to persist quarantined strategy status");
                        }

                        bus.publish(EngineEvent::StrategyError { strategy_id, message });
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Spawn the dispatch loop, consuming `price_stream` until `cancel`
    /// fires or the stream closes.
    pub fn start(
        self: Arc<Self>,
        mut price_stream: mpsc::Receiver<(String, f64)>,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    tick = price_stream.recv() => {
                        match tick {
                            Some((symbol, price)) => self.dispatch_tick(&symbol, price).await,
                            None => return,
                        }
                    }
                }
            }
        });
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "strategy panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::strategy::Signal;
    use crate::persistence::memory::MemoryStore;
    use crate::types::{ProfitTargetType, Side};
    use chrono::Utc;

    struct AlwaysSignal;
    impl Strategy for AlwaysSignal {
        fn on_tick(&self, symbol: &str, price: f64, _indicators: &HashMap<String, f64>) -> Option<Signal> {
            Some(Signal {
                strategy_id: "unused".into(),
                symbol: symbol.to_string(),
                side: Side::Buy,
                size: 1.0,
                price,
            })
        }
    }

    struct AlwaysPanics;
    impl Strategy for AlwaysPanics {
        fn on_tick(&self, _symbol: &str, _price: f64, _indicators: &HashMap<String, f64>) -> Option<Signal> {
            panic!("boom");
        }
    }

    fn sample_instance(id: &str, strategy_type: &str) -> StrategyInstance {
        StrategyInstance {
            id: id.into(),
            user_id: "u1".into(),
            connection_id: None,
            strategy_type: strategy_type.into(),
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            params: HashMap::new(),
            status: StrategyStatus::Active,
            profit_target: 0.0,
            profit_target_type: ProfitTargetType::Absolute,
            initial_capital: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn build_engine() -> Arc<StrategyEngine> {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let bus = Arc::new(Bus::new());
        let indicators = Arc::new(IndicatorEngine::new());
        let prices = Arc::new(PriceCache::new());
        Arc::new(StrategyEngine::new(store, bus, indicators, prices))
    }

    #[tokio::test]
    async fn dispatch_emits_signal_for_active_instance() {
        let engine = build_engine();
        engine.register_type("always_signal", Arc::new(AlwaysSignal));
        engine.add(sample_instance("s1", "always_signal"));

        let mut sub = engine.bus.subscribe();
        engine.dispatch_tick("BTCUSDT", 100.0).await;

        let event = sub.receiver.recv().await.unwrap();
        match event {
            EngineEvent::StrategySignal { strategy_id, signal } => {
                assert_eq!(strategy_id, "s1");
                assert_eq!(signal.symbol, "BTCUSDT");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn paused_instance_is_not_dispatched() {
        let engine = build_engine();
        engine.register_type("always_signal", Arc::new(AlwaysSignal));
        let mut instance = sample_instance("s1", "always_signal");
        instance.status = StrategyStatus::Paused;
        engine.add(instance);

        let mut sub = engine.bus.subscribe();
        engine.dispatch_tick("BTCUSDT", 100.0).await;

        assert!(sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregistered_strategy_type_is_not_added() {
        let engine = build_engine();
        engine.add(sample_instance("s1", "no_such_type"));
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn panicking_strategy_is_quarantined_and_others_unaffected() {
        let engine = build_engine();
        engine.register_type("panics", Arc::new(AlwaysPanics));
        engine.register_type("always_signal", Arc::new(AlwaysSignal));
        engine.add(sample_instance("bad", "panics"));
        engine.add(sample_instance("good", "always_signal"));

        let mut sub = engine.bus.subscribe();
        engine.dispatch_tick("BTCUSDT", 100.0).await;

        let mut saw_error = false;
        let mut saw_signal = false;
        for _ in 0..2 {
            match sub.receiver.recv().await.unwrap() {
                EngineEvent::StrategyError { strategy_id, .. } => {
                    assert_eq!(strategy_id, "bad");
                    saw_error = true;
                }
                EngineEvent::StrategySignal { strategy_id, .. } => {
                    assert_eq!(strategy_id, "good");
                    saw_signal = true;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(saw_error && saw_signal);

        assert_eq!(engine.get_state("bad").unwrap().status, StrategyStatus::Error);
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips_status() {
        let engine = build_engine();
        engine.register_type("always_signal", Arc::new(AlwaysSignal));
        engine.add(sample_instance("s1", "always_signal"));

        engine.pause("s1");
        assert_eq!(engine.get_state("s1").unwrap().status, StrategyStatus::Paused);
        engine.resume("s1");
        assert_eq!(engine.get_state("s1").unwrap().status, StrategyStatus::Active);
    }
}
