// =============================================================================
// Indicator Engine — pure-function contract boundary for strategy content
// =============================================================================
//
// Indicator mathematics (EMA, RSI, or anything else a strategy wants) is
// strategy content, out of scope for this engine — the same boundary
// `domain::strategy::Strategy` draws for signal logic. This engine owns no
// indicator math of its own: it is the seam the tick dispatcher calls on
// every tick, and an optional `IndicatorProvider` is where real computation
// plugs in. With no provider registered, `update` reduces to the one value
// the engine itself is authoritative over — the last observed price.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Capability a concrete indicator-math implementation provides. Mirrors
/// `domain::strategy::Strategy`'s role for signal logic: this engine never
/// implements one, only calls through to whatever is registered.
pub trait IndicatorProvider: Send + Sync {
    /// Compute this tick's indicator snapshot for `symbol`. Implementations
    /// own their own rolling history internally.
    fn update(&self, symbol: &str, price: f64) -> HashMap<String, f64>;
}

/// Calls into an optional `IndicatorProvider` on every tick; with none
/// registered, only `last_price` is ever populated.
pub struct IndicatorEngine {
    provider: RwLock<Option<Arc<dyn IndicatorProvider>>>,
}

impl IndicatorEngine {
    pub fn new() -> Self {
        Self {
            provider: RwLock::new(None),
        }
    }

    /// Plug in a concrete indicator-math implementation.
    pub fn set_provider(&self, provider: Arc<dyn IndicatorProvider>) {
        *self.provider.write() = Some(provider);
    }

    /// Called once per incoming tick, before the strategy dispatcher fans
    /// the tick out (see `strategy_engine::StrategyEngine::dispatch_tick`).
    /// Returns only `last_price` when no provider is registered; callers
    /// must treat a missing key as "not ready yet", never as zero.
    pub fn update(&self, symbol: &str, price: f64) -> HashMap<String, f64> {
        if !price.is_finite() || price <= 0.0 {
            return HashMap::new();
        }

        let mut out = match self.provider.read().as_ref() {
            Some(provider) => provider.update(symbol, price),
            None => HashMap::new(),
        };
        out.insert("last_price".to_string(), price);
        out
    }
}

impl Default for IndicatorEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_returns_last_price_with_no_provider_registered() {
        let engine = IndicatorEngine::new();
        let out = engine.update("BTCUSDT", 100.0);
        assert_eq!(out.get("last_price"), Some(&100.0));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn update_rejects_non_finite_or_non_positive() {
        let engine = IndicatorEngine::new();
        assert!(engine.update("BTCUSDT", 0.0).is_empty());
        assert!(engine.update("BTCUSDT", -5.0).is_empty());
        assert!(engine.update("BTCUSDT", f64::NAN).is_empty());
    }

    struct FixedProvider;
    impl IndicatorProvider for FixedProvider {
        fn update(&self, _symbol: &str, _price: f64) -> HashMap<String, f64> {
            let mut m = HashMap::new();
            m.insert("ema_9".to_string(), 42.0);
            m
        }
    }

    #[test]
    fn update_delegates_to_registered_provider() {
        let engine = IndicatorEngine::new();
        engine.set_provider(Arc::new(FixedProvider));
        let out = engine.update("BTCUSDT", 100.0);
        assert_eq!(out.get("ema_9"), Some(&42.0));
        assert_eq!(out.get("last_price"), Some(&100.0));
    }
}
