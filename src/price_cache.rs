// =============================================================================
// PriceCache — sharded last-trade-price lookup shared across the engine
// =============================================================================
//
// Sharded into 16 stripes keyed by a cheap hash of the symbol so that
// concurrent writers for different symbols never contend on the same lock.
// This is a plain cache, not an event source — consumers that need to react
// to price changes subscribe to `PriceTick` on the event bus instead.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;

const STRIPES: usize = 16;

pub struct PriceCache {
    shards: Vec<RwLock<HashMap<String, f64>>>,
}

impl PriceCache {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(STRIPES);
        for _ in 0..STRIPES {
            shards.push(RwLock::new(HashMap::new()));
        }
        Self { shards }
    }

    fn shard_for(&self, symbol: &str) -> &RwLock<HashMap<String, f64>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        symbol.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % STRIPES;
        &self.shards[idx]
    }

    pub fn set(&self, symbol: &str, price: f64) {
        self.shard_for(symbol).write().insert(symbol.to_string(), price);
    }

    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.shard_for(symbol).read().get(symbol).copied()
    }

    /// Same as `get` but falls back to `1.0` as a last-resort guard,
    /// matching the fill-consumer's zero-price fallback chain.
    pub fn get_or_guard(&self, symbol: &str) -> f64 {
        self.get(symbol).filter(|p| *p > 0.0).unwrap_or(1.0)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.shards
            .iter()
            .flat_map(|s| s.read().keys().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Drop prices for symbols not in `valid_symbols`, per shard.
    pub fn cleanup(&self, valid_symbols: &[String]) {
        for shard in &self.shards {
            shard.write().retain(|symbol, _| valid_symbols.iter().any(|s| s == symbol));
        }
    }
}

impl Default for PriceCache {
    fn default() -> Self {
        Self::new()
    }
}
