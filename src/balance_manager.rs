// =============================================================================
// Balance Manager — per-user {total, locked} capital tracking
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::error::EngineError;
use crate::types::BalanceSource;

pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(60 * 60);
pub const EVICTION_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BalanceSnapshot {
    pub total: f64,
    pub locked: f64,
    pub available: f64,
}

struct State {
    total: f64,
    locked: f64,
}

pub struct BalanceManager {
    state: RwLock<State>,
    source: BalanceSource,
}

impl BalanceManager {
    pub fn new(initial_total: f64, source: BalanceSource) -> Self {
        Self {
            state: RwLock::new(State {
                total: initial_total,
                locked: 0.0,
            }),
            source,
        }
    }

    pub fn lock(&self, amount: f64) -> Result<(), EngineError> {
        let mut state = self.state.write();
        let available = state.total - state.locked;
        if available < amount {
            return Err(EngineError::InsufficientBalance {
                requested: amount,
                available,
            });
        }
        state.locked += amount;
        Ok(())
    }

    pub fn unlock(&self, amount: f64) {
        let mut state = self.state.write();
        state.locked = (state.locked - amount).max(0.0);
    }

    pub fn deduct(&self, amount: f64) {
        let mut state = self.state.write();
        state.total -= amount;
        state.locked = (state.locked - amount).max(0.0);
    }

    pub fn add(&self, amount: f64) {
        self.state.write().total += amount;
    }

    pub fn get_snapshot(&self) -> BalanceSnapshot {
        let state = self.state.read();
        BalanceSnapshot {
            total: state.total,
            locked: state.locked,
            available: (state.total - state.locked).max(0.0),
        }
    }

    pub fn source(&self) -> BalanceSource {
        self.source
    }
}

struct TrackedManager {
    manager: std::sync::Arc<BalanceManager>,
    last_seen: RwLock<Instant>,
}

/// Mirrors `risk_manager::MultiUserRiskManager`'s factory + idle-eviction
/// shape. `fixed_balance` backs dry-run mode: every user starts from the
/// same configured total rather than a real exchange balance query.
pub struct MultiUserBalanceManager {
    managers: RwLock<HashMap<String, TrackedManager>>,
    initial_total: f64,
    source: BalanceSource,
    idle_ttl: Duration,
}

impl MultiUserBalanceManager {
    pub fn new(initial_total: f64, source: BalanceSource) -> Self {
        Self {
            managers: RwLock::new(HashMap::new()),
            initial_total,
            source,
            idle_ttl: DEFAULT_IDLE_TTL,
        }
    }

    pub fn get_or_create(&self, user_id: &str) -> std::sync::Arc<BalanceManager> {
        if let Some(tracked) = self.managers.read().get(user_id) {
            *tracked.last_seen.write() = Instant::now();
            return tracked.manager.clone();
        }

        let mut managers = self.managers.write();
        let entry = managers.entry(user_id.to_string()).or_insert_with(|| TrackedManager {
            manager: std::sync::Arc::new(BalanceManager::new(self.initial_total, self.source)),
            last_seen: RwLock::new(Instant::now()),
        });
        *entry.last_seen.write() = Instant::now();
        entry.manager.clone()
    }

    pub fn len(&self) -> usize {
        self.managers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evict_idle(&self) {
        let now = Instant::now();
        let mut managers = self.managers.write();
        let before = managers.len();
        managers.retain(|_, tracked| now.duration_since(*tracked.last_seen.read()) < self.idle_ttl);
        let evicted = before - managers.len();
        if evicted > 0 {
            info!(evicted, "evicted idle balance managers");
        }
    }

    pub fn start(self: &std::sync::Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EVICTION_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                this.evict_idle();
            }
        });
    }
}
