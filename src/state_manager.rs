// =============================================================================
// State Manager — authoritative per-(user_id, symbol) positions
// =============================================================================
//
// The in-memory map is the source of truth the risk and fill-consumer code
// reads against; the persistence store is its durability backstop, not the
// other way around. `load()` must run once at startup before any fill is
// processed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::domain::position::Position;
use crate::error::EngineError;
use crate::persistence::Store;
use crate::types::Side;

pub struct StateManager {
    positions: RwLock<HashMap<(String, String), Position>>,
    store: Arc<dyn Store>,
}

impl StateManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Load every persisted position row into memory for the given set of
    /// users. Must run before the engine starts accepting fills. The store
    /// contract only exposes per-user listing, so the caller supplies the
    /// active user set (see `main.rs`, which derives it from active
    /// strategy instances).
    pub async fn load(&self, user_ids: &[String]) -> Result<(), EngineError> {
        for user_id in user_ids {
            self.load_user(user_id).await?;
        }
        Ok(())
    }

    async fn load_user(&self, user_id: &str) -> Result<(), EngineError> {
        let rows = self.store.list_positions_for_user(user_id).await?;
        let mut positions = self.positions.write();
        for row in rows {
            positions.insert((row.user_id.clone(), row.symbol.clone()), row);
        }
        Ok(())
    }

    pub fn position(&self, user_id: &str, symbol: &str) -> Position {
        self.positions
            .read()
            .get(&(user_id.to_string(), symbol.to_string()))
            .cloned()
            .unwrap_or_else(|| Position::flat(user_id, symbol))
    }

    pub fn positions(&self, user_id: &str) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Fold a fill into the authoritative position, persist it, and return
    /// `(new_position, prev_position)` so the fill consumer can compute
    /// realized PnL on the closed portion.
    pub async fn record_fill(
        &self,
        user_id: &str,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
    ) -> Result<(Position, Position), EngineError> {
        let key = (user_id.to_string(), symbol.to_string());
        let prev = self.position(user_id, symbol);

        let mut new_position = prev.clone();
        new_position.apply_fill(side, qty, price);

        self.positions.write().insert(key, new_position.clone());
        self.store.upsert_position(new_position.clone()).await?;

        Ok((new_position, prev))
    }
}
