// =============================================================================
// Domain Model
// =============================================================================
//
// One file per entity from the data model, mirroring the engine's
// one-concern-per-file convention. These types are the shapes persisted by
// the store (`persistence::Store`) and carried on the event bus; the managers
// that operate on them (`risk_manager`, `balance_manager`, `state_manager`,
// ...) live in their own top-level modules.

pub mod connection;
pub mod order;
pub mod position;
pub mod risk_config;
pub mod stop_loss;
pub mod strategy;
pub mod trade;
pub mod user;
