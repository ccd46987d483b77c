// =============================================================================
// API — HTTP/WebSocket introspection and control surface
// =============================================================================
//
// Thin glue over the engine's internal managers: read-only position/balance/
// order views plus the handful of operator controls (trading mode switch,
// strategy pause/resume) the engine itself exposes. Wire protocols, auth
// token issuance, and presentation concerns live outside the core.

pub mod auth;
pub mod rest;
pub mod ws;
