// =============================================================================
// Indicators — out-of-scope contract boundary
// =============================================================================
//
// Indicator mathematics is strategy content, not engine content (see
// `domain::strategy::Strategy`) — this module only defines the seam the
// tick dispatcher calls into, never the math itself.

pub mod engine;
