// =============================================================================
// Indicators Module
// =============================================================================
//
// Pure, side-effect-free analysis over candle series. Insufficient data yields
// an empty result; only invalid parameters are errors.

pub mod cluster;
pub mod levels;
pub mod stats;

pub use levels::{detect_levels, LevelParams};
