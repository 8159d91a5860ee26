// =============================================================================
// Support / Resistance Levels
// =============================================================================
//
// 1. Pivots: close[i] for every candle whose high is the highest, or whose low
//    is the lowest, of the five candles centred on it.
// 2. eps = sample std of all closes * eps_multiplier.
// 3. Pivots are density-clustered with radius eps and `min_hits` as the
//    minimum neighbourhood size. Each cluster becomes one level priced at the
//    mean of its pivots.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AnalysisError;
use crate::indicators::cluster::cluster_1d;
use crate::indicators::stats::{mean, sample_std_dev};
use crate::types::{Candle, Level};

/// Candles on each side of a pivot candidate.
pub const PIVOT_WING: usize = 2;

/// Smallest series that can contain a pivot.
pub const MIN_CANDLES: usize = 2 * PIVOT_WING + 1;

/// Tuning for level detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelParams {
    pub eps_multiplier: f64,
    pub min_hits: usize,
}

impl LevelParams {
    pub fn validate(&self) -> Result<(), AnalysisError> {
        if !self.eps_multiplier.is_finite() || self.eps_multiplier <= 0.0 {
            return Err(AnalysisError::InvalidEpsMultiplier(self.eps_multiplier));
        }
        if self.min_hits == 0 {
            return Err(AnalysisError::InvalidMinHits);
        }
        Ok(())
    }
}

impl Default for LevelParams {
    fn default() -> Self {
        Self {
            eps_multiplier: 1.2,
            min_hits: 2,
        }
    }
}

/// Closes of the local swing highs and lows, in series order.
pub fn find_pivots(candles: &[Candle]) -> Vec<f64> {
    if candles.len() < MIN_CANDLES {
        return Vec::new();
    }

    (PIVOT_WING..candles.len() - PIVOT_WING)
        .filter(|&i| {
            let window = &candles[i - PIVOT_WING..=i + PIVOT_WING];
            let max_high = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
            let min_low = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
            candles[i].high == max_high || candles[i].low == min_low
        })
        .map(|i| candles[i].close)
        .collect()
}

/// Detect support/resistance levels, ascending by price.
///
/// Too little data is not an error: fewer than five candles, or fewer pivots
/// than `min_hits`, yields an empty set.
pub fn detect_levels(candles: &[Candle], params: LevelParams) -> Result<Vec<Level>, AnalysisError> {
    params.validate()?;

    let pivots = find_pivots(candles);
    if pivots.len() < params.min_hits {
        debug!(pivots = pivots.len(), min_hits = params.min_hits, "not enough pivots");
        return Ok(Vec::new());
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let Some(std_dev) = sample_std_dev(&closes) else {
        return Ok(Vec::new());
    };
    let eps = std_dev * params.eps_multiplier;

    let mut levels: Vec<Level> = cluster_1d(&pivots, eps, params.min_hits)
        .into_iter()
        .filter_map(|cluster| {
            Some(Level {
                price: mean(&cluster)?,
                hits: cluster.len(),
            })
        })
        .collect();
    levels.sort_by(|a, b| a.price.total_cmp(&b.price));

    debug!(pivots = pivots.len(), eps, levels = levels.len(), "levels detected");
    Ok(levels)
}
