//! Market regime classification and the regime weight table.
//!
//! Regime adjustments are negative-only: a source's weight may be *reduced*
//! in adverse regimes, never boosted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Market regime classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketRegime {
    /// Elevated volatility; opinions are noisier, weights may be trimmed
    HighVol,
    /// Suppressed volatility
    LowVol,
    /// Strong directional consistency in recent price moves
    Trending,
    /// Range-bound, mean-reverting
    Ranging,
}

impl MarketRegime {
    /// Classify from a short/long volatility ratio and trend-direction
    /// consistency (0.0 = no trend, 1.0 = perfect trend).
    pub fn classify(vol_ratio: Option<f64>, trend_strength: Option<f64>) -> MarketRegime {
        if let Some(ratio) = vol_ratio {
            if ratio >= 2.0 {
                return MarketRegime::HighVol;
            }
            if ratio <= 0.5 {
                return MarketRegime::LowVol;
            }
        }
        if let Some(strength) = trend_strength {
            if strength >= 0.7 {
                return MarketRegime::Trending;
            }
        }
        MarketRegime::Ranging
    }

    pub fn key(&self) -> &'static str {
        match self {
            MarketRegime::HighVol => "high_vol",
            MarketRegime::LowVol => "low_vol",
            MarketRegime::Trending => "trending",
            MarketRegime::Ranging => "ranging",
        }
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketRegime::HighVol => write!(f, "HighVol"),
            MarketRegime::LowVol => write!(f, "LowVol"),
            MarketRegime::Trending => write!(f, "Trending"),
            MarketRegime::Ranging => write!(f, "Ranging"),
        }
    }
}

/// Per-regime weight multipliers, loaded from configuration. Missing entries
/// default to 1.0; values above 1.0 are clamped down to 1.0.
#[derive(Debug, Clone, Default)]
pub struct RegimeWeights {
    multipliers: HashMap<String, f64>,
}

impl RegimeWeights {
    pub fn new(multipliers: HashMap<String, f64>) -> Self {
        Self { multipliers }
    }

    /// Multiplier for the given regime, always within (0, 1].
    pub fn multiplier(&self, regime: MarketRegime) -> f64 {
        self.multipliers
            .get(regime.key())
            .copied()
            .unwrap_or(1.0)
            .clamp(f64::MIN_POSITIVE, 1.0)
    }
}
