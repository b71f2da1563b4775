use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// A named set of hard capital-safety bounds.
///
/// The governor is limit-set-agnostic: it reads whichever profile is active.
/// The prop-firm profile exists for deployments trading firm capital under
/// externally imposed rules; every bound is tighter than the default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Decline from peak equity that forces a HALT (0.05 = 5%).
    pub max_drawdown_pct: f64,
    /// Daily loss relative to day-open equity that forces a HALT.
    pub daily_loss_limit_pct: f64,
    /// Ceiling on the per-position buying-power fraction.
    pub max_position_size_pct: Decimal,
    /// Minimum decision confidence with two or more contributing sources.
    pub min_confidence: f64,
    /// Stricter minimum applied when exactly one source contributed.
    pub min_confidence_single_source: f64,
    /// Hard cap on concurrent open positions.
    pub max_open_positions: u32,
    /// Widest stop distance permitted, as a fraction of entry price.
    pub max_stop_loss_pct: Decimal,
    /// Symbols the profile permits trading. Empty means all configured
    /// symbols are allowed.
    #[serde(default)]
    pub allowed_symbols: Vec<String>,
}

impl RiskLimits {
    /// Standard self-directed limits.
    pub fn default_profile() -> Self {
        Self {
            max_drawdown_pct: 0.05,
            daily_loss_limit_pct: 0.03,
            max_position_size_pct: dec!(0.10),
            min_confidence: 65.0,
            min_confidence_single_source: 80.0,
            max_open_positions: 5,
            max_stop_loss_pct: dec!(0.05),
            allowed_symbols: Vec::new(),
        }
    }

    /// Stricter compliance profile for prop-firm deployments.
    pub fn prop_firm() -> Self {
        Self {
            max_drawdown_pct: 0.02,
            daily_loss_limit_pct: 0.015,
            max_position_size_pct: dec!(0.05),
            min_confidence: 75.0,
            min_confidence_single_source: 90.0,
            max_open_positions: 2,
            max_stop_loss_pct: dec!(0.02),
            allowed_symbols: Vec::new(),
        }
    }

    /// Minimum confidence for a given contributing-source count. A single
    /// surviving source must clear a materially higher bar.
    pub fn min_confidence_for(&self, contributing_sources: usize) -> f64 {
        if contributing_sources <= 1 {
            self.min_confidence_single_source
        } else {
            self.min_confidence
        }
    }

    pub fn is_symbol_allowed(&self, symbol: &str) -> bool {
        self.allowed_symbols.is_empty() || self.allowed_symbols.iter().any(|s| s == symbol)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !(0.0..=1.0).contains(&self.max_drawdown_pct) || self.max_drawdown_pct == 0.0 {
            errors.push("max_drawdown_pct must be within (0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.daily_loss_limit_pct) || self.daily_loss_limit_pct == 0.0 {
            errors.push("daily_loss_limit_pct must be within (0, 1]".to_string());
        }
        if self.max_position_size_pct <= Decimal::ZERO
            || self.max_position_size_pct > Decimal::ONE
        {
            errors.push("max_position_size_pct must be within (0, 1]".to_string());
        }
        if !(0.0..=100.0).contains(&self.min_confidence) {
            errors.push("min_confidence must be within [0, 100]".to_string());
        }
        if self.min_confidence_single_source < self.min_confidence {
            errors.push(
                "min_confidence_single_source must not be below min_confidence".to_string(),
            );
        }
        if self.max_open_positions == 0 {
            errors.push("max_open_positions must be positive".to_string());
        }
        if self.max_stop_loss_pct <= Decimal::ZERO {
            errors.push("max_stop_loss_pct must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_profiles_validate() {
        assert!(RiskLimits::default_profile().validate().is_ok());
        assert!(RiskLimits::prop_firm().validate().is_ok());
    }

    #[test]
    fn test_prop_firm_is_strictly_tighter() {
        let default = RiskLimits::default_profile();
        let prop = RiskLimits::prop_firm();
        assert!(prop.max_drawdown_pct < default.max_drawdown_pct);
        assert!(prop.daily_loss_limit_pct < default.daily_loss_limit_pct);
        assert!(prop.max_position_size_pct < default.max_position_size_pct);
        assert!(prop.min_confidence > default.min_confidence);
        assert!(prop.max_open_positions < default.max_open_positions);
        assert!(prop.max_stop_loss_pct < default.max_stop_loss_pct);
    }

    #[test]
    fn test_single_source_minimum_is_higher() {
        let limits = RiskLimits::default_profile();
        assert!(limits.min_confidence_for(1) > limits.min_confidence_for(3));
        assert_eq!(limits.min_confidence_for(2), limits.min_confidence);
    }

    #[test]
    fn test_symbol_allowlist() {
        let mut limits = RiskLimits::default_profile();
        assert!(limits.is_symbol_allowed("BTC/USD"));

        limits.allowed_symbols = vec!["BTC/USD".to_string()];
        assert!(limits.is_symbol_allowed("BTC/USD"));
        assert!(!limits.is_symbol_allowed("DOGE/USD"));
    }

    #[test]
    fn test_invalid_single_source_minimum_rejected() {
        let mut limits = RiskLimits::default_profile();
        limits.min_confidence_single_source = limits.min_confidence - 10.0;
        assert!(limits.validate().is_err());
    }
}
