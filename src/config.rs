use std::collections::HashMap;
use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::domain::{Instrument, InstrumentCatalog};
use crate::risk::RiskLimits;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub risk: RiskGovernorConfig,
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Tradable instruments; symbols not listed here cannot be sized.
    #[serde(default)]
    pub instruments: Vec<InstrumentEntry>,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Health/status server port (default: 8090)
    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

fn default_health_port() -> u16 {
    8090
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Symbols worked by the background cycle.
    pub symbols: Vec<String>,
    /// Cycle interval in seconds.
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    /// Maximum symbols processed concurrently per cycle.
    #[serde(default = "default_worker_pool")]
    pub worker_pool_size: usize,
    /// Cycle is considered stalled after this many intervals without a
    /// heartbeat.
    #[serde(default = "default_liveness_factor")]
    pub liveness_factor: u32,
    /// Maximum cycle restarts within the restart window before backing off.
    #[serde(default = "default_max_restarts")]
    pub max_restarts_per_window: u32,
    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,
    /// Account snapshot cache TTL.
    #[serde(default = "default_account_ttl")]
    pub account_cache_ttl_secs: u64,
}

fn default_cycle_interval() -> u64 {
    5
}
fn default_worker_pool() -> usize {
    4
}
fn default_liveness_factor() -> u32 {
    3
}
fn default_max_restarts() -> u32 {
    5
}
fn default_restart_window() -> u64 {
    300
}
fn default_account_ttl() -> u64 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTC/USD".to_string(), "ETH/USD".to_string()],
            cycle_interval_secs: default_cycle_interval(),
            worker_pool_size: default_worker_pool(),
            liveness_factor: default_liveness_factor(),
            max_restarts_per_window: default_max_restarts(),
            restart_window_secs: default_restart_window(),
            account_cache_ttl_secs: default_account_ttl(),
        }
    }
}

/// Consensus tuning. The bonus/floor/epsilon values were tuned empirically;
/// they are configuration, not contract.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusConfig {
    /// Per-source fetch timeout in milliseconds.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,
    /// Opinions observed earlier than this are excluded before voting.
    #[serde(default = "default_opinion_max_age")]
    pub opinion_max_age_secs: u64,
    /// NEUTRAL opinions at or above this confidence are split into
    /// half-weight LONG and SHORT votes instead of being discarded.
    #[serde(default = "default_neutral_floor")]
    pub neutral_split_floor: f64,
    /// Weighted direction scores within this distance of zero produce no
    /// decision.
    #[serde(default = "default_direction_epsilon")]
    pub direction_epsilon: f64,
    /// Fraction of contributing sources that must agree for the bonus.
    #[serde(default = "default_agreement_threshold")]
    pub agreement_threshold: f64,
    #[serde(default = "default_agreement_bonus_min")]
    pub agreement_bonus_min: f64,
    #[serde(default = "default_agreement_bonus_max")]
    pub agreement_bonus_max: f64,
    /// Decisions older than this expire instead of executing.
    #[serde(default = "default_decision_max_age")]
    pub decision_max_age_secs: u64,
    /// Consecutive hard auth failures after which a source self-disables
    /// for the rest of the session.
    #[serde(default = "default_source_auth_failures")]
    pub max_source_auth_failures: u32,
    /// Target distance from entry, as a fraction of entry price.
    #[serde(default = "default_target_pct")]
    pub target_pct: Decimal,
    /// Stop distance from entry, as a fraction of entry price.
    #[serde(default = "default_stop_pct")]
    pub stop_pct: Decimal,
    /// Per-regime weight multipliers; values above 1.0 are clamped since regime
    /// adjustment can only reduce a source's weight, never boost it.
    #[serde(default)]
    pub regime_multipliers: HashMap<String, f64>,
}

fn default_fetch_timeout() -> u64 {
    2_000
}
fn default_opinion_max_age() -> u64 {
    120
}
fn default_neutral_floor() -> f64 {
    55.0
}
fn default_direction_epsilon() -> f64 {
    0.5
}
fn default_agreement_threshold() -> f64 {
    0.66
}
fn default_agreement_bonus_min() -> f64 {
    5.0
}
fn default_agreement_bonus_max() -> f64 {
    15.0
}
fn default_decision_max_age() -> u64 {
    300
}
fn default_source_auth_failures() -> u32 {
    3
}
fn default_target_pct() -> Decimal {
    dec!(0.03)
}
fn default_stop_pct() -> Decimal {
    dec!(0.02)
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: default_fetch_timeout(),
            opinion_max_age_secs: default_opinion_max_age(),
            neutral_split_floor: default_neutral_floor(),
            direction_epsilon: default_direction_epsilon(),
            agreement_threshold: default_agreement_threshold(),
            agreement_bonus_min: default_agreement_bonus_min(),
            agreement_bonus_max: default_agreement_bonus_max(),
            decision_max_age_secs: default_decision_max_age(),
            max_source_auth_failures: default_source_auth_failures(),
            target_pct: default_target_pct(),
            stop_pct: default_stop_pct(),
            regime_multipliers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskGovernorConfig {
    /// Active limit profile name ("default" or "prop_firm", or a custom
    /// entry under `profiles`). Selected once per process lifetime.
    #[serde(default = "default_profile_name")]
    pub profile: String,
    /// Named limit profiles loaded from configuration; built-in profiles are
    /// used when a name is not listed here.
    #[serde(default)]
    pub profiles: HashMap<String, RiskLimits>,
    /// Governor re-evaluation interval in seconds.
    #[serde(default = "default_risk_poll")]
    pub poll_interval_secs: u64,
    /// Fraction of a limit at which the governor moves to WARNING.
    #[serde(default = "default_warning_fraction")]
    pub warning_fraction: f64,
    /// Consecutive execution failures that raise WARNING (advisory only).
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

fn default_profile_name() -> String {
    "default".to_string()
}
fn default_risk_poll() -> u64 {
    5
}
fn default_warning_fraction() -> f64 {
    0.75
}
fn default_max_consecutive_failures() -> u32 {
    3
}

impl Default for RiskGovernorConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            profiles: HashMap::new(),
            poll_interval_secs: default_risk_poll(),
            warning_fraction: default_warning_fraction(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl RiskGovernorConfig {
    /// Resolve the active limit profile: configured entry first, then the
    /// built-in profiles by name.
    pub fn active_limits(&self) -> Result<RiskLimits, ConfigError> {
        if let Some(limits) = self.profiles.get(&self.profile) {
            return Ok(limits.clone());
        }
        match self.profile.as_str() {
            "default" => Ok(RiskLimits::default_profile()),
            "prop_firm" => Ok(RiskLimits::prop_firm()),
            other => Err(ConfigError::Message(format!(
                "unknown risk profile: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SizingConfig {
    /// Fraction of buying power allocated per position.
    #[serde(default = "default_position_size_pct")]
    pub position_size_pct: Decimal,
    /// Confidence at or above which size is boosted.
    #[serde(default = "default_high_confidence_threshold")]
    pub high_confidence_threshold: f64,
    /// Boost applied at high confidence (0.5 = +50%).
    #[serde(default = "default_high_confidence_boost")]
    pub high_confidence_boost: f64,
    /// Realized volatility at which no scaling is applied; higher recent
    /// volatility scales size down proportionally.
    #[serde(default = "default_target_volatility")]
    pub target_volatility: f64,
    /// Floor for the volatility scale factor.
    #[serde(default = "default_min_volatility_scale")]
    pub min_volatility_scale: f64,
}

fn default_position_size_pct() -> Decimal {
    dec!(0.05)
}
fn default_high_confidence_threshold() -> f64 {
    90.0
}
fn default_high_confidence_boost() -> f64 {
    0.5
}
fn default_target_volatility() -> f64 {
    0.02
}
fn default_min_volatility_scale() -> f64 {
    0.25
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            position_size_pct: default_position_size_pct(),
            high_confidence_threshold: default_high_confidence_threshold(),
            high_confidence_boost: default_high_confidence_boost(),
            target_volatility: default_target_volatility(),
            min_volatility_scale: default_min_volatility_scale(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum primary submission attempts.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds (doubled per attempt).
    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Rate-limit failures multiply the computed backoff by this factor.
    #[serde(default = "default_rate_limit_multiplier")]
    pub rate_limit_multiplier: u32,
    /// Attempts per protective order.
    #[serde(default = "default_bracket_attempts")]
    pub bracket_attempts: u32,
    /// Fixed delay between protective order attempts in milliseconds.
    #[serde(default = "default_bracket_delay")]
    pub bracket_retry_delay_ms: u64,
    /// Allow degrading to a simulated fill when the live path is
    /// unavailable.
    #[serde(default = "default_true")]
    pub allow_degraded_fills: bool,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_backoff() -> u64 {
    250
}
fn default_max_backoff() -> u64 {
    5_000
}
fn default_rate_limit_multiplier() -> u32 {
    4
}
fn default_bracket_attempts() -> u32 {
    2
}
fn default_bracket_delay() -> u64 {
    250
}
fn default_true() -> bool {
    true
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff(),
            max_backoff_ms: default_max_backoff(),
            rate_limit_multiplier: default_rate_limit_multiplier(),
            bracket_attempts: default_bracket_attempts(),
            bracket_retry_delay_ms: default_bracket_delay(),
            allow_degraded_fills: default_true(),
        }
    }
}

/// Which broker implementation backs the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerMode {
    Paper,
    Rest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_mode")]
    pub mode: BrokerMode,
    /// REST API base URL (rest mode).
    #[serde(default = "default_broker_url")]
    pub rest_url: String,
    /// Environment variable holding the API key (rest mode). The key itself
    /// never appears in configuration files.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_broker_timeout")]
    pub request_timeout_ms: u64,
    /// Starting equity for the paper broker.
    #[serde(default = "default_paper_equity")]
    pub paper_starting_equity: Decimal,
}

fn default_broker_mode() -> BrokerMode {
    BrokerMode::Paper
}
fn default_broker_url() -> String {
    "https://api.broker.example".to_string()
}
fn default_api_key_env() -> String {
    "QUORUM_BROKER_API_KEY".to_string()
}
fn default_broker_timeout() -> u64 {
    5_000
}
fn default_paper_equity() -> Decimal {
    dec!(100000)
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mode: default_broker_mode(),
            rest_url: default_broker_url(),
            api_key_env: default_api_key_env(),
            request_timeout_ms: default_broker_timeout(),
            paper_starting_equity: default_paper_equity(),
        }
    }
}

/// Instrument entry as listed in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentEntry {
    pub symbol: String,
    pub class: crate::domain::AssetClass,
    pub fractional: Option<bool>,
    pub quantity_precision: Option<u32>,
    pub min_quantity: Option<Decimal>,
    pub min_order_value: Option<Decimal>,
}

impl InstrumentEntry {
    fn into_instrument(self) -> Instrument {
        let mut base = match self.class {
            crate::domain::AssetClass::Crypto => Instrument::crypto(self.symbol),
            crate::domain::AssetClass::Equity => Instrument::equity(self.symbol),
        };
        if let Some(fractional) = self.fractional {
            base.fractional = fractional;
        }
        if let Some(precision) = self.quantity_precision {
            base.quantity_precision = precision;
        }
        if let Some(min_quantity) = self.min_quantity {
            base.min_quantity = min_quantity;
        }
        if let Some(min_order_value) = self.min_order_value {
            base.min_order_value = min_order_value;
        }
        base
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rolled log files; stdout only when unset.
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g. config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("QUORUM_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Environment variable overrides (QUORUM_ENGINE__CYCLE_INTERVAL_SECS, ...)
            .add_source(
                Environment::with_prefix("QUORUM")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Build the instrument catalog, falling back to crypto defaults for the
    /// configured symbols when no instruments are listed.
    pub fn instrument_catalog(&self) -> InstrumentCatalog {
        if self.instruments.is_empty() {
            let instruments = self
                .engine
                .symbols
                .iter()
                .map(|s| {
                    if s.contains('/') {
                        Instrument::crypto(s.clone())
                    } else {
                        Instrument::equity(s.clone())
                    }
                })
                .collect();
            return InstrumentCatalog::new(instruments);
        }
        InstrumentCatalog::new(
            self.instruments
                .iter()
                .cloned()
                .map(InstrumentEntry::into_instrument)
                .collect(),
        )
    }

    /// Validate configuration values, returning every violation found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.engine.symbols.is_empty() {
            errors.push("engine.symbols must not be empty".to_string());
        }
        if self.engine.cycle_interval_secs == 0 {
            errors.push("engine.cycle_interval_secs must be positive".to_string());
        }
        if self.engine.worker_pool_size == 0 {
            errors.push("engine.worker_pool_size must be positive".to_string());
        }

        if !(0.0..=100.0).contains(&self.consensus.neutral_split_floor) {
            errors.push("consensus.neutral_split_floor must be within [0, 100]".to_string());
        }
        if self.consensus.agreement_bonus_min > self.consensus.agreement_bonus_max {
            errors.push(
                "consensus.agreement_bonus_min must not exceed agreement_bonus_max".to_string(),
            );
        }
        if !(0.0..=1.0).contains(&self.consensus.agreement_threshold) {
            errors.push("consensus.agreement_threshold must be within [0, 1]".to_string());
        }
        if self.consensus.stop_pct <= Decimal::ZERO {
            errors.push("consensus.stop_pct must be positive".to_string());
        }
        if self.consensus.target_pct <= Decimal::ZERO {
            errors.push("consensus.target_pct must be positive".to_string());
        }
        if self
            .consensus
            .regime_multipliers
            .values()
            .any(|m| *m <= 0.0)
        {
            errors.push("consensus.regime_multipliers must be positive".to_string());
        }

        match self.risk.active_limits() {
            Ok(limits) => {
                if let Err(mut limit_errors) = limits.validate() {
                    errors.append(&mut limit_errors);
                }
            }
            Err(e) => errors.push(e.to_string()),
        }
        if !(0.0..1.0).contains(&self.risk.warning_fraction) {
            errors.push("risk.warning_fraction must be within [0, 1)".to_string());
        }

        if self.sizing.position_size_pct <= Decimal::ZERO
            || self.sizing.position_size_pct > Decimal::ONE
        {
            errors.push("sizing.position_size_pct must be within (0, 1]".to_string());
        }
        if self.sizing.min_volatility_scale <= 0.0 || self.sizing.min_volatility_scale > 1.0 {
            errors.push("sizing.min_volatility_scale must be within (0, 1]".to_string());
        }

        if self.execution.max_attempts == 0 {
            errors.push("execution.max_attempts must be positive".to_string());
        }
        if self.execution.bracket_attempts == 0 {
            errors.push("execution.bracket_attempts must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            consensus: ConsensusConfig::default(),
            risk: RiskGovernorConfig::default(),
            sizing: SizingConfig::default(),
            execution: ExecutionConfig::default(),
            broker: BrokerConfig::default(),
            instruments: Vec::new(),
            logging: LoggingConfig::default(),
            health_port: default_health_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_prop_firm_profile_resolves_stricter_limits() {
        let mut config = AppConfig::default();
        config.risk.profile = "prop_firm".to_string();

        let default_limits = RiskLimits::default_profile();
        let limits = config.risk.active_limits().unwrap();
        assert!(limits.max_drawdown_pct < default_limits.max_drawdown_pct);
        assert!(limits.daily_loss_limit_pct < default_limits.daily_loss_limit_pct);
        assert!(limits.max_position_size_pct < default_limits.max_position_size_pct);
        assert!(limits.min_confidence > default_limits.min_confidence);
        assert!(limits.max_open_positions < default_limits.max_open_positions);
    }

    #[test]
    fn test_unknown_profile_rejected() {
        let mut config = AppConfig::default();
        config.risk.profile = "yolo".to_string();
        assert!(config.risk.active_limits().is_err());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = AppConfig::default();
        config.engine.symbols.clear();
        config.consensus.neutral_split_floor = 140.0;
        config.execution.max_attempts = 0;

        let errors = config.validate().unwrap_err();
        assert!(errors.len() >= 3);
    }

    #[test]
    fn test_instrument_catalog_fallback_from_symbols() {
        let config = AppConfig::default();
        let catalog = config.instrument_catalog();
        assert!(catalog.get("BTC/USD").is_some());
        assert!(catalog.get("BTC/USD").unwrap().fractional);
    }
}
