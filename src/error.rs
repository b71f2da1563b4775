use thiserror::Error;

/// Main error type for the trading core
#[derive(Error, Debug)]
pub enum QuorumError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Consensus errors
    #[error("No opinion sources registered")]
    NoSourcesRegistered,

    // Broker/account errors
    #[error("Account unavailable: {0}")]
    AccountUnavailable(String),

    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),

    #[error("Price unavailable for {0}")]
    PriceUnavailable(String),

    // Order execution errors
    #[error("Order execution failed: {0}")]
    Execution(#[from] ExecutionError),

    // Risk management errors
    #[error("Trading halted: {0}")]
    TradingHalted(String),

    // Ledger errors
    #[error("Ledger conflict: {0}")]
    LedgerConflict(String),

    // Component supervision
    #[error("Component failure: {component} - {reason}")]
    ComponentFailure { component: String, reason: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for QuorumError
pub type Result<T> = std::result::Result<T, QuorumError>;

/// Errors produced by opinion sources. Never fatal to a cycle: a failing
/// source is simply excluded from that cycle's vote.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Source timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Transient fetch failure: {0}")]
    Transient(String),

    #[error("Authentication/permission failure: {0}")]
    Auth(String),

    #[error("Invalid opinion payload: {0}")]
    Invalid(String),

    #[error("Source disabled after repeated auth failures")]
    Disabled,
}

impl SourceError {
    /// Hard failures count toward the self-disable threshold.
    pub fn is_hard_auth(&self) -> bool {
        matches!(self, SourceError::Auth(_))
    }
}

/// Errors from the broker boundary, classified for retry decisions.
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Transient broker failure: {0}")]
    Transient(String),

    #[error("Connectivity lost: {0}")]
    ConnectivityLost(String),

    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Insufficient asset to trade: {0}")]
    InsufficientAsset(String),

    #[error("Order rejected by broker: {0}")]
    Rejected(String),

    #[error("Max retries exceeded after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32 },
}

impl ExecutionError {
    /// Whether another submission attempt can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutionError::RateLimited(_)
                | ExecutionError::Transient(_)
                | ExecutionError::ConnectivityLost(_)
        )
    }

    /// Rate-limit class failures back off longer than generic transients.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ExecutionError::RateLimited(_))
    }

    /// Failures that warrant degrading to a simulated fill rather than
    /// abandoning the decision entirely.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            ExecutionError::ConnectivityLost(_) | ExecutionError::Transient(_)
        )
    }
}

/// Machine-readable reasons a decision is rejected before execution.
///
/// These are recorded in the ledger verbatim so a rejected decision is always
/// debuggable after the fact.
#[derive(Error, Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum RejectReason {
    #[error("Confidence {confidence:.1} below minimum {minimum:.1} for {sources} source(s)")]
    InsufficientConfidence {
        confidence: f64,
        minimum: f64,
        sources: usize,
    },

    #[error("Risk halted: {0}")]
    RiskHalted(String),

    #[error("Open position already exists for {symbol} {side}")]
    DuplicatePosition { symbol: String, side: String },

    #[error("Insufficient buying power: need {required}, have {available}")]
    InsufficientBuyingPower { required: String, available: String },

    #[error("Instrument not permitted by active limit profile: {0}")]
    InstrumentNotPermitted(String),

    #[error("Open position count {current} at profile cap {limit}")]
    TooManyOpenPositions { current: u32, limit: u32 },

    #[error("Quantity rounded to zero at {price}")]
    QuantityRoundedToZero { price: String },

    #[error("Decision older than {max_age_secs}s")]
    StaleDecision { max_age_secs: u64 },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_classification() {
        assert!(ExecutionError::RateLimited("429".into()).is_retryable());
        assert!(ExecutionError::RateLimited("429".into()).is_rate_limited());
        assert!(ExecutionError::Transient("502".into()).is_retryable());
        assert!(!ExecutionError::Transient("502".into()).is_rate_limited());
        assert!(!ExecutionError::UnknownInstrument("XYZ".into()).is_retryable());
        assert!(!ExecutionError::PermissionDenied("403".into()).is_retryable());
        assert!(ExecutionError::ConnectivityLost("refused".into()).is_degradable());
        assert!(!ExecutionError::PermissionDenied("403".into()).is_degradable());
    }

    #[test]
    fn test_source_error_auth_detection() {
        assert!(SourceError::Auth("401".into()).is_hard_auth());
        assert!(!SourceError::Timeout { timeout_ms: 2000 }.is_hard_auth());
        assert!(!SourceError::Transient("flaky".into()).is_hard_auth());
    }

    #[test]
    fn test_reject_reason_serializes_machine_readable() {
        let reason = RejectReason::RiskHalted("drawdown limit".into());
        let json = serde_json::to_string(&reason).unwrap();
        assert!(json.contains("risk_halted"));

        let reason = RejectReason::InsufficientConfidence {
            confidence: 61.0,
            minimum: 75.0,
            sources: 1,
        };
        assert!(reason.to_string().contains("below minimum"));
    }
}
