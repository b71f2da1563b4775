use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::RejectReason;

use super::opinion::Direction;

/// Terminal state of a decision as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", tag = "status", content = "detail")]
pub enum DecisionStatus {
    Executed,
    Rejected(RejectReason),
    Expired,
}

/// The consensus engine's merged, confidence-scored trading call for one
/// symbol at one point in time. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    /// Normalized confidence in [0, 100].
    pub confidence: f64,
    /// Number of sources whose opinions survived exclusion and voted.
    pub contributing_sources: usize,
    pub entry_price: Decimal,
    pub target_price: Decimal,
    pub stop_price: Decimal,
    pub generated_at: DateTime<Utc>,
    /// SHA-256 over the immutable fields, hex-encoded.
    pub integrity_hash: String,
}

impl Decision {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        direction: Direction,
        confidence: f64,
        contributing_sources: usize,
        entry_price: Decimal,
        target_price: Decimal,
        stop_price: Decimal,
    ) -> Self {
        let mut decision = Self {
            decision_id: Uuid::new_v4(),
            symbol: symbol.into(),
            direction,
            confidence: confidence.clamp(0.0, 100.0),
            contributing_sources,
            entry_price,
            target_price,
            stop_price,
            generated_at: Utc::now(),
            integrity_hash: String::new(),
        };
        decision.integrity_hash = decision.compute_hash();
        decision
    }

    /// Stable content hash over the immutable fields, in a fixed field order.
    /// Downstream consumers use it to detect tampering or duplication.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.decision_id.as_bytes());
        hasher.update(self.symbol.as_bytes());
        hasher.update(self.direction.to_string().as_bytes());
        hasher.update(format!("{:.4}", self.confidence).as_bytes());
        hasher.update(self.contributing_sources.to_le_bytes());
        hasher.update(self.entry_price.to_string().as_bytes());
        hasher.update(self.target_price.to_string().as_bytes());
        hasher.update(self.stop_price.to_string().as_bytes());
        hasher.update(self.generated_at.to_rfc3339().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Verify the stored hash still matches the content.
    pub fn verify_integrity(&self) -> bool {
        self.integrity_hash == self.compute_hash()
    }

    /// A decision from exactly one surviving source is held to the stricter
    /// single-source confidence minimum.
    pub fn is_single_source(&self) -> bool {
        self.contributing_sources <= 1
    }

    /// Whether the decision has outlived the staleness bound and must expire
    /// instead of executing.
    pub fn is_expired(&self, max_age_secs: u64, now: DateTime<Utc>) -> bool {
        now - self.generated_at > Duration::seconds(max_age_secs as i64)
    }
}
