use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Directional stance of an opinion or decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl Direction {
    pub fn is_directional(&self) -> bool {
        !matches!(self, Direction::Neutral)
    }

    /// Signed contribution to the weighted direction score.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::Neutral => 0.0,
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
            Direction::Neutral => Direction::Neutral,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
            Direction::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// One data source's raw directional signal for a symbol.
///
/// Ephemeral: produced by a source adapter, owned by the consensus engine for
/// the duration of a single aggregation call, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opinion {
    pub source_id: String,
    pub symbol: String,
    pub direction: Direction,
    /// Confidence score in [0, 100].
    pub confidence: f64,
    pub observed_at: DateTime<Utc>,
    /// How old the underlying data was when the source produced this opinion.
    pub staleness_secs: u64,
}

impl Opinion {
    pub fn new(
        source_id: impl Into<String>,
        symbol: impl Into<String>,
        direction: Direction,
        confidence: f64,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            symbol: symbol.into(),
            direction,
            confidence: confidence.clamp(0.0, 100.0),
            observed_at: Utc::now(),
            staleness_secs: 0,
        }
    }

    /// Whether the observation is older than the given bound.
    pub fn is_stale(&self, max_age_secs: u64, now: DateTime<Utc>) -> bool {
        now - self.observed_at > Duration::seconds(max_age_secs as i64)
    }
}
