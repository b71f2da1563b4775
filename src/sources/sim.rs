//! Simulated opinion source for paper trading and local runs.
//!
//! Emits noisy directional opinions with a configurable bias so the whole
//! pipeline flows without live provider credentials. Real provider adapters
//! implement [`OpinionSource`](super::OpinionSource) outside this crate and
//! are registered in their place.

use async_trait::async_trait;
use rand::Rng;

use crate::domain::{Direction, Opinion};
use crate::error::SourceError;

use super::OpinionSource;

pub struct SimulatedSource {
    id: String,
    weight: f64,
    /// Probability mass tilted toward LONG, in [0, 1]. 0.5 is unbiased.
    long_bias: f64,
}

impl SimulatedSource {
    pub fn new(id: impl Into<String>, weight: f64, long_bias: f64) -> Self {
        Self {
            id: id.into(),
            weight,
            long_bias: long_bias.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl OpinionSource for SimulatedSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn base_weight(&self) -> f64 {
        self.weight
    }

    async fn fetch(&self, symbol: &str) -> Result<Opinion, SourceError> {
        let (direction, confidence) = {
            let mut rng = rand::thread_rng();
            let roll: f64 = rng.gen();
            let direction = if roll < 0.2 {
                Direction::Neutral
            } else if roll < 0.2 + 0.8 * self.long_bias {
                Direction::Long
            } else {
                Direction::Short
            };
            (direction, rng.gen_range(40.0..95.0))
        };
        Ok(Opinion::new(self.id.clone(), symbol, direction, confidence))
    }
}
