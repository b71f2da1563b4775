pub mod engine;
pub mod regime;

pub use engine::ConsensusEngine;
pub use regime::{MarketRegime, RegimeWeights};
