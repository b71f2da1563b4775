pub mod governor;
pub mod limits;

pub use governor::{RiskGovernor, RiskLevel, RiskSnapshot};
pub use limits::RiskLimits;
