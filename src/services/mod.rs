pub mod health;

pub use health::{HealthServer, HealthState};
