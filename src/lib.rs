pub mod config;
pub mod consensus;
pub mod domain;
pub mod engine;
pub mod error;
pub mod execution;
pub mod ledger;
pub mod risk;
pub mod services;
pub mod sizing;
pub mod sources;

pub use config::AppConfig;
pub use consensus::{ConsensusEngine, MarketRegime};
pub use domain::{Decision, DecisionStatus, Direction, Opinion, Order, OrderStatus};
pub use engine::{CycleSupervisor, Heartbeat, TradingEngine};
pub use error::{ExecutionError, QuorumError, RejectReason, Result, SourceError};
pub use execution::{BrokerClient, ExecutionEngine, PaperBroker, RestBroker};
pub use ledger::DecisionLedger;
pub use risk::{RiskGovernor, RiskLevel, RiskLimits, RiskSnapshot};
pub use services::{HealthServer, HealthState};
pub use sizing::{PositionSizer, SizedOrder};
pub use sources::{OpinionSource, SourceRegistry};
