pub mod broker;
pub mod engine;
pub mod paper;
pub mod rest;

pub use broker::{BrokerAck, BrokerClient, BrokerOrderRequest};
pub use engine::{ExecutionEngine, ExecutionMetricsSnapshot, ExecutionReport};
pub use paper::PaperBroker;
pub use rest::RestBroker;
