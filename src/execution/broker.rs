//! Broker boundary: the trait the execution engine drives, plus the wire
//! shapes shared by its implementations.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{AccountSnapshot, OrderSide, OrderStatus, OrderType, TimeInForce};
use crate::error::ExecutionError;

/// Order instructions in broker terms. The symbol here is already in venue
/// form; normalization happens immediately before submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrderRequest {
    pub venue_symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
}

/// Broker acknowledgement of a submitted order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerAck {
    pub broker_order_id: String,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
}

/// Brokerage capability interface consumed by the execution engine.
///
/// Implementations apply their own venue symbol formats and time-in-force
/// rules; callers pass canonical symbols only to the account/price queries.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    fn name(&self) -> &str;

    async fn get_account(&self) -> Result<AccountSnapshot, ExecutionError>;

    /// Latest trade/quote price for a canonical symbol.
    async fn latest_price(&self, symbol: &str) -> Result<Decimal, ExecutionError>;

    async fn submit_order(&self, request: &BrokerOrderRequest)
        -> Result<BrokerAck, ExecutionError>;

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), ExecutionError>;
}
