use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::opinion::Direction;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Side of a held position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn opposite(&self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// Order side that opens a position on this side.
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes a position on this side.
    pub fn exit_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

impl TryFrom<Direction> for PositionSide {
    type Error = &'static str;

    fn try_from(direction: Direction) -> std::result::Result<Self, Self::Error> {
        match direction {
            Direction::Long => Ok(PositionSide::Long),
            Direction::Short => Ok(PositionSide::Short),
            Direction::Neutral => Err("neutral direction has no position side"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good Till Cancelled, required by some instrument classes (crypto)
    GTC,
    /// Valid for the trading day
    Day,
    /// Immediate Or Cancel
    IOC,
}

/// Order status state machine:
/// `Pending → Submitted → {Filled, PartiallyFilled, Rejected, Cancelled, Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Rejected,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Rejected
                | OrderStatus::Cancelled
                | OrderStatus::Failed
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Submitted | OrderStatus::PartiallyFilled
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "PENDING"),
            OrderStatus::Submitted => write!(f, "SUBMITTED"),
            OrderStatus::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            OrderStatus::Filled => write!(f, "FILLED"),
            OrderStatus::Rejected => write!(f, "REJECTED"),
            OrderStatus::Cancelled => write!(f, "CANCELLED"),
            OrderStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Kind of protective order dependent on a filled primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BracketKind {
    StopLoss,
    TakeProfit,
}

impl std::fmt::Display for BracketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BracketKind::StopLoss => write!(f, "stop_loss"),
            BracketKind::TakeProfit => write!(f, "take_profit"),
        }
    }
}

/// One attempted market interaction, owned by the execution engine until
/// terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: Uuid,
    pub decision_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub limit_price: Option<Decimal>,
    pub status: OrderStatus,
    pub broker_order_id: Option<String>,
    pub avg_fill_price: Option<Decimal>,
    pub filled_quantity: Decimal,
    pub attempt_count: u32,
    /// Which protective order this is, if any. `None` for the primary.
    pub bracket: Option<BracketKind>,
    /// True when the fill was simulated because the live path was
    /// unavailable. A degraded order is bookkeeping, not a live execution.
    pub degraded: bool,
    /// True when this order closes an existing position.
    pub closes_position: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        decision_id: Uuid,
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        order_type: OrderType,
        time_in_force: TimeInForce,
    ) -> Self {
        let now = Utc::now();
        Self {
            order_id: Uuid::new_v4(),
            decision_id,
            symbol: symbol.into(),
            side,
            quantity,
            order_type,
            time_in_force,
            limit_price: None,
            status: OrderStatus::Pending,
            broker_order_id: None,
            avg_fill_price: None,
            filled_quantity: Decimal::ZERO,
            attempt_count: 0,
            bracket: None,
            degraded: false,
            closes_position: false,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_limit_price(mut self, price: Decimal) -> Self {
        self.limit_price = Some(price);
        self
    }

    pub fn as_bracket(mut self, kind: BracketKind) -> Self {
        self.bracket = Some(kind);
        self
    }

    pub fn as_close(mut self) -> Self {
        self.closes_position = true;
        self
    }

    /// Notional value at the limit price, if one is set.
    pub fn notional(&self) -> Option<Decimal> {
        self.limit_price.map(|p| p * self.quantity)
    }

    /// Stable content hash over identity and outcome fields, emitted to the
    /// audit sink alongside the record.
    pub fn integrity_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.order_id.as_bytes());
        hasher.update(self.decision_id.as_bytes());
        hasher.update(self.symbol.as_bytes());
        hasher.update(self.side.to_string().as_bytes());
        hasher.update(self.quantity.to_string().as_bytes());
        hasher.update(self.status.to_string().as_bytes());
        hasher.update(
            self.broker_order_id
                .as_deref()
                .unwrap_or_default()
                .as_bytes(),
        );
        hasher.update([self.degraded as u8]);
        hex::encode(hasher.finalize())
    }

    pub fn transition(&mut self, status: OrderStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Current holding per symbol, derived from the broker and cached with a
/// short TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
}

/// Account snapshot from the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity: Decimal,
    pub buying_power: Decimal,
    pub positions: Vec<Position>,
    pub fetched_at: DateTime<Utc>,
}

impl AccountSnapshot {
    pub fn position_for(&self, symbol: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_terminality() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(!OrderStatus::Submitted.is_terminal());
        assert!(OrderStatus::PartiallyFilled.is_active());
        assert!(!OrderStatus::Cancelled.is_active());
    }

    #[test]
    fn test_position_side_order_mapping() {
        assert_eq!(PositionSide::Long.entry_order_side(), OrderSide::Buy);
        assert_eq!(PositionSide::Long.exit_order_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.entry_order_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.exit_order_side(), OrderSide::Buy);
        assert!(PositionSide::try_from(Direction::Neutral).is_err());
    }

    #[test]
    fn test_order_integrity_hash_changes_with_outcome() {
        let mut order = Order::new(
            Uuid::new_v4(),
            "BTC/USD",
            OrderSide::Buy,
            dec!(0.5),
            OrderType::Market,
            TimeInForce::GTC,
        );
        let before = order.integrity_hash();
        order.transition(OrderStatus::Filled);
        assert_ne!(before, order.integrity_hash());
    }

    #[test]
    fn test_builder_helpers() {
        let order = Order::new(
            Uuid::new_v4(),
            "ETH/USD",
            OrderSide::Sell,
            dec!(2),
            OrderType::Limit,
            TimeInForce::GTC,
        )
        .with_limit_price(dec!(3000))
        .as_bracket(BracketKind::TakeProfit);

        assert_eq!(order.notional(), Some(dec!(6000)));
        assert_eq!(order.bracket, Some(BracketKind::TakeProfit));
        assert!(!order.closes_position);
    }
}
