//! Paper broker: fills market orders instantly against a random-walk price
//! tape. Backs simulation runs, tests, and nothing else; the degraded-fill
//! fallback in the execution engine synthesizes its own fills and does not
//! route through here.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{AccountSnapshot, OrderSide, Position, PositionSide};
use crate::error::ExecutionError;

use super::broker::{BrokerAck, BrokerClient, BrokerOrderRequest};

#[derive(Debug)]
struct PaperState {
    cash: Decimal,
    positions: HashMap<String, Position>,
    prices: HashMap<String, Decimal>,
}

/// Instant-fill simulated brokerage holding canonical-symbol positions.
pub struct PaperBroker {
    state: RwLock<PaperState>,
    /// venue symbol → canonical symbol, so fills map back to positions.
    venue_map: HashMap<String, String>,
}

impl PaperBroker {
    pub fn new(starting_equity: Decimal, symbols: &[String]) -> Self {
        let mut prices = HashMap::new();
        let mut venue_map = HashMap::new();
        for symbol in symbols {
            prices.insert(symbol.clone(), seed_price(symbol));
            venue_map.insert(symbol.replace('/', ""), symbol.clone());
        }
        Self {
            state: RwLock::new(PaperState {
                cash: starting_equity,
                positions: HashMap::new(),
                prices,
            }),
            venue_map,
        }
    }

    /// Override the tape for a symbol (test hook and replay feeds).
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.state
            .write()
            .await
            .prices
            .insert(symbol.to_string(), price);
    }

    fn canonical(&self, venue_symbol: &str) -> Result<String, ExecutionError> {
        self.venue_map
            .get(venue_symbol)
            .cloned()
            .ok_or_else(|| ExecutionError::UnknownInstrument(venue_symbol.to_string()))
    }

    fn equity(state: &PaperState) -> Decimal {
        let mut equity = state.cash;
        for position in state.positions.values() {
            let mark = state
                .prices
                .get(&position.symbol)
                .copied()
                .unwrap_or(position.entry_price);
            let value = mark * position.quantity;
            match position.side {
                PositionSide::Long => equity += value,
                // Short liability: entry credit is already in cash.
                PositionSide::Short => equity -= value,
            }
        }
        equity
    }
}

/// Deterministic-ish starting price so simulations look plausible per symbol.
fn seed_price(symbol: &str) -> Decimal {
    match symbol {
        s if s.starts_with("BTC") => dec!(50000),
        s if s.starts_with("ETH") => dec!(3000),
        s if s.starts_with("SOL") => dec!(150),
        _ => dec!(100),
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    fn name(&self) -> &str {
        "paper"
    }

    async fn get_account(&self) -> Result<AccountSnapshot, ExecutionError> {
        let state = self.state.read().await;
        Ok(AccountSnapshot {
            equity: Self::equity(&state),
            buying_power: state.cash.max(Decimal::ZERO),
            positions: state.positions.values().cloned().collect(),
            fetched_at: Utc::now(),
        })
    }

    async fn latest_price(&self, symbol: &str) -> Result<Decimal, ExecutionError> {
        let mut state = self.state.write().await;
        let current = state
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExecutionError::UnknownInstrument(symbol.to_string()))?;

        // Small random walk, ±0.2% per poll.
        let drift = rand::thread_rng().gen_range(-0.002..0.002);
        let next = current * Decimal::from_f64(1.0 + drift).unwrap_or(Decimal::ONE);
        let next = next.round_dp(2).max(dec!(0.01));
        state.prices.insert(symbol.to_string(), next);
        Ok(next)
    }

    async fn submit_order(
        &self,
        request: &BrokerOrderRequest,
    ) -> Result<BrokerAck, ExecutionError> {
        let symbol = self.canonical(&request.venue_symbol)?;

        // Only market orders fill immediately; limit/stop orders (the
        // protective brackets) rest on the simulated book.
        if request.order_type != crate::domain::OrderType::Market {
            return Ok(BrokerAck {
                broker_order_id: format!("paper-{}", Uuid::new_v4()),
                status: crate::domain::OrderStatus::Submitted,
                filled_quantity: Decimal::ZERO,
                avg_fill_price: None,
            });
        }

        let mut state = self.state.write().await;
        let price = state
            .prices
            .get(&symbol)
            .copied()
            .ok_or_else(|| ExecutionError::UnknownInstrument(symbol.clone()))?;
        let fill_price = request.limit_price.unwrap_or(price);
        let notional = fill_price * request.quantity;

        match request.side {
            OrderSide::Buy => {
                if let Some(position) = state.positions.get(&symbol).cloned() {
                    if position.side == PositionSide::Short {
                        // Buying back a short.
                        state.cash -= notional;
                        let remaining = position.quantity - request.quantity;
                        if remaining <= Decimal::ZERO {
                            state.positions.remove(&symbol);
                        } else {
                            state.positions.insert(
                                symbol.clone(),
                                Position {
                                    quantity: remaining,
                                    ..position
                                },
                            );
                        }
                    } else {
                        state.cash -= notional;
                        let total = position.quantity + request.quantity;
                        let blended = (position.entry_price * position.quantity
                            + fill_price * request.quantity)
                            / total;
                        state.positions.insert(
                            symbol.clone(),
                            Position {
                                quantity: total,
                                entry_price: blended,
                                ..position
                            },
                        );
                    }
                } else {
                    if notional > state.cash {
                        return Err(ExecutionError::Rejected(format!(
                            "insufficient cash: need {notional}, have {}",
                            state.cash
                        )));
                    }
                    state.cash -= notional;
                    state.positions.insert(
                        symbol.clone(),
                        Position {
                            symbol: symbol.clone(),
                            side: PositionSide::Long,
                            quantity: request.quantity,
                            entry_price: fill_price,
                        },
                    );
                }
            }
            OrderSide::Sell => {
                state.cash += notional;
                if let Some(position) = state.positions.get(&symbol).cloned() {
                    if position.side == PositionSide::Long {
                        let remaining = position.quantity - request.quantity;
                        if remaining <= Decimal::ZERO {
                            state.positions.remove(&symbol);
                        } else {
                            state.positions.insert(
                                symbol.clone(),
                                Position {
                                    quantity: remaining,
                                    ..position
                                },
                            );
                        }
                    } else {
                        let total = position.quantity + request.quantity;
                        let blended = (position.entry_price * position.quantity
                            + fill_price * request.quantity)
                            / total;
                        state.positions.insert(
                            symbol.clone(),
                            Position {
                                quantity: total,
                                entry_price: blended,
                                ..position
                            },
                        );
                    }
                } else {
                    // Fresh short.
                    state.positions.insert(
                        symbol.clone(),
                        Position {
                            symbol: symbol.clone(),
                            side: PositionSide::Short,
                            quantity: request.quantity,
                            entry_price: fill_price,
                        },
                    );
                }
            }
        }

        let ack = BrokerAck {
            broker_order_id: format!("paper-{}", Uuid::new_v4()),
            status: crate::domain::OrderStatus::Filled,
            filled_quantity: request.quantity,
            avg_fill_price: Some(fill_price),
        };
        debug!(symbol = %symbol, side = %request.side, quantity = %request.quantity, price = %fill_price, "paper fill");
        Ok(ack)
    }

    async fn cancel_order(&self, _broker_order_id: &str) -> Result<(), ExecutionError> {
        // Paper fills are instantaneous; there is never anything to cancel.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderType, TimeInForce};

    fn broker() -> PaperBroker {
        PaperBroker::new(dec!(100000), &["BTC/USD".to_string()])
    }

    fn buy(quantity: Decimal) -> BrokerOrderRequest {
        BrokerOrderRequest {
            venue_symbol: "BTCUSD".to_string(),
            side: OrderSide::Buy,
            quantity,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::GTC,
            limit_price: None,
            stop_price: None,
        }
    }

    #[tokio::test]
    async fn test_buy_then_sell_round_trip() {
        let broker = broker();
        broker.set_price("BTC/USD", dec!(50000)).await;

        let ack = broker.submit_order(&buy(dec!(0.5))).await.unwrap();
        assert_eq!(ack.status, crate::domain::OrderStatus::Filled);
        assert_eq!(ack.filled_quantity, dec!(0.5));

        let account = broker.get_account().await.unwrap();
        assert_eq!(account.positions.len(), 1);
        assert_eq!(account.positions[0].side, PositionSide::Long);

        let sell = BrokerOrderRequest {
            side: OrderSide::Sell,
            ..buy(dec!(0.5))
        };
        broker.submit_order(&sell).await.unwrap();
        let account = broker.get_account().await.unwrap();
        assert!(account.positions.is_empty());
        assert_eq!(account.equity, dec!(100000));
    }

    #[tokio::test]
    async fn test_unknown_venue_symbol_rejected() {
        let broker = broker();
        let mut request = buy(dec!(1));
        request.venue_symbol = "DOGEUSD".to_string();
        let err = broker.submit_order(&request).await.unwrap_err();
        assert!(matches!(err, ExecutionError::UnknownInstrument(_)));
    }

    #[tokio::test]
    async fn test_oversized_buy_rejected() {
        let broker = broker();
        broker.set_price("BTC/USD", dec!(50000)).await;
        let err = broker.submit_order(&buy(dec!(10))).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_price_walk_stays_positive() {
        let broker = broker();
        for _ in 0..50 {
            let price = broker.latest_price("BTC/USD").await.unwrap();
            assert!(price > Decimal::ZERO);
        }
    }
}
