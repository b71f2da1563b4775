//! Execution engine: turns a sized decision into broker orders.
//!
//! Staged submission: the primary order retries with exponential backoff
//! (rate-limit failures back off longer, non-retryable failures fail fast),
//! then the protective stop-loss and take-profit brackets each get their own
//! short retry budget. A bracket failure never cancels or reverses a filled
//! primary; a naked position with a logged warning beats silently discarding
//! a filled trade. When the live path is unavailable the engine degrades to a
//! simulated fill that is explicitly flagged on the order record.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::domain::{BracketKind, Decision, Instrument, Order, OrderStatus, OrderType};
use crate::error::ExecutionError;
use crate::sizing::SizedOrder;

use super::broker::{BrokerAck, BrokerClient, BrokerOrderRequest};

/// Outcome of one decision's execution attempt, recorded in the ledger.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub primary: Order,
    pub brackets: Vec<Order>,
    /// Protective orders that exhausted their retry budget, with the final
    /// error. Surfaced, never rolled back into the primary.
    pub bracket_failures: Vec<(BracketKind, String)>,
}

impl ExecutionReport {
    pub fn is_filled(&self) -> bool {
        self.primary.status == OrderStatus::Filled
    }
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    filled: AtomicU64,
    failed: AtomicU64,
    degraded: AtomicU64,
    bracket_failures: AtomicU64,
    retries: AtomicU64,
}

/// Counter snapshot for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionMetricsSnapshot {
    pub submitted: u64,
    pub filled: u64,
    pub failed: u64,
    pub degraded: u64,
    pub bracket_failures: u64,
    pub retries: u64,
}

pub struct ExecutionEngine {
    broker: Arc<dyn BrokerClient>,
    config: ExecutionConfig,
    counters: Counters,
}

impl ExecutionEngine {
    pub fn new(broker: Arc<dyn BrokerClient>, config: ExecutionConfig) -> Self {
        Self {
            broker,
            config,
            counters: Counters::default(),
        }
    }

    pub fn metrics(&self) -> ExecutionMetricsSnapshot {
        ExecutionMetricsSnapshot {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            filled: self.counters.filled.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            degraded: self.counters.degraded.load(Ordering::Relaxed),
            bracket_failures: self.counters.bracket_failures.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
        }
    }

    /// Execute a sized decision: primary order, then protective brackets on
    /// a live fill. Closes use the existing position quantity and carry no
    /// brackets of their own.
    pub async fn execute(
        &self,
        decision: &Decision,
        sized: &SizedOrder,
        instrument: &Instrument,
    ) -> ExecutionReport {
        let side = if sized.closes_position {
            sized.side.exit_order_side()
        } else {
            sized.side.entry_order_side()
        };
        let time_in_force = instrument.class.time_in_force();

        let mut primary = Order::new(
            decision.decision_id,
            decision.symbol.clone(),
            side,
            sized.quantity,
            OrderType::Market,
            time_in_force,
        );
        if sized.closes_position {
            primary = primary.as_close();
        }

        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.submit_primary(&mut primary, instrument).await;

        // A simulated fill has no broker price; book it at the decision's
        // reference entry so the record stays complete.
        if primary.degraded && primary.avg_fill_price.is_none() {
            primary.avg_fill_price = Some(decision.entry_price);
        }

        let mut report = ExecutionReport {
            primary,
            brackets: Vec::new(),
            bracket_failures: Vec::new(),
        };

        if report.primary.status == OrderStatus::Filled {
            self.counters.filled.fetch_add(1, Ordering::Relaxed);
            if !report.primary.closes_position {
                self.submit_brackets(decision, instrument, &mut report).await;
            }
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }

        report
    }

    /// Primary submission with bounded, classified retries.
    async fn submit_primary(&self, order: &mut Order, instrument: &Instrument) {
        let request = BrokerOrderRequest {
            // Normalization to the venue form happens here, immediately
            // before submission; the order record keeps the canonical form.
            venue_symbol: instrument.venue_symbol(),
            side: order.side,
            quantity: order.quantity,
            order_type: order.order_type,
            time_in_force: order.time_in_force,
            limit_price: order.limit_price,
            stop_price: None,
        };

        let mut last_error: Option<ExecutionError> = None;
        for attempt in 1..=self.config.max_attempts {
            order.attempt_count = attempt;
            order.transition(OrderStatus::Submitted);

            match self.broker.submit_order(&request).await {
                Ok(ack) => {
                    self.apply_ack(order, &ack);
                    info!(
                        order_id = %order.order_id,
                        symbol = %order.symbol,
                        side = %order.side,
                        status = %order.status,
                        attempts = attempt,
                        broker = self.broker.name(),
                        "primary order acknowledged"
                    );
                    return;
                }
                Err(e) => {
                    if !e.is_retryable() {
                        // Unknown instrument, permission denied and friends
                        // fail immediately without retry.
                        error!(order_id = %order.order_id, error = %e, "non-retryable submission failure");
                        order.error = Some(e.to_string());
                        order.transition(OrderStatus::Failed);
                        return;
                    }
                    if attempt < self.config.max_attempts {
                        let delay = self.backoff_delay(attempt, e.is_rate_limited());
                        warn!(
                            order_id = %order.order_id,
                            attempt,
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "submission attempt failed, retrying"
                        );
                        self.counters.retries.fetch_add(1, Ordering::Relaxed);
                        sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let final_error = last_error.unwrap_or(ExecutionError::MaxRetriesExceeded {
            attempts: self.config.max_attempts,
        });

        // Retries exhausted. If the failure class points at an unavailable
        // live path, degrade to a simulated fill so downstream bookkeeping
        // is never blocked by broker unavailability.
        if self.config.allow_degraded_fills && final_error.is_degradable() {
            self.simulate_fill(order);
            warn!(
                order_id = %order.order_id,
                error = %final_error,
                "live path unavailable, degraded to simulated fill"
            );
            return;
        }

        order.error = Some(final_error.to_string());
        order.transition(OrderStatus::Failed);
        error!(
            order_id = %order.order_id,
            attempts = self.config.max_attempts,
            error = %final_error,
            "primary order abandoned"
        );
    }

    /// Protective orders after a live primary fill: each bracket retried on
    /// its own short budget with a fixed delay, independently of the other.
    async fn submit_brackets(
        &self,
        decision: &Decision,
        instrument: &Instrument,
        report: &mut ExecutionReport,
    ) {
        let exit_side = match crate::domain::PositionSide::try_from(decision.direction) {
            Ok(side) => side.exit_order_side(),
            Err(_) => return,
        };

        let specs = [
            (BracketKind::StopLoss, OrderType::Stop, decision.stop_price),
            (
                BracketKind::TakeProfit,
                OrderType::Limit,
                decision.target_price,
            ),
        ];

        for (kind, order_type, price) in specs {
            let mut bracket = Order::new(
                decision.decision_id,
                decision.symbol.clone(),
                exit_side,
                report.primary.quantity,
                order_type,
                report.primary.time_in_force,
            )
            .with_limit_price(price)
            .as_bracket(kind);

            if report.primary.degraded {
                // The live path already proved unavailable; keep the
                // bookkeeping consistent instead of issuing doomed calls.
                self.simulate_bracket_ack(&mut bracket);
                report.brackets.push(bracket);
                continue;
            }

            match self.submit_bracket(&mut bracket, instrument, kind).await {
                Ok(()) => report.brackets.push(bracket),
                Err(e) => {
                    // The primary stays FILLED: surfaced, not rolled back.
                    self.counters.bracket_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        decision_id = %decision.decision_id,
                        bracket = %kind,
                        error = %e,
                        "protective order failed; primary fill left in place"
                    );
                    bracket.error = Some(e.to_string());
                    bracket.transition(OrderStatus::Failed);
                    report.brackets.push(bracket);
                    report.bracket_failures.push((kind, e.to_string()));
                }
            }
        }
    }

    async fn submit_bracket(
        &self,
        order: &mut Order,
        instrument: &Instrument,
        kind: BracketKind,
    ) -> Result<(), ExecutionError> {
        let request = BrokerOrderRequest {
            venue_symbol: instrument.venue_symbol(),
            side: order.side,
            quantity: order.quantity,
            order_type: order.order_type,
            time_in_force: order.time_in_force,
            limit_price: order.limit_price,
            stop_price: (kind == BracketKind::StopLoss)
                .then_some(order.limit_price)
                .flatten(),
        };

        let mut last_error = ExecutionError::MaxRetriesExceeded {
            attempts: self.config.bracket_attempts,
        };
        for attempt in 1..=self.config.bracket_attempts {
            order.attempt_count = attempt;
            order.transition(OrderStatus::Submitted);
            match self.broker.submit_order(&request).await {
                Ok(ack) => {
                    self.apply_ack(order, &ack);
                    debug!(bracket = %kind, order_id = %order.order_id, "protective order placed");
                    return Ok(());
                }
                Err(e) => {
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    if attempt < self.config.bracket_attempts {
                        sleep(Duration::from_millis(self.config.bracket_retry_delay_ms)).await;
                    }
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    fn apply_ack(&self, order: &mut Order, ack: &BrokerAck) {
        order.broker_order_id = Some(ack.broker_order_id.clone());
        order.filled_quantity = ack.filled_quantity;
        order.avg_fill_price = ack.avg_fill_price;
        order.transition(ack.status);
    }

    /// Simulated fill for the degraded path: valid order record, synthetic
    /// identifier, explicit flag.
    fn simulate_fill(&self, order: &mut Order) {
        self.counters.degraded.fetch_add(1, Ordering::Relaxed);
        order.degraded = true;
        order.broker_order_id = Some(format!("sim-{}", Uuid::new_v4()));
        order.filled_quantity = order.quantity;
        if order.avg_fill_price.is_none() {
            order.avg_fill_price = order.limit_price;
        }
        order.transition(OrderStatus::Filled);
    }

    fn simulate_bracket_ack(&self, order: &mut Order) {
        order.degraded = true;
        order.broker_order_id = Some(format!("sim-{}", Uuid::new_v4()));
        order.transition(OrderStatus::Submitted);
    }

    /// Exponential backoff with jitter; rate-limit failures multiply the
    /// delay so we stop hammering a throttling venue.
    fn backoff_delay(&self, attempt: u32, rate_limited: bool) -> Duration {
        let exp = self
            .config
            .base_backoff_ms
            .saturating_mul(1_u64 << attempt.min(16));
        let mut delay = exp.min(self.config.max_backoff_ms);
        if rate_limited {
            delay = delay
                .saturating_mul(self.config.rate_limit_multiplier as u64)
                .min(self.config.max_backoff_ms * self.config.rate_limit_multiplier as u64);
        }
        let jitter = rand::thread_rng().gen_range(0..=delay / 4 + 1);
        Duration::from_millis(delay + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountSnapshot, Direction, OrderSide, PositionSide};
    use crate::error::ExecutionError;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    /// Scripted broker: pops one reply per submission, in order.
    struct ScriptedBroker {
        replies: Mutex<Vec<Result<BrokerAck, ExecutionError>>>,
        calls: AtomicU32,
    }

    impl ScriptedBroker {
        fn new(mut replies: Vec<Result<BrokerAck, ExecutionError>>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                calls: AtomicU32::new(0),
            }
        }

        fn filled_ack() -> BrokerAck {
            BrokerAck {
                broker_order_id: format!("live-{}", Uuid::new_v4()),
                status: OrderStatus::Filled,
                filled_quantity: dec!(0.5),
                avg_fill_price: Some(dec!(50000)),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BrokerClient for ScriptedBroker {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn get_account(&self) -> Result<AccountSnapshot, ExecutionError> {
            unreachable!("not used in execution tests")
        }

        async fn latest_price(&self, _symbol: &str) -> Result<Decimal, ExecutionError> {
            Ok(dec!(50000))
        }

        async fn submit_order(
            &self,
            _request: &BrokerOrderRequest,
        ) -> Result<BrokerAck, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(Self::filled_ack()))
        }

        async fn cancel_order(&self, _broker_order_id: &str) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    fn fast_config() -> ExecutionConfig {
        ExecutionConfig {
            base_backoff_ms: 1,
            max_backoff_ms: 2,
            bracket_retry_delay_ms: 1,
            ..ExecutionConfig::default()
        }
    }

    fn decision() -> Decision {
        Decision::new(
            "BTC/USD",
            Direction::Long,
            85.0,
            3,
            dec!(50000),
            dec!(51500),
            dec!(49000),
        )
    }

    fn entry() -> SizedOrder {
        SizedOrder {
            quantity: dec!(0.5),
            side: PositionSide::Long,
            closes_position: false,
        }
    }

    #[tokio::test]
    async fn test_fill_spawns_both_brackets() {
        let broker = Arc::new(ScriptedBroker::new(vec![]));
        let engine = ExecutionEngine::new(broker.clone(), fast_config());

        let report = engine
            .execute(&decision(), &entry(), &Instrument::crypto("BTC/USD"))
            .await;

        assert!(report.is_filled());
        assert!(!report.primary.degraded);
        assert_eq!(report.brackets.len(), 2);
        assert!(report.bracket_failures.is_empty());
        // Brackets exit the position: long entry → sell brackets.
        assert!(report.brackets.iter().all(|b| b.side == OrderSide::Sell));
        assert_eq!(broker.calls(), 3);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_fills() {
        let broker = Arc::new(ScriptedBroker::new(vec![
            Err(ExecutionError::Transient("502".into())),
            Ok(ScriptedBroker::filled_ack()),
        ]));
        let engine = ExecutionEngine::new(broker.clone(), fast_config());

        let report = engine
            .execute(&decision(), &entry(), &Instrument::crypto("BTC/USD"))
            .await;

        assert!(report.is_filled());
        assert_eq!(report.primary.attempt_count, 2);
        assert_eq!(engine.metrics().retries, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let broker = Arc::new(ScriptedBroker::new(vec![Err(
            ExecutionError::UnknownInstrument("XYZ".into()),
        )]));
        let engine = ExecutionEngine::new(broker.clone(), fast_config());

        let report = engine
            .execute(&decision(), &entry(), &Instrument::crypto("BTC/USD"))
            .await;

        assert_eq!(report.primary.status, OrderStatus::Failed);
        assert!(!report.primary.degraded);
        // One call: no retry, no brackets.
        assert_eq!(broker.calls(), 1);
        assert!(report.brackets.is_empty());
    }

    #[tokio::test]
    async fn test_connectivity_exhaustion_degrades_to_simulated_fill() {
        let broker = Arc::new(ScriptedBroker::new(vec![
            Err(ExecutionError::ConnectivityLost("refused".into())),
            Err(ExecutionError::ConnectivityLost("refused".into())),
            Err(ExecutionError::ConnectivityLost("refused".into())),
        ]));
        let engine = ExecutionEngine::new(broker.clone(), fast_config());

        let report = engine
            .execute(&decision(), &entry(), &Instrument::crypto("BTC/USD"))
            .await;

        // Degraded fill: flagged, synthetic id, still a complete record.
        assert!(report.is_filled());
        assert!(report.primary.degraded);
        let broker_id = report.primary.broker_order_id.clone().unwrap();
        assert!(broker_id.starts_with("sim-"));
        assert_eq!(engine.metrics().degraded, 1);
        // Brackets are simulated too, never submitted live.
        assert_eq!(broker.calls(), 3);
        assert_eq!(report.brackets.len(), 2);
        assert!(report.brackets.iter().all(|b| b.degraded));
    }

    #[tokio::test]
    async fn test_bracket_failure_leaves_primary_filled() {
        let broker = Arc::new(ScriptedBroker::new(vec![
            Ok(ScriptedBroker::filled_ack()),
            // Stop-loss fails through its whole budget.
            Err(ExecutionError::Transient("oops".into())),
            Err(ExecutionError::Transient("oops".into())),
            // Take-profit succeeds.
            Ok(ScriptedBroker::filled_ack()),
        ]));
        let engine = ExecutionEngine::new(broker.clone(), fast_config());

        let report = engine
            .execute(&decision(), &entry(), &Instrument::crypto("BTC/USD"))
            .await;

        assert_eq!(report.primary.status, OrderStatus::Filled);
        assert!(!report.primary.degraded);
        assert_eq!(report.bracket_failures.len(), 1);
        assert_eq!(report.bracket_failures[0].0, BracketKind::StopLoss);
        // Both brackets recorded; one failed, one live.
        assert_eq!(report.brackets.len(), 2);
        assert_eq!(engine.metrics().bracket_failures, 1);
    }

    #[tokio::test]
    async fn test_close_omits_brackets_and_uses_existing_quantity() {
        let broker = Arc::new(ScriptedBroker::new(vec![]));
        let engine = ExecutionEngine::new(broker.clone(), fast_config());

        let close = SizedOrder {
            quantity: dec!(0.4),
            side: PositionSide::Long,
            closes_position: true,
        };
        let report = engine
            .execute(&decision(), &close, &Instrument::crypto("BTC/USD"))
            .await;

        assert!(report.is_filled());
        assert!(report.primary.closes_position);
        assert_eq!(report.primary.quantity, dec!(0.4));
        // A close sells out of the long and carries no protective orders.
        assert_eq!(report.primary.side, OrderSide::Sell);
        assert!(report.brackets.is_empty());
        assert_eq!(broker.calls(), 1);
    }

    #[tokio::test]
    async fn test_degraded_fills_disabled_fails_instead() {
        let broker = Arc::new(ScriptedBroker::new(vec![
            Err(ExecutionError::ConnectivityLost("refused".into())),
            Err(ExecutionError::ConnectivityLost("refused".into())),
            Err(ExecutionError::ConnectivityLost("refused".into())),
        ]));
        let mut config = fast_config();
        config.allow_degraded_fills = false;
        let engine = ExecutionEngine::new(broker.clone(), config);

        let report = engine
            .execute(&decision(), &entry(), &Instrument::crypto("BTC/USD"))
            .await;

        assert_eq!(report.primary.status, OrderStatus::Failed);
        assert!(!report.primary.degraded);
    }
}
