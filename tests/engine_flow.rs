//! End-to-end engine flow against the paper broker: consensus through
//! execution and the ledger, with the risk gate in the loop.

use std::sync::Arc;

use async_trait::async_trait;
use quorum::config::{AppConfig, EngineConfig};
use quorum::consensus::ConsensusEngine;
use quorum::domain::{DecisionStatus, Direction, Opinion, OrderSide, PositionSide};
use quorum::engine::{Heartbeat, TradingEngine};
use quorum::error::{RejectReason, SourceError};
use quorum::execution::{ExecutionEngine, PaperBroker};
use quorum::ledger::DecisionLedger;
use quorum::risk::RiskGovernor;
use quorum::sizing::PositionSizer;
use quorum::sources::{OpinionSource, SourceRegistry};
use rust_decimal_macros::dec;
use tokio::sync::watch;

/// Always-bullish source with fixed confidence.
struct BullSource {
    id: String,
    confidence: f64,
}

#[async_trait]
impl OpinionSource for BullSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, symbol: &str) -> Result<Opinion, SourceError> {
        Ok(Opinion::new(
            self.id.clone(),
            symbol,
            Direction::Long,
            self.confidence,
        ))
    }
}

struct Harness {
    engine: Arc<TradingEngine>,
    governor: Arc<RiskGovernor>,
    ledger: Arc<DecisionLedger>,
}

fn build_harness(symbols: Vec<String>) -> Harness {
    let mut config = AppConfig::default();
    config.engine = EngineConfig {
        symbols: symbols.clone(),
        cycle_interval_secs: 1,
        ..EngineConfig::default()
    };

    let limits = config.risk.active_limits().unwrap();
    let catalog = Arc::new(config.instrument_catalog());
    let broker = Arc::new(PaperBroker::new(dec!(100000), &symbols));

    let sources: Vec<Arc<dyn OpinionSource>> = vec![
        Arc::new(BullSource {
            id: "bull-a".into(),
            confidence: 82.0,
        }),
        Arc::new(BullSource {
            id: "bull-b".into(),
            confidence: 74.0,
        }),
    ];
    let registry = Arc::new(SourceRegistry::new(
        sources,
        config.consensus.max_source_auth_failures,
    ));

    let consensus = Arc::new(ConsensusEngine::new(
        registry,
        config.consensus.clone(),
        limits.max_stop_loss_pct,
    ));
    let sizer = Arc::new(PositionSizer::new(
        config.sizing.clone(),
        limits.clone(),
        config.consensus.decision_max_age_secs,
    ));
    let execution = Arc::new(ExecutionEngine::new(
        broker.clone(),
        config.execution.clone(),
    ));
    let governor = Arc::new(RiskGovernor::new(
        limits,
        config.risk.clone(),
        dec!(100000),
    ));
    let ledger = Arc::new(DecisionLedger::new(1000));

    let engine = Arc::new(TradingEngine::new(
        config.engine.clone(),
        consensus,
        governor.clone(),
        sizer,
        execution,
        ledger.clone(),
        broker,
        catalog,
        Heartbeat::new(),
    ));

    Harness {
        engine,
        governor,
        ledger,
    }
}

async fn run_cycles(harness: &Harness, millis: u64) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = harness.engine.clone();
    let task = tokio::spawn(engine.run(shutdown_rx));
    tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
    let _ = shutdown_tx.send(true);
    let _ = task.await;
}

#[tokio::test]
async fn test_full_pipeline_produces_executed_decision() {
    let harness = build_harness(vec!["BTC/USD".to_string()]);
    run_cycles(&harness, 500).await;

    let decisions = harness.ledger.query_decisions(None, None, None).await;
    assert!(!decisions.is_empty(), "no decisions recorded");

    let executed: Vec<_> = decisions
        .iter()
        .filter(|r| matches!(r.status, DecisionStatus::Executed))
        .collect();
    assert!(!executed.is_empty(), "no executed decisions");
    assert!(executed.iter().all(|r| r.decision.verify_integrity()));
    assert_eq!(executed[0].decision.direction, Direction::Long);

    // The fill produced an open long and its order records.
    assert!(harness.ledger.is_open("BTC/USD", PositionSide::Long));
    let orders = harness.ledger.recent_orders(10).await;
    assert!(!orders.is_empty());
}

#[tokio::test]
async fn test_at_most_one_open_order_per_symbol_side() {
    let harness = build_harness(vec!["BTC/USD".to_string()]);
    // Several cycles of relentless bullishness.
    run_cycles(&harness, 3200).await;

    // Exactly one primary buy ever reached the broker for (BTC/USD, long);
    // later cycles were rejected as duplicates.
    let orders = harness.ledger.recent_orders(100).await;
    let primaries: Vec<_> = orders
        .iter()
        .filter(|r| r.order.bracket.is_none() && r.order.side == OrderSide::Buy)
        .collect();
    assert_eq!(primaries.len(), 1, "duplicate primary orders submitted");

    let decisions = harness.ledger.query_decisions(None, None, None).await;
    let duplicates = decisions
        .iter()
        .filter(|r| {
            matches!(
                r.status,
                DecisionStatus::Rejected(RejectReason::DuplicatePosition { .. })
            )
        })
        .count();
    assert!(duplicates >= 1, "expected duplicate-position rejections");
}

#[tokio::test]
async fn test_halted_governor_blocks_all_sizing() {
    let harness = build_harness(vec!["BTC/USD".to_string(), "ETH/USD".to_string()]);

    // Breach the drawdown limit before any cycle runs.
    harness.governor.on_equity_update(dec!(80000)).await;
    assert!(!harness.governor.is_trading_permitted());

    run_cycles(&harness, 500).await;

    let decisions = harness.ledger.query_decisions(None, None, None).await;
    assert!(!decisions.is_empty());
    assert!(
        decisions.iter().all(|r| matches!(
            r.status,
            DecisionStatus::Rejected(RejectReason::RiskHalted(_))
        )),
        "every decision under HALT must be rejected with the halt reason"
    );
    assert!(!harness.ledger.is_open("BTC/USD", PositionSide::Long));

    let snapshot = harness.governor.snapshot();
    assert!(snapshot.trading_halted);
    assert!(snapshot.halt_reason.is_some());
    assert!(snapshot.halted_at.is_some());
}

#[tokio::test]
async fn test_operator_reset_reopens_trading() {
    let harness = build_harness(vec!["BTC/USD".to_string()]);
    harness.governor.on_equity_update(dec!(80000)).await;
    assert!(!harness.governor.is_trading_permitted());

    // Recovery alone never lifts the halt.
    harness.governor.on_equity_update(dec!(120000)).await;
    assert!(!harness.governor.is_trading_permitted());

    harness.governor.reset_halt().await;
    assert!(harness.governor.is_trading_permitted());

    run_cycles(&harness, 500).await;
    let decisions = harness.ledger.query_decisions(None, None, None).await;
    assert!(decisions
        .iter()
        .any(|r| matches!(r.status, DecisionStatus::Executed)));
}
