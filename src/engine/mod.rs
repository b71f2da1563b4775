//! Trading engine: the long-lived background cycle.
//!
//! Every interval the cycle fans out across the configured symbols under a
//! bounded worker pool. Work for one symbol is strictly sequential: a
//! per-symbol lock is held from consensus through order submission, so a new
//! cycle's decision can never race the previous cycle's in-flight order.

pub mod supervisor;

pub use supervisor::{CycleSupervisor, Heartbeat};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::consensus::{ConsensusEngine, MarketRegime};
use crate::domain::{AccountSnapshot, DecisionStatus, PositionSide};
use crate::error::{ExecutionError, RejectReason};
use crate::execution::{BrokerClient, ExecutionEngine};
use crate::ledger::DecisionLedger;
use crate::risk::RiskGovernor;
use crate::sizing::PositionSizer;

/// Account snapshot cache with a short TTL, invalidated after every order
/// terminal transition and on connectivity errors. Never read stale across an
/// order-submission boundary.
pub struct AccountCache {
    broker: Arc<dyn BrokerClient>,
    ttl: Duration,
    inner: RwLock<Option<(AccountSnapshot, Instant)>>,
}

impl AccountCache {
    pub fn new(broker: Arc<dyn BrokerClient>, ttl: Duration) -> Self {
        Self {
            broker,
            ttl,
            inner: RwLock::new(None),
        }
    }

    pub async fn get(&self) -> Result<AccountSnapshot, ExecutionError> {
        {
            let cached = self.inner.read().await;
            if let Some((snapshot, fetched)) = cached.as_ref() {
                if fetched.elapsed() < self.ttl {
                    return Ok(snapshot.clone());
                }
            }
        }

        match self.broker.get_account().await {
            Ok(snapshot) => {
                *self.inner.write().await = Some((snapshot.clone(), Instant::now()));
                Ok(snapshot)
            }
            Err(e) => {
                // Connectivity failures poison the cache too.
                if matches!(e, ExecutionError::ConnectivityLost(_)) {
                    self.invalidate().await;
                }
                Err(e)
            }
        }
    }

    pub async fn invalidate(&self) {
        *self.inner.write().await = None;
    }
}

/// Rolling per-symbol price window for realized volatility and regime
/// classification.
#[derive(Debug, Default)]
struct PriceWindow {
    prices: VecDeque<f64>,
}

const PRICE_WINDOW_LEN: usize = 32;
const SHORT_WINDOW_LEN: usize = 8;

impl PriceWindow {
    fn push(&mut self, price: f64) {
        if self.prices.len() >= PRICE_WINDOW_LEN {
            self.prices.pop_front();
        }
        self.prices.push_back(price);
    }

    fn returns(slice: &[f64]) -> Vec<f64> {
        slice
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect()
    }

    fn stdev(returns: &[f64]) -> Option<f64> {
        if returns.len() < 2 {
            return None;
        }
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
            / (returns.len() - 1) as f64;
        Some(variance.sqrt())
    }

    /// Realized volatility over the full window.
    fn volatility(&self) -> Option<f64> {
        let all: Vec<f64> = self.prices.iter().copied().collect();
        Self::stdev(&Self::returns(&all))
    }

    /// Short/long volatility ratio for regime classification.
    fn vol_ratio(&self) -> Option<f64> {
        let all: Vec<f64> = self.prices.iter().copied().collect();
        if all.len() < SHORT_WINDOW_LEN * 2 {
            return None;
        }
        let long = Self::stdev(&Self::returns(&all))?;
        let short = Self::stdev(&Self::returns(&all[all.len() - SHORT_WINDOW_LEN..]))?;
        if long <= 0.0 {
            return None;
        }
        Some(short / long)
    }

    /// Direction consistency of recent returns, 0.0–1.0.
    fn trend_strength(&self) -> Option<f64> {
        let all: Vec<f64> = self.prices.iter().copied().collect();
        let returns = Self::returns(&all);
        if returns.len() < 4 {
            return None;
        }
        let net: f64 = returns.iter().map(|r| r.signum()).sum();
        Some((net.abs() / returns.len() as f64).clamp(0.0, 1.0))
    }
}

pub struct TradingEngine {
    config: EngineConfig,
    consensus: Arc<ConsensusEngine>,
    governor: Arc<RiskGovernor>,
    sizer: Arc<PositionSizer>,
    execution: Arc<ExecutionEngine>,
    ledger: Arc<DecisionLedger>,
    broker: Arc<dyn BrokerClient>,
    catalog: Arc<crate::domain::InstrumentCatalog>,
    account_cache: AccountCache,
    symbol_locks: DashMap<String, Arc<Mutex<()>>>,
    price_windows: DashMap<String, PriceWindow>,
    heartbeat: Arc<Heartbeat>,
    last_successful_cycle: RwLock<Option<DateTime<Utc>>>,
}

impl TradingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        consensus: Arc<ConsensusEngine>,
        governor: Arc<RiskGovernor>,
        sizer: Arc<PositionSizer>,
        execution: Arc<ExecutionEngine>,
        ledger: Arc<DecisionLedger>,
        broker: Arc<dyn BrokerClient>,
        catalog: Arc<crate::domain::InstrumentCatalog>,
        heartbeat: Arc<Heartbeat>,
    ) -> Self {
        let account_cache = AccountCache::new(
            broker.clone(),
            Duration::from_secs(config.account_cache_ttl_secs),
        );
        Self {
            config,
            consensus,
            governor,
            sizer,
            execution,
            ledger,
            broker,
            catalog,
            account_cache,
            symbol_locks: DashMap::new(),
            price_windows: DashMap::new(),
            heartbeat,
            last_successful_cycle: RwLock::new(None),
        }
    }

    pub fn heartbeat(&self) -> Arc<Heartbeat> {
        self.heartbeat.clone()
    }

    pub async fn last_successful_cycle(&self) -> Option<DateTime<Utc>> {
        *self.last_successful_cycle.read().await
    }

    /// The background cycle. Runs until shutdown; every iteration beats the
    /// heartbeat for the supervisor.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.cycle_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let pool = Arc::new(Semaphore::new(self.config.worker_pool_size));

        info!(
            symbols = self.config.symbols.len(),
            interval_secs = self.config.cycle_interval_secs,
            "trading cycle started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.heartbeat.beat().await;
                    Arc::clone(&self).run_one_cycle(pool.clone()).await;
                    *self.last_successful_cycle.write().await = Some(Utc::now());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("trading cycle stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Fan one cycle out across symbols under the worker pool. A failure in
    /// one symbol's pipeline never halts the cycle for other symbols.
    async fn run_one_cycle(self: Arc<Self>, pool: Arc<Semaphore>) {
        let mut tasks = Vec::with_capacity(self.config.symbols.len());
        for symbol in &self.config.symbols {
            let engine = Arc::clone(&self);
            let symbol = symbol.clone();
            let Ok(permit) = pool.clone().acquire_owned().await else {
                return;
            };
            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                engine.process_symbol(&symbol).await;
            }));
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "symbol task panicked; cycle continues");
            }
        }
    }

    /// One symbol's pipeline: consensus → risk gate → sizing → execution →
    /// ledger, strictly serialized per symbol.
    async fn process_symbol(&self, symbol: &str) {
        let lock = self
            .symbol_locks
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        // The previous cycle's attempt for this symbol has not reached a
        // tracked state yet: skip rather than double-submit.
        let Ok(_guard) = lock.try_lock() else {
            debug!(%symbol, "previous attempt still in flight, skipping this cycle");
            return;
        };

        if let Err(e) = self.process_symbol_locked(symbol).await {
            // Local recovery only: log, count, continue.
            warn!(%symbol, error = %e, "symbol pipeline error");
        }
    }

    async fn process_symbol_locked(&self, symbol: &str) -> crate::Result<()> {
        let Some(instrument) = self.catalog.get(symbol) else {
            warn!(%symbol, "symbol missing from instrument catalog");
            return Ok(());
        };

        let price = match self.broker.latest_price(symbol).await {
            Ok(price) => price,
            Err(e) => {
                if matches!(e, ExecutionError::ConnectivityLost(_)) {
                    self.account_cache.invalidate().await;
                }
                return Err(e.into());
            }
        };

        let (volatility, regime) = self.observe_price(symbol, price);

        let Some(decision) = self.consensus.aggregate(symbol, price, regime).await else {
            return Ok(());
        };

        let account = self.account_cache.get().await?;
        let risk = self.governor.snapshot();

        let sized = match self.sizer.size(
            &decision,
            &account,
            instrument,
            &risk,
            self.ledger.open_position_count(),
            volatility,
        ) {
            Ok(sized) => sized,
            Err(reason) => {
                debug!(%symbol, %reason, "decision rejected by sizer");
                let status = match reason {
                    RejectReason::StaleDecision { .. } => DecisionStatus::Expired,
                    other => DecisionStatus::Rejected(other),
                };
                self.ledger.record_decision(&decision, status).await;
                return Ok(());
            }
        };

        // Entries claim the (symbol, side) open slot before submission; the
        // claim is the at-most-one-open-order guarantee.
        let claimed = if !sized.closes_position {
            if let Err(reason) =
                self.ledger
                    .try_claim_open(symbol, sized.side, decision.decision_id)
            {
                self.ledger
                    .record_decision(&decision, DecisionStatus::Rejected(reason))
                    .await;
                return Ok(());
            }
            true
        } else {
            false
        };

        // Check-and-submit as one logical unit: the permitted gate is read
        // under the symbol lock immediately before submission, so a HALT
        // cannot race an admission past it.
        if !self.governor.is_trading_permitted() {
            if claimed {
                self.ledger.release_open(symbol, sized.side);
            }
            let snapshot = self.governor.snapshot();
            let reason = snapshot
                .halt_reason
                .unwrap_or_else(|| "risk halted".to_string());
            self.ledger
                .record_decision(
                    &decision,
                    DecisionStatus::Rejected(RejectReason::RiskHalted(reason)),
                )
                .await;
            return Ok(());
        }

        let report = self.execution.execute(&decision, &sized, instrument).await;

        // Every order, bracket included, lands in the ledger with its hash.
        self.ledger.record_order(&report.primary).await;
        for bracket in &report.brackets {
            self.ledger.record_order(bracket).await;
        }

        if report.primary.status.is_terminal() {
            self.account_cache.invalidate().await;
        }

        if report.is_filled() {
            self.governor.record_execution_success();
            self.ledger
                .record_decision(&decision, DecisionStatus::Executed)
                .await;

            if report.primary.closes_position {
                self.ledger.release_open(symbol, sized.side);
            }

            // Closed loop: report the fill to the governor synchronously so
            // a breach never waits for the next poll.
            let realized = self.realized_pnl(&report, &account, symbol);
            if let Ok(fresh) = self.account_cache.get().await {
                self.governor.on_fill(realized, fresh.equity).await;
            }

            info!(
                %symbol,
                order_id = %report.primary.order_id,
                degraded = report.primary.degraded,
                close = report.primary.closes_position,
                "order filled"
            );
        } else {
            if claimed {
                self.ledger.release_open(symbol, sized.side);
            }
            self.governor.record_execution_failure().await;
            let error = report
                .primary
                .error
                .clone()
                .unwrap_or_else(|| "execution failed".to_string());
            self.ledger
                .record_decision(
                    &decision,
                    DecisionStatus::Rejected(RejectReason::ExecutionFailed(error)),
                )
                .await;
        }

        Ok(())
    }

    /// Realized P&L for a close, from the position the account snapshot held
    /// before submission. Entries realize nothing.
    fn realized_pnl(
        &self,
        report: &crate::execution::ExecutionReport,
        account: &AccountSnapshot,
        symbol: &str,
    ) -> Decimal {
        if !report.primary.closes_position {
            return Decimal::ZERO;
        }
        let Some(position) = account.position_for(symbol) else {
            return Decimal::ZERO;
        };
        let Some(fill_price) = report.primary.avg_fill_price else {
            return Decimal::ZERO;
        };
        let delta = fill_price - position.entry_price;
        match position.side {
            PositionSide::Long => delta * report.primary.filled_quantity,
            PositionSide::Short => -delta * report.primary.filled_quantity,
        }
    }

    /// Record the price observation and derive volatility plus regime.
    fn observe_price(&self, symbol: &str, price: Decimal) -> (Option<f64>, MarketRegime) {
        let mut window = self.price_windows.entry(symbol.to_string()).or_default();
        if let Some(p) = price.to_f64() {
            window.push(p);
        }
        let volatility = window.volatility();
        let regime = MarketRegime::classify(window.vol_ratio(), window.trend_strength());
        (volatility, regime)
    }
}
