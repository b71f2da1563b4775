//! Risk governor: the single writer of process-wide risk state.
//!
//! Tracks equity, drawdown and daily P&L against the active limit profile and
//! exposes one boolean gate (`is_trading_permitted`) plus an immutable
//! snapshot read API. Every other component only reads snapshots; only the
//! governor mutates state.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

use crate::config::RiskGovernorConfig;

use super::limits::RiskLimits;

/// Governor state machine: `Normal → Warning → Halted`.
///
/// Warning is advisory and does not block execution. Halted is terminal until
/// an explicit operator reset, regardless of subsequent equity recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Normal,
    Warning,
    Halted,
}

impl RiskLevel {
    pub fn is_halted(&self) -> bool {
        matches!(self, RiskLevel::Halted)
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Normal => write!(f, "NORMAL"),
            RiskLevel::Warning => write!(f, "WARNING"),
            RiskLevel::Halted => write!(f, "HALTED"),
        }
    }
}

/// Immutable view of the governor's state, handed to readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub account_equity: Decimal,
    pub peak_equity: Decimal,
    pub day_open_equity: Decimal,
    pub current_drawdown_pct: f64,
    pub daily_pnl_pct: f64,
    pub level: RiskLevel,
    pub trading_halted: bool,
    pub halt_reason: Option<String>,
    pub halted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl RiskSnapshot {
    fn initial(equity: Decimal) -> Self {
        Self {
            account_equity: equity,
            peak_equity: equity,
            day_open_equity: equity,
            current_drawdown_pct: 0.0,
            daily_pnl_pct: 0.0,
            level: RiskLevel::Normal,
            trading_halted: false,
            halt_reason: None,
            halted_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// Mutable internals, guarded by the governor's write lock.
#[derive(Debug)]
struct GovernorInner {
    snapshot: RiskSnapshot,
    day: NaiveDate,
}

/// Single-owner risk state machine.
pub struct RiskGovernor {
    limits: RiskLimits,
    config: RiskGovernorConfig,
    inner: RwLock<GovernorInner>,
    /// Broadcasts the latest snapshot so readers get a consistent view
    /// without touching the write lock.
    snapshot_tx: watch::Sender<RiskSnapshot>,
    consecutive_failures: AtomicU32,
}

impl RiskGovernor {
    pub fn new(limits: RiskLimits, config: RiskGovernorConfig, initial_equity: Decimal) -> Self {
        let snapshot = RiskSnapshot::initial(initial_equity);
        let (snapshot_tx, _) = watch::channel(snapshot.clone());
        Self {
            limits,
            config,
            inner: RwLock::new(GovernorInner {
                snapshot,
                day: Utc::now().date_naive(),
            }),
            snapshot_tx,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Consistent snapshot of the current risk state.
    pub fn snapshot(&self) -> RiskSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Subscribe to snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<RiskSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// The single gate read by the execution path immediately before every
    /// new order.
    pub fn is_trading_permitted(&self) -> bool {
        !self.snapshot_tx.borrow().trading_halted
    }

    /// Recompute drawdown/daily metrics from an equity update and evaluate
    /// the limit transitions. Called on every fill and by the poll loop.
    pub async fn on_equity_update(&self, equity: Decimal) {
        let mut inner = self.inner.write().await;
        self.roll_day_if_needed(&mut inner, equity);

        let snapshot = &mut inner.snapshot;
        snapshot.account_equity = equity;
        if equity > snapshot.peak_equity {
            snapshot.peak_equity = equity;
        }

        snapshot.current_drawdown_pct = pct_decline(snapshot.peak_equity, equity);
        snapshot.daily_pnl_pct = pct_change(snapshot.day_open_equity, equity);
        snapshot.updated_at = Utc::now();

        self.evaluate_locked(snapshot);
        self.snapshot_tx.send_replace(snapshot.clone());
    }

    /// Closed-loop hook: every fill reports realized P&L and the refreshed
    /// equity so a breach is caught synchronously, never waiting for a poll.
    pub async fn on_fill(&self, realized_pnl: Decimal, equity: Decimal) {
        if realized_pnl < Decimal::ZERO {
            info!(pnl = %realized_pnl, "fill realized a loss");
        }
        self.on_equity_update(equity).await;
    }

    /// Consecutive execution failures raise WARNING; they never halt on
    /// their own.
    pub async fn record_execution_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.config.max_consecutive_failures {
            let mut inner = self.inner.write().await;
            let snapshot = &mut inner.snapshot;
            if snapshot.level == RiskLevel::Normal {
                snapshot.level = RiskLevel::Warning;
                snapshot.updated_at = Utc::now();
                warn!(failures, "risk level raised to WARNING after consecutive execution failures");
                self.snapshot_tx.send_replace(snapshot.clone());
            }
        }
    }

    pub fn record_execution_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Explicit operator reset, the only path out of HALTED.
    pub async fn reset_halt(&self) {
        let mut inner = self.inner.write().await;
        let snapshot = &mut inner.snapshot;
        if snapshot.trading_halted {
            info!(reason = ?snapshot.halt_reason, "operator reset: clearing HALT");
        }
        snapshot.level = RiskLevel::Normal;
        snapshot.trading_halted = false;
        snapshot.halt_reason = None;
        snapshot.halted_at = None;
        snapshot.updated_at = Utc::now();
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.snapshot_tx.send_replace(snapshot.clone());
    }

    /// Background poll loop: re-evaluates on a fixed interval so a breach is
    /// never undetected for longer than one interval even without fills.
    /// Equity refresh is supplied by the caller so the governor stays free of
    /// broker concerns.
    pub async fn run_poll_loop<F, Fut>(
        self: Arc<Self>,
        fetch_equity: F,
        mut shutdown: watch::Receiver<bool>,
    ) where
        F: Fn() -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Option<Decimal>> + Send,
    {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.poll_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Some(equity) = fetch_equity().await {
                        self.on_equity_update(equity).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("risk governor poll loop stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Evaluate limit transitions against the current metrics. HALT is
    /// monotonic: once set it is never cleared here.
    fn evaluate_locked(&self, snapshot: &mut RiskSnapshot) {
        if snapshot.trading_halted {
            return;
        }

        let drawdown_breach = snapshot.current_drawdown_pct >= self.limits.max_drawdown_pct;
        let daily_breach = snapshot.daily_pnl_pct <= -self.limits.daily_loss_limit_pct;

        if drawdown_breach || daily_breach {
            let reason = if drawdown_breach {
                format!(
                    "drawdown {:.2}% breached limit {:.2}%",
                    snapshot.current_drawdown_pct * 100.0,
                    self.limits.max_drawdown_pct * 100.0
                )
            } else {
                format!(
                    "daily loss {:.2}% breached limit {:.2}%",
                    snapshot.daily_pnl_pct.abs() * 100.0,
                    self.limits.daily_loss_limit_pct * 100.0
                )
            };
            error!(%reason, "RISK HALT");
            snapshot.level = RiskLevel::Halted;
            snapshot.trading_halted = true;
            snapshot.halt_reason = Some(reason);
            snapshot.halted_at = Some(Utc::now());
            return;
        }

        let near_drawdown = snapshot.current_drawdown_pct
            >= self.limits.max_drawdown_pct * self.config.warning_fraction;
        let near_daily = snapshot.daily_pnl_pct
            <= -self.limits.daily_loss_limit_pct * self.config.warning_fraction;

        if near_drawdown || near_daily {
            if snapshot.level == RiskLevel::Normal {
                warn!(
                    drawdown_pct = snapshot.current_drawdown_pct,
                    daily_pnl_pct = snapshot.daily_pnl_pct,
                    "risk level WARNING"
                );
            }
            snapshot.level = RiskLevel::Warning;
        } else if self.consecutive_failures.load(Ordering::SeqCst)
            < self.config.max_consecutive_failures
        {
            snapshot.level = RiskLevel::Normal;
        }
    }

    /// Reset daily metrics at the UTC day boundary. The halt flag survives a
    /// rollover; only an operator reset clears it.
    fn roll_day_if_needed(&self, inner: &mut GovernorInner, equity: Decimal) {
        let today = Utc::now().date_naive();
        if inner.day != today {
            info!(%today, "daily risk window reset");
            inner.day = today;
            inner.snapshot.day_open_equity = equity;
            inner.snapshot.daily_pnl_pct = 0.0;
        }
    }
}

fn pct_decline(peak: Decimal, current: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    if peak <= Decimal::ZERO {
        return 0.0;
    }
    ((peak - current) / peak).to_f64().unwrap_or(0.0).max(0.0)
}

fn pct_change(base: Decimal, current: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    if base <= Decimal::ZERO {
        return 0.0;
    }
    ((current - base) / base).to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn governor() -> RiskGovernor {
        RiskGovernor::new(
            RiskLimits {
                max_drawdown_pct: 0.02,
                daily_loss_limit_pct: 0.03,
                ..RiskLimits::default_profile()
            },
            RiskGovernorConfig::default(),
            dec!(100000),
        )
    }

    #[tokio::test]
    async fn test_drawdown_breach_halts() {
        let gov = governor();
        assert!(gov.is_trading_permitted());

        // 2.0% drawdown limit crossed
        gov.on_equity_update(dec!(97900)).await;
        let snapshot = gov.snapshot();
        assert_eq!(snapshot.level, RiskLevel::Halted);
        assert!(snapshot.trading_halted);
        assert!(snapshot.halt_reason.unwrap().contains("drawdown"));
        assert!(snapshot.halted_at.is_some());
        assert!(!gov.is_trading_permitted());
    }

    #[tokio::test]
    async fn test_halt_is_monotonic_through_recovery() {
        let gov = governor();
        gov.on_equity_update(dec!(97000)).await;
        assert!(!gov.is_trading_permitted());

        // Equity fully recovers; the halt must stay.
        gov.on_equity_update(dec!(105000)).await;
        assert!(!gov.is_trading_permitted());
        assert_eq!(gov.snapshot().level, RiskLevel::Halted);
    }

    #[tokio::test]
    async fn test_operator_reset_clears_halt() {
        let gov = governor();
        gov.on_equity_update(dec!(97000)).await;
        assert!(!gov.is_trading_permitted());

        gov.reset_halt().await;
        assert!(gov.is_trading_permitted());
        let snapshot = gov.snapshot();
        assert_eq!(snapshot.level, RiskLevel::Normal);
        assert!(snapshot.halt_reason.is_none());
    }

    #[tokio::test]
    async fn test_warning_is_advisory() {
        let gov = governor();
        // 1.6% drawdown: past 75% of the 2% limit, below the limit itself
        gov.on_equity_update(dec!(98400)).await;
        let snapshot = gov.snapshot();
        assert_eq!(snapshot.level, RiskLevel::Warning);
        assert!(gov.is_trading_permitted());
    }

    #[tokio::test]
    async fn test_peak_tracking_moves_up_only() {
        let gov = governor();
        gov.on_equity_update(dec!(110000)).await;
        gov.on_equity_update(dec!(109000)).await;
        let snapshot = gov.snapshot();
        assert_eq!(snapshot.peak_equity, dec!(110000));
        assert!(snapshot.current_drawdown_pct > 0.0);
    }

    #[tokio::test]
    async fn test_consecutive_failures_raise_warning_only() {
        let gov = governor();
        for _ in 0..3 {
            gov.record_execution_failure().await;
        }
        let snapshot = gov.snapshot();
        assert_eq!(snapshot.level, RiskLevel::Warning);
        assert!(gov.is_trading_permitted());

        gov.record_execution_success();
        assert_eq!(gov.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_fill_checks_synchronously() {
        let gov = governor();
        // A single losing fill crossing the daily loss limit halts without
        // waiting for the poll loop.
        gov.on_fill(dec!(-3100), dec!(96900)).await;
        assert!(!gov.is_trading_permitted());
        assert!(gov.snapshot().halt_reason.is_some());
    }
}
