//! Health/status HTTP server for production monitoring.
//!
//! Exposes liveness/readiness probes for process supervision, a full status
//! document (cycle liveness, last successful cycle, risk snapshot, per-source
//! health), Prometheus-style text metrics, the audit query endpoint, and the
//! operator's risk-halt reset.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::engine::{Heartbeat, TradingEngine};
use crate::execution::ExecutionEngine;
use crate::ledger::DecisionLedger;
use crate::risk::{RiskGovernor, RiskLevel, RiskSnapshot};
use crate::sources::{SourceHealth, SourceRegistry};

/// Health status for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub components: Vec<ComponentHealth>,
}

/// Full status document for operators.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub cycle_alive: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_successful_cycle: Option<DateTime<Utc>>,
    pub risk: RiskSnapshot,
    pub sources: Vec<SourceHealth>,
    pub open_positions: u32,
    pub decisions_recorded: usize,
}

/// Shared state for the health server.
pub struct HealthState {
    pub started_at: DateTime<Utc>,
    pub governor: Arc<RiskGovernor>,
    pub ledger: Arc<DecisionLedger>,
    pub sources: Arc<SourceRegistry>,
    pub heartbeat: Arc<Heartbeat>,
    pub engine: Arc<TradingEngine>,
    pub execution: Arc<ExecutionEngine>,
    /// Seconds without a heartbeat before the cycle counts as stale.
    pub cycle_stale_after_secs: i64,
}

impl HealthState {
    pub async fn cycle_alive(&self) -> bool {
        self.heartbeat.last().await.is_some()
            && !self.heartbeat.is_stale(self.cycle_stale_after_secs).await
    }

    pub async fn get_health(&self) -> HealthResponse {
        let mut components = Vec::new();
        let mut overall = HealthStatus::Healthy;

        // Background cycle liveness.
        let cycle_alive = self.cycle_alive().await;
        let cycle_status = if cycle_alive {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        if cycle_status != HealthStatus::Healthy {
            overall = HealthStatus::Unhealthy;
        }
        components.push(ComponentHealth {
            name: "trading_cycle".to_string(),
            status: cycle_status,
            message: (!cycle_alive).then(|| "heartbeat stale or absent".to_string()),
        });

        // Risk state.
        let risk = self.governor.snapshot();
        let risk_status = match risk.level {
            RiskLevel::Normal => HealthStatus::Healthy,
            RiskLevel::Warning => HealthStatus::Degraded,
            RiskLevel::Halted => HealthStatus::Unhealthy,
        };
        match risk_status {
            HealthStatus::Unhealthy => overall = HealthStatus::Unhealthy,
            HealthStatus::Degraded if overall == HealthStatus::Healthy => {
                overall = HealthStatus::Degraded;
            }
            _ => {}
        }
        components.push(ComponentHealth {
            name: "risk_governor".to_string(),
            status: risk_status,
            message: risk.halt_reason.clone().or(Some(risk.level.to_string())),
        });

        // Source health: degraded when any source self-disabled.
        let sources = self.sources.health_report().await;
        let disabled = sources.iter().filter(|s| !s.enabled).count();
        let source_status = if disabled == 0 {
            HealthStatus::Healthy
        } else if disabled < sources.len() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };
        match source_status {
            HealthStatus::Unhealthy => overall = HealthStatus::Unhealthy,
            HealthStatus::Degraded if overall == HealthStatus::Healthy => {
                overall = HealthStatus::Degraded;
            }
            _ => {}
        }
        components.push(ComponentHealth {
            name: "opinion_sources".to_string(),
            status: source_status,
            message: (disabled > 0).then(|| format!("{disabled} source(s) disabled")),
        });

        HealthResponse {
            status: overall,
            timestamp: Utc::now(),
            uptime_seconds: (Utc::now() - self.started_at).num_seconds() as u64,
            components,
        }
    }

    pub async fn get_status(&self) -> StatusResponse {
        StatusResponse {
            cycle_alive: self.cycle_alive().await,
            last_heartbeat: self.heartbeat.last().await,
            last_successful_cycle: self.engine.last_successful_cycle().await,
            risk: self.governor.snapshot(),
            sources: self.sources.health_report().await,
            open_positions: self.ledger.open_position_count(),
            decisions_recorded: self.ledger.decision_count().await,
        }
    }
}

/// Health check server
pub struct HealthServer {
    state: Arc<HealthState>,
    port: u16,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self { state, port }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/status", get(status_handler))
            .route("/metrics", get(metrics_handler))
            .route("/signals", get(signals_handler))
            .route("/risk/reset", post(risk_reset_handler))
            .layer(CorsLayer::permissive())
            .with_state(Arc::clone(&self.state))
    }

    /// Start the health server.
    pub async fn run(&self) -> crate::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("starting health server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router())
            .await
            .map_err(|e| crate::QuorumError::Internal(format!("health server error: {e}")))?;
        Ok(())
    }
}

async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    let code = match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(health))
}

/// Liveness probe: is the process alive?
async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Readiness probe: is the decision loop running?
async fn readiness_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    if state.cycle_alive().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn status_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    Json(state.get_status().await)
}

#[derive(Debug, Deserialize)]
struct SignalsQuery {
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    min_confidence: Option<f64>,
}

/// Audit sink: decisions by time range and minimum confidence, each carrying
/// its integrity hash.
async fn signals_handler(
    State(state): State<Arc<HealthState>>,
    Query(query): Query<SignalsQuery>,
) -> impl IntoResponse {
    let records = state
        .ledger
        .query_decisions(query.since, query.until, query.min_confidence)
        .await;
    Json(records)
}

/// Explicit operator reset, the only path out of HALTED.
async fn risk_reset_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let was_halted = !state.governor.is_trading_permitted();
    state.governor.reset_halt().await;
    info!(was_halted, "risk halt reset via operator endpoint");
    Json(serde_json::json!({ "reset": true, "was_halted": was_halted }))
}

/// Prometheus-style text metrics.
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    let risk = state.governor.snapshot();
    let execution = state.execution.metrics();

    let health_gauge = match health.status {
        HealthStatus::Healthy => 1,
        HealthStatus::Degraded => 0,
        HealthStatus::Unhealthy => -1,
    };
    let halted = if risk.trading_halted { 1 } else { 0 };
    let cycle_alive = if state.cycle_alive().await { 1 } else { 0 };

    let body = format!(
        r#"# HELP quorum_up Health status (1=healthy, 0=degraded, -1=unhealthy)
# TYPE quorum_up gauge
quorum_up {}

# HELP quorum_uptime_seconds Uptime in seconds
# TYPE quorum_uptime_seconds counter
quorum_uptime_seconds {}

# HELP quorum_cycle_alive Background cycle liveness
# TYPE quorum_cycle_alive gauge
quorum_cycle_alive {}

# HELP quorum_trading_halted Risk halt state
# TYPE quorum_trading_halted gauge
quorum_trading_halted {}

# HELP quorum_drawdown_pct Current drawdown from peak equity
# TYPE quorum_drawdown_pct gauge
quorum_drawdown_pct {}

# HELP quorum_daily_pnl_pct Daily P&L relative to day-open equity
# TYPE quorum_daily_pnl_pct gauge
quorum_daily_pnl_pct {}

# HELP quorum_orders_submitted_total Orders submitted
# TYPE quorum_orders_submitted_total counter
quorum_orders_submitted_total {}

# HELP quorum_orders_filled_total Orders filled
# TYPE quorum_orders_filled_total counter
quorum_orders_filled_total {}

# HELP quorum_orders_failed_total Orders failed
# TYPE quorum_orders_failed_total counter
quorum_orders_failed_total {}

# HELP quorum_orders_degraded_total Simulated-fill degradations
# TYPE quorum_orders_degraded_total counter
quorum_orders_degraded_total {}

# HELP quorum_bracket_failures_total Protective orders that exhausted retries
# TYPE quorum_bracket_failures_total counter
quorum_bracket_failures_total {}

# HELP quorum_open_positions Open position count
# TYPE quorum_open_positions gauge
quorum_open_positions {}
"#,
        health_gauge,
        health.uptime_seconds,
        cycle_alive,
        halted,
        risk.current_drawdown_pct,
        risk.daily_pnl_pct,
        execution.submitted,
        execution.filled,
        execution.failed,
        execution.degraded,
        execution.bracket_failures,
        state.ledger.open_position_count(),
    );

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; charset=utf-8",
        )],
        body,
    )
}
