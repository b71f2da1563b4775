use std::sync::Arc;

use clap::{Parser, Subcommand};
use quorum::config::{AppConfig, BrokerMode};
use quorum::consensus::ConsensusEngine;
use quorum::engine::{CycleSupervisor, Heartbeat, TradingEngine};
use quorum::error::Result;
use quorum::execution::{BrokerClient, ExecutionEngine, PaperBroker, RestBroker};
use quorum::ledger::DecisionLedger;
use quorum::risk::RiskGovernor;
use quorum::services::{HealthServer, HealthState};
use quorum::sizing::PositionSizer;
use quorum::sources::{OpinionSource, SimulatedSource, SourceRegistry};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "quorum",
    about = "Consensus-driven trading decision and execution core"
)]
struct Cli {
    /// Configuration directory
    #[arg(long, default_value = "config")]
    config_dir: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading engine (default)
    Run,
    /// Load and validate configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config_dir)?;
    let _log_guard = init_logging(&config);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => match config.validate() {
            Ok(()) => {
                println!("configuration OK");
                Ok(())
            }
            Err(errors) => {
                for e in &errors {
                    eprintln!("config error: {e}");
                }
                Err(quorum::QuorumError::InvalidConfig(errors.join("; ")))
            }
        },
        Commands::Run => {
            if let Err(errors) = config.validate() {
                for e in &errors {
                    error!("config error: {e}");
                }
                return Err(quorum::QuorumError::InvalidConfig(errors.join("; ")));
            }
            run_engine(config).await
        }
    }
}

async fn run_engine(config: AppConfig) -> Result<()> {
    let limits = config.risk.active_limits()?;
    info!(
        profile = %config.risk.profile,
        max_drawdown_pct = limits.max_drawdown_pct,
        daily_loss_limit_pct = limits.daily_loss_limit_pct,
        "risk limit profile active"
    );

    let catalog = Arc::new(config.instrument_catalog());

    let broker: Arc<dyn BrokerClient> = match config.broker.mode {
        BrokerMode::Paper => {
            info!("paper broker active, no live orders will be placed");
            Arc::new(PaperBroker::new(
                config.broker.paper_starting_equity,
                &config.engine.symbols,
            ))
        }
        BrokerMode::Rest => {
            info!(url = %config.broker.rest_url, "REST broker active");
            Arc::new(RestBroker::new(&config.broker)?)
        }
    };

    // Initial account snapshot seeds the governor's equity baseline.
    let initial_equity = match broker.get_account().await {
        Ok(account) => account.equity,
        Err(e) => {
            warn!(error = %e, "account unavailable at startup, seeding governor from config");
            config.broker.paper_starting_equity
        }
    };

    let governor = Arc::new(RiskGovernor::new(
        limits.clone(),
        config.risk.clone(),
        initial_equity,
    ));

    // Fixed source set, registered at process start. Real provider adapters
    // replace the simulated ones here.
    let sources: Vec<Arc<dyn OpinionSource>> = vec![
        Arc::new(SimulatedSource::new("sim-momentum", 1.0, 0.55)),
        Arc::new(SimulatedSource::new("sim-meanrev", 1.0, 0.45)),
        Arc::new(SimulatedSource::new("sim-sentiment", 0.8, 0.50)),
    ];
    let registry = Arc::new(SourceRegistry::new(
        sources,
        config.consensus.max_source_auth_failures,
    ));

    let consensus = Arc::new(ConsensusEngine::new(
        registry.clone(),
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
    let ledger = Arc::new(DecisionLedger::new(10_000));
    let heartbeat = Heartbeat::new();

    let engine = Arc::new(TradingEngine::new(
        config.engine.clone(),
        consensus,
        governor.clone(),
        sizer,
        execution.clone(),
        ledger.clone(),
        broker.clone(),
        catalog,
        heartbeat.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Governor poll loop: a breach is never undetected for longer than one
    // interval even when no fills arrive.
    let poll_broker = broker.clone();
    let poll_governor = governor.clone();
    let poll_shutdown = shutdown_rx.clone();
    let governor_task = tokio::spawn(async move {
        poll_governor
            .run_poll_loop(
                move || {
                    let broker = poll_broker.clone();
                    async move { broker.get_account().await.ok().map(|a| a.equity) }
                },
                poll_shutdown,
            )
            .await;
    });

    // Health/status surface.
    let health_state = Arc::new(HealthState {
        started_at: chrono::Utc::now(),
        governor: governor.clone(),
        ledger: ledger.clone(),
        sources: registry.clone(),
        heartbeat: heartbeat.clone(),
        engine: engine.clone(),
        execution: execution.clone(),
        cycle_stale_after_secs: (config.engine.cycle_interval_secs
            * config.engine.liveness_factor as u64) as i64,
    });
    let health_server = HealthServer::new(health_state, config.health_port);
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            error!(error = %e, "health server exited");
        }
    });

    // Supervised trading cycle: restarted with bounded attempts per window
    // if it stalls or crashes.
    let supervisor = CycleSupervisor::new(config.engine.clone(), heartbeat);
    let cycle_engine = engine.clone();
    let cycle_shutdown = shutdown_rx.clone();
    let supervisor_shutdown = shutdown_rx.clone();
    let supervisor_task = tokio::spawn(async move {
        supervisor
            .supervise(
                move || {
                    let engine = cycle_engine.clone();
                    let shutdown = cycle_shutdown.clone();
                    engine.run(shutdown)
                },
                supervisor_shutdown,
            )
            .await;
    });

    shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Bounded grace period for in-flight work.
    let drain = async {
        let _ = supervisor_task.await;
        let _ = governor_task.await;
    };
    if tokio::time::timeout(std::time::Duration::from_secs(10), drain)
        .await
        .is_err()
    {
        warn!("graceful shutdown timed out");
    }
    health_task.abort();
    info!("shutdown complete");
    Ok(())
}

fn init_logging(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,quorum={}", config.logging.level)));

    if let Some(dir) = config.logging.dir.as_deref() {
        // Daemon mode: daily-rolled files through a non-blocking writer. The
        // guard must outlive the process to flush on shutdown.
        let appender = tracing_appender::rolling::daily(dir, "quorum.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true);
        if config.logging.json {
            builder.json().init();
        } else {
            builder.init();
        }
        return Some(guard);
    }

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    None
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
