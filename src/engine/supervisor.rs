//! Cycle supervisor: the last line of defense against a silently-dead
//! decision loop.
//!
//! Owns the cycle task handle, observes its heartbeat, and restarts it with
//! bounded attempts per rolling window. The window resets over time, so
//! supervision never gives up permanently; it only backs off.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

use crate::config::EngineConfig;

/// Shared heartbeat cell: the cycle beats it every iteration, the supervisor
/// and the health surface read it.
#[derive(Debug, Default)]
pub struct Heartbeat {
    last_beat: RwLock<Option<DateTime<Utc>>>,
}

impl Heartbeat {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn beat(&self) {
        *self.last_beat.write().await = Some(Utc::now());
    }

    pub async fn last(&self) -> Option<DateTime<Utc>> {
        *self.last_beat.read().await
    }

    pub async fn is_stale(&self, max_age_secs: i64) -> bool {
        match self.last().await {
            Some(last) => Utc::now() - last > ChronoDuration::seconds(max_age_secs),
            None => false,
        }
    }
}

/// Restart bookkeeping over a rolling window.
#[derive(Debug, Default)]
struct RestartWindow {
    timestamps: Vec<DateTime<Utc>>,
}

impl RestartWindow {
    fn record(&mut self, window_secs: u64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::seconds(window_secs as i64);
        self.timestamps.retain(|t| *t >= cutoff);
        self.timestamps.push(Utc::now());
        self.timestamps.len()
    }
}

pub struct CycleSupervisor {
    config: EngineConfig,
    heartbeat: Arc<Heartbeat>,
    restarts: RwLock<RestartWindow>,
    restart_count: std::sync::atomic::AtomicU64,
}

impl CycleSupervisor {
    pub fn new(config: EngineConfig, heartbeat: Arc<Heartbeat>) -> Self {
        Self {
            config,
            heartbeat,
            restarts: RwLock::new(RestartWindow::default()),
            restart_count: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn total_restarts(&self) -> u64 {
        self.restart_count
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Supervise the cycle task: spawn it, watch liveness, restart on death
    /// or stall. `make_cycle` builds a fresh future for each (re)start.
    pub async fn supervise<F, Fut>(&self, make_cycle: F, mut shutdown: watch::Receiver<bool>)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let stale_after =
            (self.config.cycle_interval_secs * self.config.liveness_factor as u64) as i64;
        let check_interval =
            std::time::Duration::from_secs(self.config.cycle_interval_secs.max(1));

        let mut handle = tokio::spawn(make_cycle());
        info!("cycle supervisor started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(check_interval) => {
                    let dead = handle.is_finished();
                    let stalled = self.heartbeat.is_stale(stale_after).await;
                    if !dead && !stalled {
                        continue;
                    }

                    if dead {
                        // A crashed loop is fatal-but-recoverable.
                        match (&mut handle).await {
                            Ok(()) => warn!("cycle task exited unexpectedly"),
                            Err(e) => error!(error = %e, "cycle task aborted"),
                        }
                    } else {
                        warn!(stale_after_secs = stale_after, "cycle heartbeat stale, restarting task");
                        handle.abort();
                        let _ = (&mut handle).await;
                    }

                    let in_window = self
                        .restarts
                        .write()
                        .await
                        .record(self.config.restart_window_secs);
                    let attempt = self
                        .restart_count
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                        + 1;

                    if in_window > self.config.max_restarts_per_window as usize {
                        // Too many restarts in the window: back off a full
                        // window before trying again, but keep trying.
                        error!(
                            attempt,
                            in_window,
                            window_secs = self.config.restart_window_secs,
                            "restart budget exhausted, backing off before next attempt"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(std::time::Duration::from_secs(
                                self.config.restart_window_secs,
                            )) => {}
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    return;
                                }
                            }
                        }
                    }

                    info!(attempt, "restarting trading cycle");
                    handle = tokio::spawn(make_cycle());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("supervisor shutting down, stopping cycle task");
                        handle.abort();
                        let _ = handle.await;
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> EngineConfig {
        EngineConfig {
            cycle_interval_secs: 1,
            liveness_factor: 2,
            max_restarts_per_window: 5,
            restart_window_secs: 60,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_heartbeat_staleness() {
        let hb = Heartbeat::new();
        // Never beaten: not stale (the task may still be starting).
        assert!(!hb.is_stale(1).await);

        hb.beat().await;
        assert!(!hb.is_stale(60).await);
        assert!(hb.is_stale(-1).await);
    }

    #[tokio::test]
    async fn test_dead_cycle_is_restarted() {
        let hb = Heartbeat::new();
        let supervisor = Arc::new(CycleSupervisor::new(fast_config(), hb.clone()));
        let starts = Arc::new(AtomicU32::new(0));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let starts_clone = starts.clone();
        let hb_clone = hb.clone();
        let supervisor_clone = supervisor.clone();

        let task = tokio::spawn(async move {
            supervisor_clone
                .supervise(
                    move || {
                        let starts = starts_clone.clone();
                        let hb = hb_clone.clone();
                        async move {
                            starts.fetch_add(1, Ordering::SeqCst);
                            hb.beat().await;
                            // Die immediately: supervisor must bring us back.
                        }
                    },
                    shutdown_rx,
                )
                .await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        let _ = shutdown_tx.send(true);
        let _ = task.await;

        assert!(starts.load(Ordering::SeqCst) >= 2, "cycle was not restarted");
        assert!(supervisor.total_restarts() >= 1);
    }

    #[tokio::test]
    async fn test_restart_window_counts_recent_only() {
        let mut window = RestartWindow::default();
        assert_eq!(window.record(60), 1);
        assert_eq!(window.record(60), 2);
        // A zero-length window drops history immediately.
        assert_eq!(window.record(0), 1);
    }
}
