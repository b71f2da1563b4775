//! Opinion source boundary.
//!
//! Concrete provider clients live outside this crate; in-core we own the
//! capability trait, per-source health tracking with session self-disable on
//! repeated hard auth errors, and the fixed registry built at process start.

pub mod sim;

pub use sim::SimulatedSource;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::domain::Opinion;
use crate::error::SourceError;

/// Capability interface implemented by every opinion source.
#[async_trait]
pub trait OpinionSource: Send + Sync {
    /// Stable identifier, unique within the registry.
    fn id(&self) -> &str;

    /// Static base weight applied to this source's votes.
    fn base_weight(&self) -> f64 {
        1.0
    }

    /// Fetch a raw opinion for the symbol. Should not retry internally;
    /// retry/exclusion policy belongs to the caller.
    async fn fetch(&self, symbol: &str) -> Result<Opinion, SourceError>;
}

/// Point-in-time health of one source, surfaced on the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub source_id: String,
    pub enabled: bool,
    pub consecutive_auth_failures: u32,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SourceHealth {
    fn new(source_id: String) -> Self {
        Self {
            source_id,
            enabled: true,
            consecutive_auth_failures: 0,
            success_count: 0,
            failure_count: 0,
            last_success: None,
            last_error: None,
        }
    }

    /// Weight multiplier from health: 0 once the source self-disabled.
    pub fn factor(&self) -> f64 {
        if self.enabled {
            1.0
        } else {
            0.0
        }
    }
}

/// A registered source plus its health bookkeeping.
pub struct SourceHandle {
    source: Arc<dyn OpinionSource>,
    health: RwLock<SourceHealth>,
    max_auth_failures: u32,
}

impl SourceHandle {
    fn new(source: Arc<dyn OpinionSource>, max_auth_failures: u32) -> Self {
        let health = SourceHealth::new(source.id().to_string());
        Self {
            source,
            health: RwLock::new(health),
            max_auth_failures,
        }
    }

    pub fn id(&self) -> &str {
        self.source.id()
    }

    pub fn base_weight(&self) -> f64 {
        self.source.base_weight()
    }

    pub async fn health(&self) -> SourceHealth {
        self.health.read().await.clone()
    }

    pub async fn is_enabled(&self) -> bool {
        self.health.read().await.enabled
    }

    /// Fetch with a per-request timeout, recording the outcome. A disabled
    /// source returns immediately without a doomed network call.
    pub async fn fetch(&self, symbol: &str, timeout: Duration) -> Result<Opinion, SourceError> {
        if !self.is_enabled().await {
            return Err(SourceError::Disabled);
        }

        let result = match tokio::time::timeout(timeout, self.source.fetch(symbol)).await {
            Ok(inner) => inner,
            Err(_) => Err(SourceError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        match &result {
            Ok(_) => self.record_success().await,
            Err(e) => self.record_failure(e).await,
        }
        result
    }

    async fn record_success(&self) {
        let mut health = self.health.write().await;
        health.success_count += 1;
        health.consecutive_auth_failures = 0;
        health.last_success = Some(Utc::now());
        health.last_error = None;
    }

    async fn record_failure(&self, error: &SourceError) {
        let mut health = self.health.write().await;
        health.failure_count += 1;
        health.last_error = Some(error.to_string());

        if error.is_hard_auth() {
            health.consecutive_auth_failures += 1;
            if health.enabled && health.consecutive_auth_failures >= self.max_auth_failures {
                health.enabled = false;
                // Logged once, at disable time.
                warn!(
                    source = %health.source_id,
                    failures = health.consecutive_auth_failures,
                    "source self-disabled for the session after repeated auth failures"
                );
            }
        } else {
            debug!(source = %health.source_id, %error, "source fetch failed");
        }
    }
}

/// Fixed set of sources registered at process start. No runtime code loading:
/// a trait-object table covers all current and anticipated source types.
pub struct SourceRegistry {
    handles: Vec<Arc<SourceHandle>>,
}

impl SourceRegistry {
    pub fn new(sources: Vec<Arc<dyn OpinionSource>>, max_auth_failures: u32) -> Self {
        let handles = sources
            .into_iter()
            .map(|s| Arc::new(SourceHandle::new(s, max_auth_failures)))
            .collect();
        Self { handles }
    }

    /// Handles in registration order, the order the consensus fold uses.
    pub fn handles(&self) -> &[Arc<SourceHandle>] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub async fn health_report(&self) -> Vec<SourceHealth> {
        let mut report = Vec::with_capacity(self.handles.len());
        for handle in &self.handles {
            report.push(handle.health().await);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Direction;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedSource {
        id: String,
        fail_auth: bool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl OpinionSource for ScriptedSource {
        fn id(&self) -> &str {
            &self.id
        }

        async fn fetch(&self, symbol: &str) -> Result<Opinion, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_auth {
                Err(SourceError::Auth("401 unauthorized".into()))
            } else {
                Ok(Opinion::new(self.id.clone(), symbol, Direction::Long, 75.0))
            }
        }
    }

    struct SlowSource;

    #[async_trait]
    impl OpinionSource for SlowSource {
        fn id(&self) -> &str {
            "slow"
        }

        async fn fetch(&self, symbol: &str) -> Result<Opinion, SourceError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Opinion::new("slow", symbol, Direction::Long, 60.0))
        }
    }

    #[tokio::test]
    async fn test_self_disable_after_auth_failures() {
        let source = Arc::new(ScriptedSource {
            id: "flaky".into(),
            fail_auth: true,
            calls: AtomicU32::new(0),
        });
        let handle = SourceHandle::new(source.clone(), 3);
        let timeout = Duration::from_millis(100);

        for _ in 0..3 {
            let err = handle.fetch("BTC/USD", timeout).await.unwrap_err();
            assert!(err.is_hard_auth());
        }
        assert!(!handle.is_enabled().await);

        // Once disabled, no further network calls are made.
        let err = handle.fetch("BTC/USD", timeout).await.unwrap_err();
        assert_eq!(err, SourceError::Disabled);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(handle.health().await.factor(), 0.0);
    }

    #[tokio::test]
    async fn test_success_resets_auth_streak() {
        let handle = SourceHandle::new(
            Arc::new(ScriptedSource {
                id: "good".into(),
                fail_auth: false,
                calls: AtomicU32::new(0),
            }),
            3,
        );
        handle
            .fetch("BTC/USD", Duration::from_millis(100))
            .await
            .unwrap();

        let health = handle.health().await;
        assert_eq!(health.success_count, 1);
        assert_eq!(health.consecutive_auth_failures, 0);
        assert!(health.enabled);
        assert_eq!(health.factor(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_maps_to_source_error() {
        let handle = SourceHandle::new(Arc::new(SlowSource), 3);
        let err = handle
            .fetch("BTC/USD", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, SourceError::Timeout { timeout_ms: 50 });
        // Timeouts are soft failures: the source stays enabled.
        assert!(handle.is_enabled().await);
    }

    #[tokio::test]
    async fn test_registry_health_report() {
        let registry = SourceRegistry::new(
            vec![
                Arc::new(ScriptedSource {
                    id: "a".into(),
                    fail_auth: false,
                    calls: AtomicU32::new(0),
                }) as Arc<dyn OpinionSource>,
                Arc::new(ScriptedSource {
                    id: "b".into(),
                    fail_auth: false,
                    calls: AtomicU32::new(0),
                }) as Arc<dyn OpinionSource>,
            ],
            3,
        );

        assert_eq!(registry.len(), 2);
        let report = registry.health_report().await;
        assert_eq!(report.len(), 2);
        assert!(report.iter().all(|h| h.enabled));
    }
}
