use crate::protocol::Authorization;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMetrics {
    pub authorizations_granted: u64,
    pub authorizations_deferred: u64,
    pub global_waits: u64,
    pub responses_relayed: u64,
    pub locks_granted: u64,
    pub lock_timeouts: u64,
    pub lock_rejections: u64,
    pub locks_released: u64,
    pub since: u64,
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self {
            authorizations_granted: 0,
            authorizations_deferred: 0,
            global_waits: 0,
            responses_relayed: 0,
            locks_granted: 0,
            lock_timeouts: 0,
            lock_rejections: 0,
            locks_released: 0,
            since: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    TimedOut,
    Rejected,
    Released,
}

#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    metrics: Arc<RwLock<ServiceMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_authorization(&self, authorization: &Authorization) {
        let mut metrics = self.metrics.write().await;
        if authorization.is_granted() {
            metrics.authorizations_granted += 1;
        } else {
            metrics.authorizations_deferred += 1;
            if authorization.global {
                metrics.global_waits += 1;
            }
        }
    }

    pub async fn record_relay(&self) {
        self.metrics.write().await.responses_relayed += 1;
    }

    pub async fn record_lock(&self, outcome: LockOutcome) {
        let mut metrics = self.metrics.write().await;
        match outcome {
            LockOutcome::Granted => metrics.locks_granted += 1,
            LockOutcome::TimedOut => metrics.lock_timeouts += 1,
            LockOutcome::Rejected => metrics.lock_rejections += 1,
            LockOutcome::Released => metrics.locks_released += 1,
        }
    }

    pub async fn snapshot(&self) -> ServiceMetrics {
        self.metrics.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_authorizations_are_split_by_outcome() {
        let collector = MetricsCollector::new();
        collector.record_authorization(&Authorization::granted()).await;
        collector
            .record_authorization(&Authorization {
                wait_for_ms: 10,
                global: true,
            })
            .await;
        collector.record_lock(LockOutcome::TimedOut).await;

        let snapshot = collector.snapshot().await;
        assert_eq!(snapshot.authorizations_granted, 1);
        assert_eq!(snapshot.authorizations_deferred, 1);
        assert_eq!(snapshot.global_waits, 1);
        assert_eq!(snapshot.lock_timeouts, 1);
    }
}
