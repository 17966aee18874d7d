use crate::lock::LockStats;
use crate::rate_limiter::LimiterStats;
use crate::redis::TemplateStore;
use serde::{Deserialize, Serialize};
use std::time::{Instant, SystemTime};

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub buckets: LimiterStats,
    pub locks: LockStats,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub redis: ServiceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

impl HealthStatus {
    pub fn new(buckets: LimiterStats, locks: LockStats, redis: ServiceStatus) -> Self {
        let now = SystemTime::now();
        // without Redis the service still works, just without persistence
        let status = if redis.status == "unavailable" {
            "degraded"
        } else {
            "healthy"
        };

        Self {
            status: status.to_string(),
            timestamp: now
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: now.duration_since(*START_TIME).unwrap_or_default().as_secs(),
            buckets,
            locks,
            dependencies: DependencyStatus { redis },
        }
    }
}

pub async fn check_redis(store: Option<&TemplateStore>) -> ServiceStatus {
    let Some(store) = store else {
        return ServiceStatus {
            status: "disabled".to_string(),
            response_time_ms: 0,
            error: None,
        };
    };

    let start = Instant::now();
    match store.ping().await {
        Ok(()) => ServiceStatus {
            status: "healthy".to_string(),
            response_time_ms: start.elapsed().as_millis() as u64,
            error: None,
        },
        Err(e) => ServiceStatus {
            status: "unavailable".to_string(),
            response_time_ms: start.elapsed().as_millis() as u64,
            error: Some(e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> (LimiterStats, LockStats) {
        (
            LimiterStats {
                templates: 1,
                buckets: 2,
                routes: 3,
                global_reset: 0,
            },
            LockStats { held: 1, waiting: 0 },
        )
    }

    #[tokio::test]
    async fn test_redis_disabled_is_healthy() {
        let (buckets, locks) = stats();
        let status = HealthStatus::new(buckets, locks, check_redis(None).await);
        assert_eq!(status.status, "healthy");
        assert_eq!(status.dependencies.redis.status, "disabled");

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"held\":1"));
    }

    #[test]
    fn test_unavailable_redis_degrades() {
        let (buckets, locks) = stats();
        let status = HealthStatus::new(
            buckets,
            locks,
            ServiceStatus {
                status: "unavailable".to_string(),
                response_time_ms: 3,
                error: Some("refused".to_string()),
            },
        );
        assert_eq!(status.status, "degraded");
    }
}
