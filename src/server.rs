use crate::config::Config;
use crate::error::{Error, Result};
use crate::handlers::{
    acquire_lock, authorize, cancel_dispatch, health_check, metrics, release_lock,
    relay_response, AppState, SharedState,
};
use crate::lock::LockManager;
use crate::metrics::MetricsCollector;
use crate::middleware::logging_middleware;
use crate::rate_limiter::{RateLimiter, RateLimiterOptions};
use crate::redis::TemplateStore;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub fn create_app(state: SharedState) -> Router {
    Router::new()
        // Lock endpoints
        .route("/locks/:name/acquire", post(acquire_lock))
        .route("/locks/:name/release", post(release_lock))
        // Rate limit endpoints
        .route("/authorize", post(authorize))
        .route("/responses", post(relay_response))
        .route("/cancel", post(cancel_dispatch))
        // Health and metrics endpoints
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

/// Periodically evict idle buckets and reap lapsed lock leases.
pub fn spawn_cleanup(state: SharedState, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            match (state.limiter.cleanup_expired(), state.locks.reap_expired()) {
                (Ok(buckets), Ok(locks)) => {
                    if buckets > 0 || locks > 0 {
                        tracing::debug!(buckets, locks, "Cleanup removed expired state");
                    }
                }
                (Err(e), _) | (_, Err(e)) => tracing::warn!(error = %e, "Cleanup failed"),
            }
        }
    })
}

pub struct Server {
    config: Config,
    state: SharedState,
}

impl Server {
    pub async fn new(config: Config) -> Result<Self> {
        let limiter = RateLimiter::new(RateLimiterOptions {
            max_in_flight: config.max_in_flight,
        });

        let store = match &config.redis_url {
            Some(url) => {
                let store = TemplateStore::new(url)?;
                match store.load_all().await {
                    Ok(templates) => {
                        let count = limiter.load_templates(templates)?;
                        tracing::info!("Loaded {} templates from Redis", count);
                    }
                    Err(e) => tracing::warn!(error = %e, "Starting without stored templates"),
                }
                Some(store)
            }
            None => None,
        };

        let state = Arc::new(AppState {
            limiter,
            locks: LockManager::new(config.lock_lease_ms),
            store,
            metrics: MetricsCollector::new(),
        });

        Ok(Self { config, state })
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| Error::Configuration(format!("Failed to bind {}: {}", self.config.bind_addr, e)))?;

        tracing::info!("bucketlock server listening on {}", self.config.bind_addr);
        tracing::info!("Health check available at /health");

        let cleanup = spawn_cleanup(self.state.clone(), self.config.cleanup_interval());
        let app = create_app(self.state);

        // Run server with graceful shutdown
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(format!("Server error: {}", e)));

        cleanup.abort();
        served
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
