use crate::client::CLIENT_ID_HEADER;
use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Runs each RPC inside a span tagged with the calling shard, so lock and
/// limiter logs emitted by the handler carry the caller. Lock waits are
/// long by nature; their latency is logged with the outcome.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let span = info_span!(
        target: "bucketlock::middleware",
        "rpc",
        method = %request.method(),
        uri = %request.uri(),
        client_id = %get_client_id(&request),
    );

    async move {
        debug!(target: "bucketlock::middleware", "Incoming request");
        let started = Instant::now();

        let response = next.run(request).await;

        let status = response.status();
        let latency_ms = started.elapsed().as_millis() as u64;
        if status.is_server_error() {
            warn!(target: "bucketlock::middleware", status = %status, latency_ms, "Request failed");
        } else {
            info!(target: "bucketlock::middleware", status = %status, latency_ms, "Request completed");
        }

        response
    }
    .instrument(span)
    .await
}

fn get_client_id(request: &Request) -> String {
    request
        .headers()
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("unknown")
        .to_string()
}
