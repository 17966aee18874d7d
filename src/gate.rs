//! The seam between the queue and whoever owns rate-limit state.
//!
//! In a single process that is a local [`RateLimiter`]; across processes it
//! is the coordination service, reached through
//! [`CoordinatorClient`](crate::client::CoordinatorClient).

use crate::error::Result;
use crate::protocol::{Authorization, RequestMeta};
use crate::rate_limiter::RateLimiter;
use crate::transport::TransportResponse;
use async_trait::async_trait;

#[async_trait]
pub trait Gate: Send + Sync + 'static {
    /// Ask whether `meta` may be dispatched now. A grant reserves capacity.
    async fn authorize(&self, meta: &RequestMeta) -> Result<Authorization>;

    /// Report the outcome of a dispatched request.
    async fn observe(&self, meta: &RequestMeta, response: &TransportResponse) -> Result<()>;

    /// Return the reservation of a granted request whose send failed.
    async fn cancel(&self, meta: &RequestMeta) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct LocalGate {
    limiter: RateLimiter,
}

impl LocalGate {
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

#[async_trait]
impl Gate for LocalGate {
    async fn authorize(&self, meta: &RequestMeta) -> Result<Authorization> {
        self.limiter.authorize(meta)
    }

    async fn observe(&self, meta: &RequestMeta, response: &TransportResponse) -> Result<()> {
        self.limiter
            .observe(meta, response.status, &response.headers)
            .map(|_| ())
    }

    async fn cancel(&self, meta: &RequestMeta) -> Result<()> {
        self.limiter.cancel(meta)
    }
}
