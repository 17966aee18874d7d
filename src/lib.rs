pub mod client;
pub mod config;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod headers;
pub mod health;
pub mod lock;
pub mod metrics;
pub mod middleware;
pub mod protocol;
pub mod queue;
pub mod rate_limit;
pub mod rate_limiter;
pub mod redis;
pub mod route;
pub mod server;
pub mod template;
pub mod transport;

pub use client::CoordinatorClient;
pub use config::{Config, ShardIdentity};
pub use error::{Error, ErrorCode, Result};
pub use gate::{Gate, LocalGate};
pub use headers::RateLimitHeaders;
pub use lock::LockManager;
pub use protocol::{Authorization, LockRequest, RequestMeta, Response, Token, WireMessage};
pub use queue::RequestQueue;
pub use rate_limit::RateLimit;
pub use rate_limiter::RateLimiter;
pub use server::create_app;
pub use template::RateLimitTemplate;
pub use transport::{ApiRequest, HttpTransport, Transport, TransportResponse};
