use crate::error::{Error, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// Settings for the coordination service.
#[derive(Debug, Clone, Parser)]
#[command(name = "bucketlock", version, about = "Rate-limit lock and authorization service")]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL; enables central template persistence
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Bucket expiry and lock reaping interval in seconds
    #[arg(long = "cleanup-interval", env = "CLEANUP_INTERVAL", default_value_t = 60)]
    pub cleanup_interval_secs: u64,

    /// Lease of a granted lock in milliseconds
    #[arg(long, env = "LOCK_LEASE_MS", default_value_t = 30_000)]
    pub lock_lease_ms: u64,

    /// Concurrent dispatches allowed per confirmed bucket
    #[arg(long, env = "MAX_IN_FLIGHT", default_value_t = 8)]
    pub max_in_flight: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            redis_url: None,
            log_level: "info".to_string(),
            cleanup_interval_secs: 60,
            lock_lease_ms: 30_000,
            max_in_flight: 8,
        }
    }
}

impl Config {
    /// Load from command-line flags, falling back to environment variables.
    pub fn load() -> Result<Self> {
        let config = Config::try_parse().map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.redis_url {
            validate_redis_url(url)?;
        }

        if self.bind_addr.port() == 0 {
            return Err(Error::Configuration(
                "Server port must be greater than 0".to_string(),
            ));
        }

        if self.cleanup_interval_secs == 0 {
            return Err(Error::Configuration(
                "Cleanup interval must be greater than 0".to_string(),
            ));
        }

        if self.lock_lease_ms == 0 {
            return Err(Error::Configuration(
                "Lock lease must be greater than 0".to_string(),
            ));
        }

        if self.max_in_flight == 0 {
            return Err(Error::Configuration(
                "Max in-flight must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

fn validate_redis_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(Error::Configuration("Redis URL cannot be empty".to_string()));
    }

    if !url.starts_with("redis://") && !url.starts_with("rediss://") {
        return Err(Error::Configuration(
            "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
        ));
    }

    Ok(())
}

/// Identity of one worker process in a sharded deployment, as handed down
/// by the launcher through `TOKEN`, `SHARD_COUNT` and `SHARDS`.
#[derive(Debug, Clone, Parser)]
#[command(name = "bucketlock-shard", no_binary_name = true)]
pub struct ShardIdentity {
    /// API token used by this process
    #[arg(long, env = "TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Total number of shards across all processes
    #[arg(long, env = "SHARD_COUNT", default_value_t = 1)]
    pub shard_count: u32,

    /// Comma-separated shard ids run by this process; all shards if empty
    #[arg(long, env = "SHARDS", value_delimiter = ',')]
    pub shards: Vec<u32>,
}

impl ShardIdentity {
    /// Read the identity from the environment only.
    pub fn from_env() -> Result<Self> {
        let identity = Self::try_parse_from(std::iter::empty::<String>())
            .map_err(|e| Error::Configuration(e.to_string()))?;
        identity.validate()?;
        Ok(identity)
    }

    pub fn new(shard_count: u32, shards: Vec<u32>) -> Self {
        Self {
            token: None,
            shard_count,
            shards,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(Error::Configuration(
                "Shard count must be greater than 0".to_string(),
            ));
        }

        if let Some(bad) = self.shards.iter().find(|&&id| id >= self.shard_count) {
            return Err(Error::Configuration(format!(
                "Shard id {} is out of range for {} shards",
                bad, self.shard_count
            )));
        }

        Ok(())
    }

    pub fn shard_ids(&self) -> Vec<u32> {
        if self.shards.is_empty() {
            (0..self.shard_count).collect()
        } else {
            self.shards.clone()
        }
    }

    /// Label sent to the coordination service as `x-client-id`.
    pub fn label(&self) -> String {
        let ids: Vec<String> = self.shard_ids().iter().map(u32::to_string).collect();
        format!("shards[{}]/{}", ids.join(","), self.shard_count)
    }
}
