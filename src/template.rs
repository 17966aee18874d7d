use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Reference values shared by every live bucket of one route family.
///
/// Updates only ever tighten: `limit` moves down, `reset_after_ms` moves up.
/// New [`RateLimit`](crate::rate_limit::RateLimit) states are seeded from the
/// current values before any header for that concrete bucket has been seen.
#[derive(Debug)]
pub struct RateLimitTemplate {
    limit: AtomicU32,
    reset_after_ms: AtomicU64,
}

/// Point-in-time copy of a template, used for persistence and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSnapshot {
    pub limit: u32,
    pub reset_after_ms: u64,
}

impl RateLimitTemplate {
    pub fn new(limit: u32, reset_after_ms: u64) -> Self {
        Self {
            limit: AtomicU32::new(limit),
            reset_after_ms: AtomicU64::new(reset_after_ms),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit.load(Ordering::Acquire)
    }

    pub fn reset_after_ms(&self) -> u64 {
        self.reset_after_ms.load(Ordering::Acquire)
    }

    /// Fold in an observation. Returns true if either value tightened.
    pub fn update(&self, limit: u32, reset_after_ms: u64) -> bool {
        let previous_limit = self.limit.fetch_min(limit, Ordering::AcqRel);
        let previous_reset = self.reset_after_ms.fetch_max(reset_after_ms, Ordering::AcqRel);
        limit < previous_limit || reset_after_ms > previous_reset
    }

    pub fn snapshot(&self) -> TemplateSnapshot {
        TemplateSnapshot {
            limit: self.limit(),
            reset_after_ms: self.reset_after_ms(),
        }
    }
}

impl From<TemplateSnapshot> for RateLimitTemplate {
    fn from(snapshot: TemplateSnapshot) -> Self {
        Self::new(snapshot.limit, snapshot.reset_after_ms)
    }
}
