use crate::headers::RateLimitHeaders;
use crate::template::RateLimitTemplate;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// How long an idle record stays in its owning cache after its last use.
pub const EXPIRY_WINDOW_MS: u64 = 5 * 60 * 1000;

pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Live counter for one concrete bucket.
///
/// Every operation has an `_at` form taking the current epoch-ms explicitly;
/// the plain forms read the system clock.
#[derive(Debug, Clone)]
pub struct RateLimit {
    remaining: u32,
    reset_timestamp: u64,
    limit: u32,
    expires: u64,
    template: Arc<RateLimitTemplate>,
    allow_header_override: bool,
    in_flight: u32,
}

impl RateLimit {
    pub fn new(template: Arc<RateLimitTemplate>) -> Self {
        Self::new_at(template, current_time_ms())
    }

    pub fn new_at(template: Arc<RateLimitTemplate>, now: u64) -> Self {
        let limit = template.limit();
        let reset_after = template.reset_after_ms();
        Self {
            remaining: limit,
            reset_timestamp: now + reset_after,
            limit,
            expires: now + EXPIRY_WINDOW_MS,
            template,
            allow_header_override: true,
            in_flight: 0,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn reset_timestamp(&self) -> u64 {
        self.reset_timestamp
    }

    pub fn expires(&self) -> u64 {
        self.expires
    }

    pub fn template(&self) -> &Arc<RateLimitTemplate> {
        &self.template
    }

    /// False until a header has been applied since the last reset.
    pub fn is_confirmed(&self) -> bool {
        !self.allow_header_override
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires
    }

    /// Milliseconds until the current window closes.
    pub fn wait_ms_at(&self, now: u64) -> u64 {
        self.reset_timestamp.saturating_sub(now)
    }

    pub fn is_rate_limited(&mut self) -> bool {
        self.is_rate_limited_at(current_time_ms())
    }

    pub fn is_rate_limited_at(&mut self, now: u64) -> bool {
        self.touch(now);

        if now >= self.reset_timestamp {
            self.reset_remaining_at(now);
            return false;
        }

        self.remaining == 0
    }

    /// Called right before a request is dispatched against this bucket.
    pub fn decrement_remaining(&mut self) {
        self.decrement_remaining_at(current_time_ms())
    }

    pub fn decrement_remaining_at(&mut self, now: u64) {
        self.touch(now);
        self.remaining = self.remaining.saturating_sub(1);
    }

    /// Merge a header observation. The first one after a reset replaces the
    /// local view; later ones may only make it stricter.
    pub fn assign_if_stricter(&mut self, headers: &RateLimitHeaders) -> bool {
        self.assign_if_stricter_at(headers, current_time_ms())
    }

    pub fn assign_if_stricter_at(&mut self, headers: &RateLimitHeaders, now: u64) -> bool {
        self.touch(now);
        let reset_timestamp = now + headers.reset_after_ms;

        if self.allow_header_override {
            self.remaining = headers.remaining;
            if let Some(limit) = headers.limit {
                self.limit = limit;
            }
            self.reset_timestamp = reset_timestamp;
            self.allow_header_override = false;
            return true;
        }

        let mut changed = false;
        if headers.remaining < self.remaining {
            self.remaining = headers.remaining;
            changed = true;
        }
        if reset_timestamp > self.reset_timestamp {
            self.reset_timestamp = reset_timestamp;
            changed = true;
        }
        if let Some(limit) = headers.limit.filter(|limit| *limit < self.limit) {
            self.limit = limit;
            changed = true;
        }
        changed
    }

    pub fn reset_remaining(&mut self) {
        self.reset_remaining_at(current_time_ms())
    }

    pub fn reset_remaining_at(&mut self, now: u64) {
        self.remaining = self.limit;
        self.reset_timestamp = now + self.template.reset_after_ms();
        self.allow_header_override = true;
        self.in_flight = 0;
    }

    pub fn dispatch_started(&mut self) {
        self.in_flight += 1;
    }

    pub fn dispatch_settled(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    fn touch(&mut self, now: u64) {
        self.expires = now + EXPIRY_WINDOW_MS;
    }
}
