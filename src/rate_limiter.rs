use crate::error::{Error, Result};
use crate::headers::RateLimitHeaders;
use crate::protocol::{Authorization, RequestMeta};
use crate::rate_limit::{current_time_ms, RateLimit};
use crate::route::Route;
use crate::template::{RateLimitTemplate, TemplateSnapshot};
use axum::http::HeaderMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use tracing::{debug, warn};

/// Wait handed out when a bucket is open but its in-flight cap is reached.
pub const IN_FLIGHT_RETRY_MS: u64 = 50;

/// How long an unanswered probe blocks further requests on an unknown route.
pub const PROBE_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterOptions {
    /// Concurrent dispatches allowed on a bucket confirmed by a header.
    pub max_in_flight: u32,
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self { max_in_flight: 8 }
    }
}

/// Owns every template and live bucket of one process (or of the
/// coordination service) and answers "may this request go now?".
#[derive(Clone)]
pub struct RateLimiter {
    options: RateLimiterOptions,
    state: Arc<RwLock<LimiterState>>,
}

#[derive(Default)]
struct LimiterState {
    /// Keyed by route shape.
    templates: HashMap<String, Arc<RateLimitTemplate>>,
    /// Keyed by bucket id plus major parameter.
    buckets: HashMap<String, RateLimit>,
    /// Route key to the live bucket the remote assigned it.
    routes: HashMap<String, RouteBinding>,
    /// Route keys with an unanswered first request, and when it lapses.
    probes: HashMap<String, u64>,
    global_reset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RouteBinding {
    Bucket(String),
    Unlimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketSnapshot {
    pub remaining: u32,
    pub limit: u32,
    pub reset_timestamp: u64,
    pub in_flight: u32,
    pub confirmed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub templates: usize,
    pub buckets: usize,
    pub routes: usize,
    pub global_reset: u64,
}

impl RateLimiter {
    pub fn new(options: RateLimiterOptions) -> Self {
        Self {
            options,
            state: Arc::new(RwLock::new(LimiterState::default())),
        }
    }

    pub fn authorize(&self, meta: &RequestMeta) -> Result<Authorization> {
        self.authorize_at(meta, current_time_ms())
    }

    /// Decide whether `meta` may be sent at `now`. A grant is also a
    /// reservation: the bucket is decremented before the caller dispatches.
    pub fn authorize_at(&self, meta: &RequestMeta, now: u64) -> Result<Authorization> {
        let route = Route::new(&meta.method, &meta.url);
        let mut state = self.write()?;

        if state.global_reset > now {
            return Ok(Authorization {
                wait_for_ms: state.global_reset - now,
                global: true,
            });
        }

        let binding = state.routes.get(&route.key).cloned();
        let authorization = match binding {
            Some(RouteBinding::Unlimited) => Authorization::granted(),
            Some(RouteBinding::Bucket(live_key)) => {
                if !state.buckets.contains_key(&live_key) {
                    // evicted by cleanup; rebuild from the family template
                    match state.templates.get(&route.shape).cloned() {
                        Some(template) => {
                            state
                                .buckets
                                .insert(live_key.clone(), RateLimit::new_at(template, now));
                        }
                        None => {
                            state.routes.remove(&route.key);
                            return Ok(Self::probe(&mut state, &route, now));
                        }
                    }
                }

                match state.buckets.get_mut(&live_key) {
                    Some(rate_limit) => self.reserve(rate_limit, now),
                    None => Authorization::granted(),
                }
            }
            None => Self::probe(&mut state, &route, now),
        };

        debug!(
            route = %route.key,
            wait_for_ms = authorization.wait_for_ms,
            "Authorization decided"
        );
        Ok(authorization)
    }

    /// Fold a response back into bucket state. Returns the family template
    /// when it was created or tightened, so callers can persist it.
    pub fn observe(
        &self,
        meta: &RequestMeta,
        status: u16,
        headers: &HeaderMap,
    ) -> Result<Option<(String, TemplateSnapshot)>> {
        self.observe_at(meta, status, headers, current_time_ms())
    }

    pub fn observe_at(
        &self,
        meta: &RequestMeta,
        status: u16,
        headers: &HeaderMap,
        now: u64,
    ) -> Result<Option<(String, TemplateSnapshot)>> {
        let route = Route::new(&meta.method, &meta.url);
        let mut state = self.write()?;

        if status == 429 {
            if let Some(retry_after) = RateLimitHeaders::global_retry_after_ms(headers) {
                warn!(retry_after_ms = retry_after, "Global rate limit hit");
                state.global_reset = state.global_reset.max(now + retry_after);
            }
        }

        state.probes.remove(&route.key);

        let Some(parsed) = RateLimitHeaders::parse(headers) else {
            if (200..300).contains(&status) {
                state.routes.insert(route.key.clone(), RouteBinding::Unlimited);
            }
            return Ok(None);
        };

        let bucket = parsed.bucket.clone().unwrap_or_else(|| route.key.clone());
        let live_key = route.bucket_key(&bucket);

        // a response without a usable limit never touches the family template
        let mut tightened = None;
        let template = match (state.templates.get(&route.shape).cloned(), parsed.limit) {
            (Some(template), Some(limit)) => {
                if template.update(limit, parsed.reset_after_ms) {
                    tightened = Some(template.snapshot());
                }
                template
            }
            (Some(template), None) => template,
            (None, Some(limit)) => {
                let template = Arc::new(RateLimitTemplate::new(limit, parsed.reset_after_ms));
                state.templates.insert(route.shape.clone(), template.clone());
                tightened = Some(template.snapshot());
                template
            }
            (None, None) => match state.buckets.get(&live_key) {
                Some(rate_limit) => rate_limit.template().clone(),
                None => {
                    warn!(route = %route.key, bucket = %bucket, "Bucket headers without a limit, not binding route");
                    return Ok(None);
                }
            },
        };

        state
            .routes
            .insert(route.key.clone(), RouteBinding::Bucket(live_key.clone()));

        let rate_limit = state
            .buckets
            .entry(live_key)
            .or_insert_with(|| RateLimit::new_at(template, now));
        rate_limit.dispatch_settled();
        rate_limit.assign_if_stricter_at(&parsed, now);

        Ok(tightened.map(|snapshot| (route.shape, snapshot)))
    }

    /// Hand back a grant whose dispatch failed before any response came in.
    /// Frees the in-flight slot and any probe on the route; `remaining` stays
    /// spent because the request may still have reached the remote.
    pub fn cancel(&self, meta: &RequestMeta) -> Result<()> {
        let route = Route::new(&meta.method, &meta.url);
        let mut state = self.write()?;

        let probing = state.probes.remove(&route.key).is_some();
        if let Some(RouteBinding::Bucket(live_key)) = state.routes.get(&route.key).cloned() {
            if let Some(rate_limit) = state.buckets.get_mut(&live_key) {
                rate_limit.dispatch_settled();
            }
        }

        debug!(route = %route.key, probing, "Dispatch cancelled");
        Ok(())
    }

    /// Seed templates, typically from central storage at startup.
    pub fn load_templates(&self, templates: HashMap<String, TemplateSnapshot>) -> Result<usize> {
        let mut state = self.write()?;
        let count = templates.len();
        for (shape, snapshot) in templates {
            match state.templates.get(&shape) {
                Some(existing) => {
                    existing.update(snapshot.limit, snapshot.reset_after_ms);
                }
                None => {
                    state.templates.insert(shape, Arc::new(snapshot.into()));
                }
            }
        }
        Ok(count)
    }

    pub fn cleanup_expired(&self) -> Result<usize> {
        self.cleanup_expired_at(current_time_ms())
    }

    /// Drop idle bucket records and lapsed probes. Route bindings and
    /// templates survive, so an evicted bucket is rebuilt on next use.
    pub fn cleanup_expired_at(&self, now: u64) -> Result<usize> {
        let mut state = self.write()?;
        let initial_count = state.buckets.len();

        state.buckets.retain(|_, rate_limit| !rate_limit.is_expired_at(now));
        state.probes.retain(|_, deadline| *deadline > now);

        Ok(initial_count - state.buckets.len())
    }

    pub fn template(&self, shape: &str) -> Result<Option<TemplateSnapshot>> {
        let state = self.read()?;
        Ok(state.templates.get(shape).map(|t| t.snapshot()))
    }

    pub fn bucket(&self, meta: &RequestMeta) -> Result<Option<BucketSnapshot>> {
        let route = Route::new(&meta.method, &meta.url);
        let state = self.read()?;

        let Some(RouteBinding::Bucket(live_key)) = state.routes.get(&route.key) else {
            return Ok(None);
        };

        Ok(state.buckets.get(live_key).map(|rl| BucketSnapshot {
            remaining: rl.remaining(),
            limit: rl.limit(),
            reset_timestamp: rl.reset_timestamp(),
            in_flight: rl.in_flight(),
            confirmed: rl.is_confirmed(),
        }))
    }

    pub fn stats(&self) -> Result<LimiterStats> {
        let state = self.read()?;
        Ok(LimiterStats {
            templates: state.templates.len(),
            buckets: state.buckets.len(),
            routes: state.routes.len(),
            global_reset: state.global_reset,
        })
    }

    fn reserve(&self, rate_limit: &mut RateLimit, now: u64) -> Authorization {
        if rate_limit.is_rate_limited_at(now) {
            return Authorization {
                wait_for_ms: rate_limit.wait_ms_at(now).max(1),
                global: false,
            };
        }

        let cap = if rate_limit.is_confirmed() {
            self.options.max_in_flight
        } else {
            1
        };
        if rate_limit.in_flight() >= cap {
            return Authorization {
                wait_for_ms: IN_FLIGHT_RETRY_MS,
                global: false,
            };
        }

        rate_limit.decrement_remaining_at(now);
        rate_limit.dispatch_started();
        Authorization::granted()
    }

    /// Unknown routes get a single request through to learn their bucket.
    fn probe(state: &mut LimiterState, route: &Route, now: u64) -> Authorization {
        match state.probes.get(&route.key) {
            Some(deadline) if *deadline > now => Authorization {
                wait_for_ms: IN_FLIGHT_RETRY_MS,
                global: false,
            },
            _ => {
                state.probes.insert(route.key.clone(), now + PROBE_TIMEOUT_MS);
                Authorization::granted()
            }
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, LimiterState>> {
        self.state
            .read()
            .map_err(|_| Error::Internal("Failed to acquire read lock on buckets".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, LimiterState>> {
        self.state
            .write()
            .map_err(|_| Error::Internal("Failed to acquire write lock on buckets".to_string()))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::{BUCKET, GLOBAL, LIMIT, REMAINING, RESET_AFTER, RETRY_AFTER};
    use crate::rate_limit::EXPIRY_WINDOW_MS;
    use axum::http::HeaderValue;

    const T0: u64 = 1_700_000_000_000;

    fn bucket_headers(bucket: &str, limit: u32, remaining: u32, reset_after_secs: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(BUCKET, HeaderValue::from_str(bucket).unwrap());
        map.insert(LIMIT, HeaderValue::from_str(&limit.to_string()).unwrap());
        map.insert(REMAINING, HeaderValue::from_str(&remaining.to_string()).unwrap());
        map.insert(RESET_AFTER, HeaderValue::from_str(reset_after_secs).unwrap());
        map
    }

    fn send_message(channel: &str) -> RequestMeta {
        RequestMeta::new("POST", format!("/channels/{}/messages", channel))
    }

    #[test]
    fn test_unknown_route_allows_a_single_probe() {
        let limiter = RateLimiter::default();
        let meta = send_message("1");

        assert!(limiter.authorize_at(&meta, T0).unwrap().is_granted());
        let second = limiter.authorize_at(&meta, T0).unwrap();
        assert_eq!(second.wait_for_ms, IN_FLIGHT_RETRY_MS);

        // lapsed probes stop blocking
        assert!(limiter
            .authorize_at(&meta, T0 + PROBE_TIMEOUT_MS)
            .unwrap()
            .is_granted());
    }

    #[test]
    fn test_observed_headers_gate_the_bucket() {
        let limiter = RateLimiter::default();
        let meta = send_message("1");

        limiter.authorize_at(&meta, T0).unwrap();
        limiter
            .observe_at(&meta, 200, &bucket_headers("b1", 2, 1, "1"), T0)
            .unwrap();

        assert!(limiter.authorize_at(&meta, T0).unwrap().is_granted());
        let denied = limiter.authorize_at(&meta, T0 + 100).unwrap();
        assert!(!denied.is_granted());
        assert!(!denied.global);
        assert_eq!(denied.wait_for_ms, 900);

        let snapshot = limiter.bucket(&meta).unwrap().unwrap();
        assert_eq!(snapshot.remaining, 0);
        assert!(snapshot.confirmed);
    }

    #[test]
    fn test_cancel_frees_route_and_in_flight_slot() {
        let limiter = RateLimiter::default();
        let meta = RequestMeta::new("GET", "/guilds/1");

        assert!(limiter.authorize_at(&meta, T0).unwrap().is_granted());
        limiter.cancel(&meta).unwrap();
        assert!(limiter.authorize_at(&meta, T0 + 5).unwrap().is_granted());

        // unconfirmed bucket: the single in-flight slot comes back too
        let channel = send_message("1");
        limiter
            .observe_at(&channel, 200, &bucket_headers("b1", 5, 5, "1"), T0)
            .unwrap();
        assert!(limiter.authorize_at(&channel, T0 + 1000).unwrap().is_granted());
        assert_eq!(
            limiter.authorize_at(&channel, T0 + 1000).unwrap().wait_for_ms,
            IN_FLIGHT_RETRY_MS
        );
        limiter.cancel(&channel).unwrap();
        assert_eq!(limiter.bucket(&channel).unwrap().unwrap().in_flight, 0);
        assert!(limiter.authorize_at(&channel, T0 + 1001).unwrap().is_granted());
    }

    #[test]
    fn test_major_parameter_separates_buckets() {
        let limiter = RateLimiter::default();
        let a = send_message("1");
        let b = send_message("2");

        limiter.observe_at(&a, 200, &bucket_headers("b1", 1, 0, "5"), T0).unwrap();
        assert!(!limiter.authorize_at(&a, T0).unwrap().is_granted());

        // same family template, different live bucket
        limiter.observe_at(&b, 200, &bucket_headers("b1", 1, 1, "5"), T0).unwrap();
        assert!(limiter.authorize_at(&b, T0).unwrap().is_granted());
    }

    #[test]
    fn test_template_tightens_across_observations() {
        let limiter = RateLimiter::default();
        let shape = "POST /channels/:id/messages";

        let first = limiter
            .observe_at(&send_message("1"), 200, &bucket_headers("b1", 10, 9, "0.5"), T0)
            .unwrap();
        assert_eq!(
            first,
            Some((
                shape.to_string(),
                TemplateSnapshot {
                    limit: 10,
                    reset_after_ms: 500
                }
            ))
        );

        let looser = limiter
            .observe_at(&send_message("2"), 200, &bucket_headers("b1", 20, 19, "0.1"), T0)
            .unwrap();
        assert_eq!(looser, None);
        assert_eq!(
            limiter.template(shape).unwrap(),
            Some(TemplateSnapshot {
                limit: 10,
                reset_after_ms: 500
            })
        );
    }

    #[test]
    fn test_missing_limit_header_never_lowers_template() {
        let limiter = RateLimiter::default();
        let shape = "POST /channels/:id/messages";
        let mut partial = HeaderMap::new();
        partial.insert(BUCKET, HeaderValue::from_static("b1"));
        partial.insert(REMAINING, HeaderValue::from_static("0"));
        partial.insert(RESET_AFTER, HeaderValue::from_static("1"));

        // nothing known yet: the route stays unbound and no template appears
        assert_eq!(
            limiter.observe_at(&send_message("1"), 200, &partial, T0).unwrap(),
            None
        );
        assert_eq!(limiter.template(shape).unwrap(), None);
        assert!(limiter.bucket(&send_message("1")).unwrap().is_none());

        limiter
            .observe_at(&send_message("1"), 200, &bucket_headers("b1", 5, 4, "1"), T0)
            .unwrap();
        let again = limiter
            .observe_at(&send_message("1"), 200, &partial, T0 + 10)
            .unwrap();
        assert_eq!(again, None);
        assert_eq!(limiter.template(shape).unwrap().unwrap().limit, 5);

        let snapshot = limiter.bucket(&send_message("1")).unwrap().unwrap();
        assert_eq!(snapshot.limit, 5);
        assert_eq!(snapshot.remaining, 0);
    }

    #[test]
    fn test_unconfirmed_bucket_caps_in_flight_at_one() {
        let limiter = RateLimiter::new(RateLimiterOptions { max_in_flight: 2 });
        let meta = send_message("1");

        limiter.observe_at(&meta, 200, &bucket_headers("b1", 5, 5, "1"), T0).unwrap();
        assert!(limiter.authorize_at(&meta, T0).unwrap().is_granted());
        assert!(limiter.authorize_at(&meta, T0).unwrap().is_granted());
        assert_eq!(
            limiter.authorize_at(&meta, T0).unwrap().wait_for_ms,
            IN_FLIGHT_RETRY_MS
        );

        // window rolls over: unconfirmed again, one probe at a time
        assert!(limiter.authorize_at(&meta, T0 + 1000).unwrap().is_granted());
        assert_eq!(
            limiter.authorize_at(&meta, T0 + 1000).unwrap().wait_for_ms,
            IN_FLIGHT_RETRY_MS
        );
    }

    #[test]
    fn test_global_limit_blocks_every_route() {
        let limiter = RateLimiter::default();
        let mut headers = HeaderMap::new();
        headers.insert(GLOBAL, HeaderValue::from_static("true"));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));

        limiter.observe_at(&send_message("1"), 429, &headers, T0).unwrap();

        let auth = limiter
            .authorize_at(&RequestMeta::new("GET", "/users/@me"), T0 + 500)
            .unwrap();
        assert!(auth.global);
        assert_eq!(auth.wait_for_ms, 1500);
        assert!(limiter
            .authorize_at(&RequestMeta::new("GET", "/users/@me"), T0 + 2000)
            .unwrap()
            .is_granted());
    }

    #[test]
    fn test_route_without_bucket_header_is_unlimited() {
        let limiter = RateLimiter::default();
        let meta = RequestMeta::new("GET", "/gateway");

        limiter.authorize_at(&meta, T0).unwrap();
        limiter.observe_at(&meta, 200, &HeaderMap::new(), T0).unwrap();
        for _ in 0..20 {
            assert!(limiter.authorize_at(&meta, T0).unwrap().is_granted());
        }
    }

    #[test]
    fn test_evicted_bucket_is_rebuilt_from_template() {
        let limiter = RateLimiter::default();
        let meta = send_message("1");
        limiter.observe_at(&meta, 200, &bucket_headers("b1", 3, 0, "1"), T0).unwrap();

        let removed = limiter
            .cleanup_expired_at(T0 + EXPIRY_WINDOW_MS)
            .unwrap();
        assert_eq!(removed, 1);
        assert!(limiter.bucket(&meta).unwrap().is_none());

        let later = T0 + EXPIRY_WINDOW_MS + 1;
        assert!(limiter.authorize_at(&meta, later).unwrap().is_granted());
        let snapshot = limiter.bucket(&meta).unwrap().unwrap();
        assert_eq!(snapshot.limit, 3);
        assert_eq!(snapshot.remaining, 2);
    }

    #[test]
    fn test_load_templates_seeds_families() {
        let limiter = RateLimiter::default();
        let mut templates = HashMap::new();
        templates.insert(
            "GET /guilds/:id".to_string(),
            TemplateSnapshot {
                limit: 4,
                reset_after_ms: 2000,
            },
        );
        assert_eq!(limiter.load_templates(templates).unwrap(), 1);
        assert_eq!(limiter.stats().unwrap().templates, 1);
        assert_eq!(
            limiter.template("GET /guilds/:id").unwrap().unwrap().limit,
            4
        );
    }
}
