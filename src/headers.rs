//! Rate-limit response header parsing.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

pub const BUCKET: &str = "x-ratelimit-bucket";
pub const LIMIT: &str = "x-ratelimit-limit";
pub const REMAINING: &str = "x-ratelimit-remaining";
pub const RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const GLOBAL: &str = "x-ratelimit-global";
pub const RETRY_AFTER: &str = "retry-after";

/// Rate-limit values carried by one response.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitHeaders {
    pub global: bool,
    pub bucket: Option<String>,
    /// `None` when the limit header is missing or unparsable.
    pub limit: Option<u32>,
    pub remaining: u32,
    pub reset_after_ms: u64,
}

impl RateLimitHeaders {
    /// Returns `None` when the response carries no bucket header, which means
    /// the route is unlimited or the headers were stripped.
    pub fn parse(headers: &HeaderMap) -> Option<Self> {
        let bucket = header_str(headers, BUCKET)?.to_string();

        Some(Self {
            global: is_global(headers),
            bucket: Some(bucket),
            limit: header_number(headers, LIMIT).map(|v| v.max(0.0) as u32),
            remaining: header_number(headers, REMAINING).map_or(0, |v| v.max(0.0) as u32),
            reset_after_ms: header_number(headers, RESET_AFTER)
                .or_else(|| header_number(headers, RETRY_AFTER))
                .map_or(0, seconds_to_ms),
        })
    }

    /// Wait imposed by an account-wide limit, if this response signals one.
    pub fn global_retry_after_ms(headers: &HeaderMap) -> Option<u64> {
        if !is_global(headers) {
            return None;
        }

        header_number(headers, RETRY_AFTER)
            .or_else(|| header_number(headers, RESET_AFTER))
            .map(seconds_to_ms)
    }
}

/// Rebuilds a header map from a relayed `{name: value}` JSON object.
/// Entries that are not valid header names or scalar values are skipped.
pub fn header_map_from_json(value: &Value) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let Some(object) = value.as_object() else {
        return headers;
    };

    for (name, value) in object {
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()),
            HeaderValue::from_str(&text),
        ) {
            headers.insert(name, value);
        }
    }

    headers
}

/// The rate-limit subset of a header map as a JSON object, for relaying.
pub fn header_map_to_json(headers: &HeaderMap) -> Value {
    let mut object = serde_json::Map::new();
    for name in [BUCKET, LIMIT, REMAINING, RESET_AFTER, GLOBAL, RETRY_AFTER] {
        if let Some(value) = header_str(headers, name) {
            object.insert(name.to_string(), Value::String(value.to_string()));
        }
    }
    Value::Object(object)
}

fn is_global(headers: &HeaderMap) -> bool {
    header_str(headers, GLOBAL).is_some_and(|v| !v.eq_ignore_ascii_case("false"))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn header_number(headers: &HeaderMap, name: &str) -> Option<f64> {
    header_str(headers, name)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

fn seconds_to_ms(seconds: f64) -> u64 {
    (seconds.max(0.0) * 1000.0).ceil() as u64
}
