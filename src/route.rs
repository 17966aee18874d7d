//! Route derivation for bucket families.
//!
//! A request maps to two keys: its *shape* (method plus path with every id
//! replaced), which names the template family, and its *key* (the shape
//! with the major parameter kept), which names the bucket until the remote
//! tells us the real bucket id.

use regex::Regex;
use std::sync::LazyLock;

static ID_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+$").expect("static regex is valid"));

static VERSION_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v\d+$").expect("static regex is valid"));

/// Path segments whose following id scopes a bucket on the remote.
const MAJOR_PARAMETERS: [&str; 3] = ["channels", "guilds", "webhooks"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub shape: String,
    pub key: String,
    pub major: Option<String>,
}

impl Route {
    pub fn new(method: &str, url: &str) -> Self {
        let method = method.trim().to_ascii_uppercase();
        let segments = path_segments(url);

        let mut shape = Vec::with_capacity(segments.len());
        let mut major = None;
        let mut previous: Option<&str> = None;

        for segment in segments.iter().copied() {
            if previous == Some("reactions") {
                // emoji and user ids under reactions all share one bucket
                shape.push(":reaction");
                break;
            }

            if ID_SEGMENT.is_match(segment) {
                if major.is_none() && previous.is_some_and(|p| MAJOR_PARAMETERS.contains(&p)) {
                    major = Some(segment.to_string());
                }
                shape.push(":id");
            } else {
                shape.push(segment);
            }
            previous = Some(segment);
        }

        let shape = format!("{} /{}", method, shape.join("/"));
        let key = match &major {
            Some(id) => format!("{}:{}", shape, id),
            None => shape.clone(),
        };

        Self { shape, key, major }
    }

    /// Live-state key for a known bucket id.
    pub fn bucket_key(&self, bucket: &str) -> String {
        match &self.major {
            Some(id) => format!("{}:{}", bucket, id),
            None => bucket.to_string(),
        }
    }
}

/// Path segments with scheme, host, query, and any `/api/vN` prefix removed.
fn path_segments(url: &str) -> Vec<&str> {
    let without_scheme = match url.find("://") {
        Some(idx) => {
            let rest = &url[idx + 3..];
            rest.find('/').map_or("", |slash| &rest[slash..])
        }
        None => url,
    };
    let path = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.first() == Some(&"api") {
        segments.remove(0);
        if segments.first().is_some_and(|s| VERSION_SEGMENT.is_match(s)) {
            segments.remove(0);
        }
    }
    segments
}
