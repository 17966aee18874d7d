//! The outbound HTTP surface the queue dispatches through.

use crate::error::{Error, ErrorCode, Result};
use crate::protocol::RequestMeta;
use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::debug;

/// A request as submitted to the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: String,
    pub url: String,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn meta(&self) -> RequestMeta {
        RequestMeta::new(self.method.clone(), self.url.clone())
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub status_text: Option<String>,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TransportResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            status_text: None,
            headers: HeaderMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }
}

/// Sends one request. Errors tagged [`ErrorCode::Unavailable`] are final;
/// anything else is retried by the queue.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: &ApiRequest) -> Result<TransportResponse>;
}

/// [`Transport`] over `reqwest`, authenticating with a bot token.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url_for(&self, url: &str) -> String {
        if url.contains("://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<TransportResponse> {
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| Error::Validation(format!("Invalid method '{}': {}", request.method, e)))?;

        let mut builder = self.client.request(method, self.url_for(&request.url));
        if let Some(token) = &self.token {
            builder = builder.header("authorization", format!("Bot {}", token));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        debug!(method = %request.method, url = %request.url, status = status.as_u16(), "Request sent");

        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.insert(name, value);
            }
        }

        if status.is_server_error() {
            return Err(Error::transport(
                ErrorCode::Transport,
                format!("Remote returned {}", status),
            ));
        }

        let text = response.text().await?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(TransportResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().map(str::to_string),
            headers,
            body,
        })
    }
}
