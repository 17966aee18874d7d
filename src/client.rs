//! HTTP client for the coordination service.

use crate::config::ShardIdentity;
use crate::error::{Error, ErrorResponse, Result};
use crate::gate::Gate;
use crate::headers::header_map_to_json;
use crate::protocol::{
    Authorization, LockRequest, RequestMeta, Response, ResponseRelay, Token, WireMessage,
};
use crate::transport::TransportResponse;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Slack added to a lock wait so the HTTP call outlives the server's timer.
const LOCK_WAIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct CoordinatorClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
}

impl CoordinatorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: format!("pid-{}", std::process::id()),
        }
    }

    pub fn with_identity(mut self, identity: &ShardIdentity) -> Self {
        self.client_id = identity.label();
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Blocks up to `request.timeout_ms` on the server. A timeout comes back
    /// as [`Error::LockTimeout`], a stale token as [`Error::LockReleased`].
    pub async fn acquire_lock(&self, name: &str, request: &LockRequest) -> Result<Token> {
        let body = request.serialize()?;
        let timeout = Duration::from_millis(request.timeout_ms) + LOCK_WAIT_GRACE;

        match self.call(&format!("/locks/{}/acquire", name), body, Some(timeout)).await {
            Ok(value) => Token::parse(value),
            Err(Error::LockTimeout { .. }) => Err(Error::LockTimeout {
                key: name.to_string(),
                timeout_ms: request.timeout_ms,
            }),
            Err(e) => Err(e),
        }
    }

    pub async fn release_lock(&self, name: &str, token: &Token) -> Result<()> {
        let body = token.serialize()?;
        self.call(&format!("/locks/{}/release", name), body, None)
            .await
            .map(|_| ())
    }

    pub async fn authorize(&self, meta: &RequestMeta) -> Result<Authorization> {
        let value = self.call("/authorize", meta.serialize()?, None).await?;
        Authorization::parse(value)
    }

    pub async fn relay(&self, relay: &ResponseRelay) -> Result<()> {
        self.call("/responses", relay.serialize()?, None)
            .await
            .map(|_| ())
    }

    pub async fn cancel(&self, meta: &RequestMeta) -> Result<()> {
        self.call("/cancel", meta.serialize()?, None)
            .await
            .map(|_| ())
    }

    async fn call(&self, path: &str, body: Value, timeout: Option<Duration>) -> Result<Value> {
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header(CLIENT_ID_HEADER, &self.client_id)
            .json(&body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let status = response.status();
        debug!(path = %path, status = status.as_u16(), "Coordinator call finished");

        if status.is_success() {
            if status == reqwest::StatusCode::NO_CONTENT {
                return Ok(Value::Null);
            }
            return Ok(response.json::<Value>().await?);
        }

        let text = response.text().await?;
        match serde_json::from_str::<ErrorResponse>(&text) {
            Ok(error) => Err(error.into_error()),
            Err(_) => Err(Error::transport(
                crate::error::ErrorCode::Transport,
                format!("Coordinator returned {}: {}", status, text),
            )),
        }
    }
}

#[async_trait]
impl Gate for CoordinatorClient {
    async fn authorize(&self, meta: &RequestMeta) -> Result<Authorization> {
        CoordinatorClient::authorize(self, meta).await
    }

    async fn observe(&self, meta: &RequestMeta, response: &TransportResponse) -> Result<()> {
        let relay = ResponseRelay {
            request: meta.clone(),
            response: Response {
                status: response.status,
                status_text: response.status_text.clone(),
                data: response.body.clone(),
            },
            headers: header_map_to_json(&response.headers),
        };
        self.relay(&relay).await
    }

    async fn cancel(&self, meta: &RequestMeta) -> Result<()> {
        CoordinatorClient::cancel(self, meta).await
    }
}
