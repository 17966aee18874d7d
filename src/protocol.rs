//! Lock / authorization RPC messages.
//!
//! Each message is a plain record plus a wire form. Inbound JSON goes
//! through [`WireMessage::parse`] and outbound records through
//! [`WireMessage::serialize`]; both validate before anything else sees the
//! value, so a malformed message never reaches stateful code.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

pub trait WireMessage: Sized {
    type Wire: Serialize + DeserializeOwned + Validate;

    fn from_wire(wire: Self::Wire) -> Result<Self>;

    fn to_wire(&self) -> Self::Wire;

    fn parse(value: Value) -> Result<Self> {
        let wire: Self::Wire = serde_json::from_value(value)
            .map_err(|e| Error::Validation(format!("Malformed message: {}", e)))?;
        wire.validate()?;
        Self::from_wire(wire)
    }

    fn serialize(&self) -> Result<Value> {
        let wire = self.to_wire();
        wire.validate()?;
        serde_json::to_value(&wire)
            .map_err(|e| Error::Validation(format!("Unserializable message: {}", e)))
    }
}

fn missing(field: &str) -> Error {
    Error::Validation(format!("Missing or invalid '{}' field", field))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub timeout_ms: u64,
    /// Present when a holder renews or proves ownership.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LockRequestWire {
    #[validate(required(message = "Missing 'time_out' field"), range(min = 0.0))]
    pub time_out: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, message = "'token' cannot be empty"))]
    pub token: Option<String>,
}

impl WireMessage for LockRequest {
    type Wire = LockRequestWire;

    fn from_wire(wire: Self::Wire) -> Result<Self> {
        Ok(Self {
            timeout_ms: wire.time_out.ok_or_else(|| missing("time_out"))? as u64,
            token: wire.token,
        })
    }

    fn to_wire(&self) -> Self::Wire {
        LockRequestWire {
            time_out: Some(self.timeout_ms as f64),
            token: self.token.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token {
    pub value: String,
}

impl Token {
    pub fn generate() -> Self {
        Self {
            value: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TokenWire {
    #[validate(
        required(message = "Missing 'value' field"),
        length(min = 1, message = "'value' cannot be empty")
    )]
    pub value: Option<String>,
}

impl WireMessage for Token {
    type Wire = TokenWire;

    fn from_wire(wire: Self::Wire) -> Result<Self> {
        Ok(Self {
            value: wire.value.ok_or_else(|| missing("value"))?,
        })
    }

    fn to_wire(&self) -> Self::Wire {
        TokenWire {
            value: Some(self.value.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authorization {
    /// Delay the client must honor before sending; 0 when clear now.
    pub wait_for_ms: u64,
    /// Whether the wait comes from an account-wide limit.
    pub global: bool,
}

impl Authorization {
    pub fn granted() -> Self {
        Self {
            wait_for_ms: 0,
            global: false,
        }
    }

    pub fn is_granted(&self) -> bool {
        self.wait_for_ms == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AuthorizationWire {
    #[validate(required(message = "Missing 'wait_for' field"), range(min = 0.0))]
    pub wait_for: Option<f64>,
    #[serde(default)]
    pub global: Option<bool>,
}

impl WireMessage for Authorization {
    type Wire = AuthorizationWire;

    fn from_wire(wire: Self::Wire) -> Result<Self> {
        Ok(Self {
            wait_for_ms: wire.wait_for.ok_or_else(|| missing("wait_for"))?.ceil() as u64,
            global: wire.global.unwrap_or(false),
        })
    }

    fn to_wire(&self) -> Self::Wire {
        AuthorizationWire {
            wait_for: Some(self.wait_for_ms as f64),
            global: Some(self.global),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestMeta {
    pub method: String,
    pub url: String,
}

impl RequestMeta {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RequestMetaWire {
    #[validate(
        required(message = "Missing 'method' field"),
        length(min = 1, message = "'method' cannot be empty")
    )]
    pub method: Option<String>,
    #[validate(
        required(message = "Missing 'url' field"),
        length(min = 1, message = "'url' cannot be empty")
    )]
    pub url: Option<String>,
}

impl WireMessage for RequestMeta {
    type Wire = RequestMetaWire;

    fn from_wire(wire: Self::Wire) -> Result<Self> {
        Ok(Self {
            method: wire.method.ok_or_else(|| missing("method"))?,
            url: wire.url.ok_or_else(|| missing("url"))?,
        })
    }

    fn to_wire(&self) -> Self::Wire {
        RequestMetaWire {
            method: Some(self.method.clone()),
            url: Some(self.url.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub status_text: Option<String>,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ResponseWire {
    #[validate(
        required(message = "Missing 'status_code' field"),
        range(min = 100.0, max = 599.0)
    )]
    pub status_code: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    /// JSON-encoded payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl WireMessage for Response {
    type Wire = ResponseWire;

    fn from_wire(wire: Self::Wire) -> Result<Self> {
        let data = match wire.data {
            // not JSON: hand the raw text through unchanged
            Some(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
            None => Value::Null,
        };

        Ok(Self {
            status: wire.status_code.ok_or_else(|| missing("status_code"))? as u16,
            status_text: wire.status_text,
            data,
        })
    }

    fn to_wire(&self) -> Self::Wire {
        ResponseWire {
            status_code: Some(self.status as f64),
            status_text: self.status_text.clone(),
            data: match &self.data {
                Value::Null => None,
                other => Some(other.to_string()),
            },
        }
    }
}

/// Body of `POST /responses`: a real outcome relayed back to the service.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseRelay {
    pub request: RequestMeta,
    pub response: Response,
    /// Rate-limit headers as a `{name: value}` object.
    pub headers: Value,
}

impl ResponseRelay {
    pub fn parse(mut value: Value) -> Result<Self> {
        let object = value
            .as_object_mut()
            .ok_or_else(|| Error::Validation("Relay body must be an object".to_string()))?;

        let request = object.remove("request").ok_or_else(|| missing("request"))?;
        let response = object.remove("response").ok_or_else(|| missing("response"))?;
        let headers = object.remove("headers").unwrap_or(Value::Null);

        Ok(Self {
            request: RequestMeta::parse(request)?,
            response: Response::parse(response)?,
            headers,
        })
    }

    pub fn serialize(&self) -> Result<Value> {
        Ok(serde_json::json!({
            "request": self.request.serialize()?,
            "response": self.response.serialize()?,
            "headers": self.headers,
        }))
    }
}
