// ABOUTME: Wire envelope codec for broker calls and replies
// ABOUTME: Calls and replies are single-line JSON objects keyed by a "__cb" correlation token

//! Envelope codec.
//!
//! Every message that crosses the broker is one JSON object per line:
//!
//! ```text
//! call:    {"__cb": "<token>", "msg": <payload>}
//! reply:   {"__cb": "<token>", "msg": <payload>}
//! failure: {"__cb": "<token>", "error": <payload>}
//! ```
//!
//! The relay itself never decodes envelopes. Only the correlation client in
//! each worker and the external client adapter in the master look inside.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// JSON key carrying the correlation token.
pub const CORRELATION_KEY: &str = "__cb";

/// Errors produced while encoding or decoding envelopes
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Input was not valid JSON or did not have the envelope shape
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The `__cb` field was absent
    #[error("Envelope has no correlation id")]
    MissingCorrelationId,
}

/// Opaque token identifying one outstanding call.
///
/// Fresh ids are 32 lowercase hex characters taken from a random UUID, so the
/// chance of two live calls sharing an id is negligible. Ids received on the
/// wire are accepted verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh correlation id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Borrow the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload of an envelope: data on success, a failure value otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Successful payload (`msg`)
    Msg(Value),
    /// Failure indicator (`error`)
    Error(Value),
}

impl Body {
    /// Returns true for a failure body
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Convert into `Ok(payload)` or `Err(failure)`.
    pub fn into_result(self) -> Result<Value, Value> {
        match self {
            Self::Msg(value) => Ok(value),
            Self::Error(value) => Err(value),
        }
    }
}

/// A decoded call or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Correlation token
    pub id: CorrelationId,
    /// Payload or failure
    pub body: Body,
}

/// On-the-wire shape. `msg` and `error` are mutually exclusive when we encode.
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "__cb", default, skip_serializing_if = "Option::is_none")]
    cb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    msg: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
}

/// Only the correlation token, for callers that must not touch the payload.
#[derive(Debug, Deserialize)]
struct PeekEnvelope {
    #[serde(rename = "__cb")]
    cb: String,
}

impl Envelope {
    /// Build an outgoing call.
    pub fn call(id: CorrelationId, payload: Value) -> Self {
        Self {
            id,
            body: Body::Msg(payload),
        }
    }

    /// Build a successful reply.
    pub fn reply(id: CorrelationId, payload: Value) -> Self {
        Self::call(id, payload)
    }

    /// Build a failure reply.
    pub fn failure(id: CorrelationId, error: Value) -> Self {
        Self {
            id,
            body: Body::Error(error),
        }
    }

    /// Returns true when this envelope carries a failure
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        self.body.is_failure()
    }

    /// Serialize to a JSON line (with trailing newline).
    pub fn to_line(&self) -> Result<String, EnvelopeError> {
        let wire = match &self.body {
            Body::Msg(value) => WireEnvelope {
                cb: Some(self.id.0.clone()),
                msg: Some(value.clone()),
                error: None,
            },
            Body::Error(value) => WireEnvelope {
                cb: Some(self.id.0.clone()),
                msg: None,
                error: Some(value.clone()),
            },
        };
        let mut json = serde_json::to_string(&wire)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line.
    ///
    /// A present, non-null `error` marks a failure. Otherwise the body is `msg`,
    /// or `null` when `msg` is absent.
    pub fn from_line(line: &str) -> Result<Self, EnvelopeError> {
        let wire: WireEnvelope = serde_json::from_str(line.trim())?;
        let id = wire.cb.map(CorrelationId).ok_or(EnvelopeError::MissingCorrelationId)?;

        let body = match (wire.msg, wire.error) {
            (_, Some(error)) => Body::Error(error),
            (Some(msg), None) => Body::Msg(msg),
            (None, None) => Body::Msg(Value::Null),
        };

        Ok(Self { id, body })
    }
}

/// Extract the correlation id of a raw envelope line without decoding the payload.
pub fn peek_correlation_id(line: &str) -> Option<CorrelationId> {
    serde_json::from_str::<PeekEnvelope>(line.trim())
        .ok()
        .map(|peek| CorrelationId(peek.cb))
}
