//! Built-in resources.

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tracing::debug;

use super::resource::{Resource, ResourceContext, ResourceError};
use crate::client::{BrokerClient, CallError};

/// `GET /ping`: one `{op: "ping"}` call through the broker.
pub struct PingResource {
    ctx: ResourceContext,
}

impl PingResource {
    #[must_use]
    pub const fn new(ctx: ResourceContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Resource for PingResource {
    fn name(&self) -> &str {
        "ping"
    }

    async fn init(&self) -> Result<Router, ResourceError> {
        Ok(Router::new()
            .route("/ping", get(ping))
            .with_state(self.ctx.client.clone()))
    }
}

async fn ping(State(client): State<BrokerClient>) -> Response {
    match client.call(json!({ "op": "ping" })).await {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => call_error_response(&e),
    }
}

/// `POST /relay/{op}`: forwards the JSON body as `{op, body}`.
pub struct RelayResource {
    ctx: ResourceContext,
}

impl RelayResource {
    #[must_use]
    pub const fn new(ctx: ResourceContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Resource for RelayResource {
    fn name(&self) -> &str {
        "relay"
    }

    async fn init(&self) -> Result<Router, ResourceError> {
        Ok(Router::new()
            .route("/relay/{op}", post(relay))
            .with_state(self.ctx.client.clone()))
    }
}

async fn relay(
    State(client): State<BrokerClient>,
    Path(op): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    debug!(op = %op, "Relaying call");
    match client.call(json!({ "op": op, "body": body })).await {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => call_error_response(&e),
    }
}

/// HTTP response for a failed broker call.
pub fn call_error_response(error: &CallError) -> Response {
    let status = match error {
        CallError::Remote(_) => StatusCode::BAD_GATEWAY,
        CallError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        CallError::Disconnected | CallError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        CallError::Encode(_) | CallError::DuplicateId(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = match error {
        CallError::Remote(value) => json!({ "error": value }),
        other => json!({ "error": other.to_string() }),
    };
    (status, Json(body)).into_response()
}
