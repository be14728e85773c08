//! OpenClaw gateway backend.
//!
//! Streaming completions go through the relay, which surfaces tool activity
//! from the gateway log while the gateway blocks in its tool loop and rides
//! out gateway restarts. Everything else is a passthrough.

use super::sse_response;
use crate::config::OpenClawConfig;
use crate::error::ProxyError;
use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use agentrelay_relay::{
    complete_with_retry, GatewayRequest, HttpGateway, LogSource, Relay, RelayFailure,
};
use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, warn};

/// Client headers passed on to the gateway.
pub const FORWARDED_HEADERS: [&str; 2] = ["authorization", "x-openclaw-session-key"];

const DEFAULT_MODEL: &str = "unknown";

pub struct OpenClawState {
    config: OpenClawConfig,
    gateway: Arc<HttpGateway>,
    relay: Relay<HttpGateway>,
}

impl OpenClawState {
    pub fn new(config: OpenClawConfig) -> Result<Self> {
        let gateway = Arc::new(
            HttpGateway::new(&config.base_url, &config.relay)
                .context("failed to build gateway client")?,
        );
        let relay = Relay::new(gateway.clone(), config.relay.clone())
            .with_log_source(LogSource::new(&config.log_dir, &config.log_prefix));
        Ok(Self {
            config,
            gateway,
            relay,
        })
    }

    pub fn relay(&self) -> &Relay<HttpGateway> {
        &self.relay
    }
}

/// Build the gateway request, copying the forwarded client headers.
pub fn gateway_request(req: &HttpRequest, body: Value) -> GatewayRequest {
    FORWARDED_HEADERS
        .iter()
        .filter_map(|name| {
            req.headers()
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(|v| (*name, v.to_string()))
        })
        .fold(GatewayRequest::new(body), |request, (name, value)| {
            request.with_header(name, value)
        })
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/v1/models", web::get().to(list_models))
        .route("/v1/chat/completions", web::post().to(chat_completions));
}

async fn list_models(
    state: web::Data<OpenClawState>,
    req: HttpRequest,
) -> Result<HttpResponse, ProxyError> {
    let mut upstream = state
        .gateway
        .client()
        .get(state.gateway.url("/v1/models"))
        .timeout(state.config.models_timeout());
    if let Some(auth) = crate::auth::authorization(&req) {
        upstream = upstream.header("authorization", auth);
    }

    let resp = upstream.send().await.map_err(|e| {
        error!(error = %e, "gateway model listing failed");
        ProxyError::Backend(format!("Gateway request failed: {}", e))
    })?;
    let status = resp.status().as_u16();
    let body: Value = resp
        .json()
        .await
        .map_err(|e| ProxyError::Backend(format!("Invalid gateway response: {}", e)))?;

    Ok(json_with_status(status, &body))
}

async fn chat_completions(
    state: web::Data<OpenClawState>,
    req: HttpRequest,
    body: web::Json<Value>,
) -> Result<HttpResponse, ProxyError> {
    let body = body.into_inner();
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_MODEL)
        .to_string();
    let request = gateway_request(&req, body);

    if stream {
        let session = state.relay.start(request, &model).await;
        return Ok(sse_response(session.into_frames()));
    }

    match complete_with_retry(state.gateway.as_ref(), &request, &state.config.relay).await {
        Ok(resp) => Ok(json_with_status(resp.status, &resp.body)),
        Err(RelayFailure::Exhausted { retries, last }) => {
            warn!(retries, error = %last, "gateway unavailable");
            Err(ProxyError::GatewayUnavailable)
        }
        Err(RelayFailure::Rejected(failure)) => Err(ProxyError::Backend(failure.to_string())),
    }
}

fn json_with_status(status: u16, body: &Value) -> HttpResponse {
    HttpResponse::build(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)).json(body)
}
