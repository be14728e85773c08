//! OpenCode backend.
//!
//! OpenCode's server is session based, so each chat completion:
//! 1. `PATCH /config` selects the model,
//! 2. `POST /session` opens a fresh session,
//! 3. `POST /session/{id}/message` sends the newest user message and blocks
//!    until the answer is complete.
//!
//! Streaming clients receive the finished answer replayed word by word.

use super::sse_response;
use crate::auth;
use crate::config::OpenCodeConfig;
use crate::error::ProxyError;
use crate::translation::last_user_message;
use crate::types::ChatRequest;
use actix_web::{web, HttpRequest, HttpResponse};
use agentrelay_relay::types::{new_completion_id, unix_now, ChatCompletion, CompletionUsage, ModelList};
use agentrelay_relay::{encode_stream, ChunkEncoder, OutputDelta};
use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::{debug, warn};

const DEFAULT_MODEL: &str = "opencode";
const OWNED_BY: &str = "opencode";

pub struct OpenCodeState {
    config: OpenCodeConfig,
    client: reqwest::Client,
}

impl OpenCodeState {
    pub fn new(config: OpenCodeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Run one prompt through a fresh OpenCode session and return its text.
    pub async fn ask(&self, model: &str, message: &str) -> Result<String, ProxyError> {
        let target = self.config.models.resolve(model);
        match self
            .client
            .patch(self.url("/config"))
            .json(&json!({ "model": target }))
            .send()
            .await
        {
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = %resp.status(), model = target, "opencode rejected model switch");
            }
            Err(e) => warn!(error = %e, "opencode model switch failed"),
            Ok(_) => {}
        }

        let session = self
            .client
            .post(self.url("/session"))
            .json(&json!({}))
            .send()
            .await
            .map_err(request_failed)?;
        if session.status().as_u16() != 200 {
            let text = session.text().await.unwrap_or_default();
            return Err(ProxyError::Backend(format!(
                "Failed to create OpenCode session: {}",
                text
            )));
        }
        let session: Value = session.json().await.map_err(request_failed)?;
        let session_id = session
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProxyError::Backend("No session ID returned".to_string()))?;
        debug!(session_id, model = target, "opencode session created");

        let reply = self
            .client
            .post(self.url(&format!("/session/{}/message", session_id)))
            .json(&json!({ "parts": [{ "type": "text", "text": message }] }))
            .send()
            .await
            .map_err(request_failed)?;
        if reply.status().as_u16() != 200 {
            let text = reply.text().await.unwrap_or_default();
            return Err(ProxyError::Backend(format!(
                "Failed to send message to OpenCode: {}",
                text
            )));
        }
        let reply: Value = reply.json().await.map_err(request_failed)?;
        Ok(assistant_text(&reply))
    }
}

fn request_failed(e: reqwest::Error) -> ProxyError {
    ProxyError::Backend(format!("OpenCode request failed: {}", e))
}

/// Answer text of a message reply, or a placeholder explaining its absence.
pub fn assistant_text(reply: &Value) -> String {
    let text = reply
        .get("parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n")
        })
        .unwrap_or_default();
    if !text.is_empty() {
        return text;
    }

    match reply.get("info").and_then(|info| info.get("error")) {
        Some(Value::Null) | None => "(No response from OpenCode)".to_string(),
        Some(Value::String(error)) => format!("(OpenCode error: {})", error),
        Some(error) => format!("(OpenCode error: {})", error),
    }
}

/// Replay finished text as one content delta per word.
pub fn word_deltas(text: &str) -> Vec<OutputDelta> {
    std::iter::once(OutputDelta::Role)
        .chain(
            text.split_whitespace()
                .map(|word| OutputDelta::Content(format!("{} ", word))),
        )
        .chain(std::iter::once(OutputDelta::Stop))
        .collect()
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/v1/models", web::get().to(list_models))
        .route("/v1/chat/completions", web::post().to(chat_completions));
}

async fn list_models(
    state: web::Data<OpenCodeState>,
    req: HttpRequest,
) -> Result<HttpResponse, ProxyError> {
    auth::authorize(&req, &state.config.api_key)?;
    let list = ModelList::new(state.config.models.public_ids(), unix_now(), OWNED_BY);
    Ok(HttpResponse::Ok().json(list))
}

async fn chat_completions(
    state: web::Data<OpenCodeState>,
    req: HttpRequest,
    body: web::Json<ChatRequest>,
) -> Result<HttpResponse, ProxyError> {
    auth::authorize(&req, &state.config.api_key)?;

    let body = body.into_inner();
    let message = last_user_message(&body.messages)
        .ok_or_else(|| ProxyError::BadRequest("No user message found".to_string()))?;
    let model = body.model_or(DEFAULT_MODEL).to_string();

    let text = state.ask(&model, &message).await?;

    if body.stream {
        let encoder = ChunkEncoder::for_model(model);
        let deltas = futures::stream::iter(word_deltas(&text));
        return Ok(sse_response(encode_stream(encoder, deltas)));
    }

    let completion = ChatCompletion::assistant(
        new_completion_id(),
        unix_now(),
        model,
        text,
        CompletionUsage::default(),
    );
    Ok(HttpResponse::Ok().json(completion))
}
