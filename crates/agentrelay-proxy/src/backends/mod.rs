//! Backend adapters.
//!
//! Each adapter owns its state and registers `/v1/models` and
//! `/v1/chat/completions` on an actix service config.

pub mod claude;
pub mod openclaw;
pub mod opencode;

use crate::config::{Backend, ProxyConfig};
use actix_web::{web, HttpResponse};
use anyhow::Result;
use futures::Stream;

pub use claude::ClaudeState;
pub use openclaw::OpenClawState;
pub use opencode::OpenCodeState;

#[derive(Clone)]
pub enum BackendState {
    Claude(web::Data<ClaudeState>),
    OpenCode(web::Data<OpenCodeState>),
    OpenClaw(web::Data<OpenClawState>),
}

impl BackendState {
    pub fn build(backend: Backend, config: &ProxyConfig) -> Result<Self> {
        Ok(match backend {
            Backend::Claude => {
                BackendState::Claude(web::Data::new(ClaudeState::new(config.claude.clone())))
            }
            Backend::OpenCode => BackendState::OpenCode(web::Data::new(OpenCodeState::new(
                config.opencode.clone(),
            )?)),
            Backend::OpenClaw => BackendState::OpenClaw(web::Data::new(OpenClawState::new(
                config.openclaw.clone(),
            )?)),
        })
    }

    pub fn backend(&self) -> Backend {
        match self {
            BackendState::Claude(_) => Backend::Claude,
            BackendState::OpenCode(_) => Backend::OpenCode,
            BackendState::OpenClaw(_) => Backend::OpenClaw,
        }
    }

    pub fn configure(&self, cfg: &mut web::ServiceConfig) {
        match self {
            BackendState::Claude(state) => {
                cfg.app_data(state.clone());
                claude::routes(cfg);
            }
            BackendState::OpenCode(state) => {
                cfg.app_data(state.clone());
                opencode::routes(cfg);
            }
            BackendState::OpenClaw(state) => {
                cfg.app_data(state.clone());
                openclaw::routes(cfg);
            }
        }
    }
}

/// Wrap encoded SSE frames in a streaming response.
pub(crate) fn sse_response<S>(frames: S) -> HttpResponse
where
    S: Stream<Item = String> + 'static,
{
    use futures::StreamExt;

    let body = frames.map(|frame| Ok::<_, actix_web::Error>(web::Bytes::from(frame)));
    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("cache-control", "no-cache"))
        .streaming(body)
}
