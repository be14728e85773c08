//! Actix Web HTTP server.
//!
//! One server per backend. Every server exposes:
//! - `GET /health`
//! - `GET /v1/models`
//! - `POST /v1/chat/completions`

use crate::backends::BackendState;
use crate::config::{Backend, ProxyConfig};
use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer};
use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

pub async fn serve(config: ProxyConfig, backend: Backend) -> Result<()> {
    let addr = format!("{}:{}", config.host(), config.port(backend));
    let state = BackendState::build(backend, &config)
        .with_context(|| format!("failed to set up {} backend", backend.name()))?;
    info!(addr = %addr, backend = backend.name(), "agentrelay listening");

    HttpServer::new(move || {
        let state = state.clone();
        App::new()
            .wrap(Cors::permissive())
            .configure(move |cfg| configure_app(&state, cfg))
    })
    .bind(&addr)
    .with_context(|| format!("failed to bind {}", addr))?
    .run()
    .await
    .context("server error")?;

    Ok(())
}

/// Register every route of `state`'s backend.
pub fn configure_app(state: &BackendState, cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check));
    state.configure(cfg);
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}
