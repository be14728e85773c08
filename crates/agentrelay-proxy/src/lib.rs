//! Agentrelay proxy - OpenAI-compatible front end for coding agents.
//!
//! Chat clients that only speak the OpenAI `/v1/chat/completions` API are
//! pointed at one of three backends:
//! - `claude`: runs the Claude CLI per request.
//! - `opencode`: drives an OpenCode server through its session API.
//! - `openclaw`: relays an OpenClaw gateway, injecting tool activity from its
//!   log and reconnecting across gateway restarts.

pub mod auth;
pub mod backends;
pub mod cli;
pub mod config;
pub mod error;
pub mod server;
pub mod translation;
pub mod types;

pub use config::{Backend, ProxyConfig};
pub use error::ProxyError;
pub use server::serve;
