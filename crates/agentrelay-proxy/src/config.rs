//! Configuration from agentrelay.yml and environment variables.
//!
//! Every section is optional:
//!
//! ```yaml
//! host: 0.0.0.0
//! logging:
//!   level: info
//! claude:
//!   binary: /usr/local/bin/claude
//!   working_dir: /srv/project
//! openclaw:
//!   base_url: http://127.0.0.1:18789
//!   log_dir: /tmp/openclaw
//!   relay:
//!     max_retries: 5
//! ```
//!
//! **Environment variables** (applied after the file):
//! - `CLAUDE_BIN`, `CLAUDE_CWD`, `CLAUDE_PROXY_KEY`
//! - `OPENCODE_BASE_URL`, `OPENCODE_PROXY_KEY`
//! - `OPENCLAW_BASE_URL`, `OPENCLAW_LOG_DIR`
//! - `PORT`: port of the backend being served

use crate::translation::ModelMap;
use agentrelay_relay::RelayConfig;
use agentrelay_telemetry::TelemetryConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which backend a server instance fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// Claude CLI subprocess
    Claude,
    /// OpenCode session server
    #[value(name = "opencode")]
    OpenCode,
    /// OpenClaw gateway with tool-activity relay
    #[value(name = "openclaw")]
    OpenClaw,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Backend::Claude => "claude",
            Backend::OpenCode => "opencode",
            Backend::OpenClaw => "openclaw",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub host: Option<String>,
    pub logging: TelemetryConfig,
    pub claude: ClaudeConfig,
    pub opencode: OpenCodeConfig,
    pub openclaw: OpenClawConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaudeConfig {
    pub port: u16,
    pub binary: String,
    /// Directory the CLI runs in. Defaults to the proxy's own.
    pub working_dir: Option<PathBuf>,
    /// Bearer token clients must present. Empty disables auth.
    pub api_key: String,
    pub models: ModelMap,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            port: 18792,
            binary: "claude".to_string(),
            working_dir: None,
            api_key: String::new(),
            models: ModelMap::claude(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenCodeConfig {
    pub port: u16,
    pub base_url: String,
    pub api_key: String,
    pub request_timeout_secs: u64,
    pub models: ModelMap,
}

impl Default for OpenCodeConfig {
    fn default() -> Self {
        Self {
            port: 18791,
            base_url: "http://localhost:4096".to_string(),
            api_key: String::new(),
            request_timeout_secs: 300,
            models: ModelMap::opencode(),
        }
    }
}

impl OpenCodeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenClawConfig {
    pub port: u16,
    pub base_url: String,
    pub log_dir: PathBuf,
    /// Log files are named `<prefix><date>.log`.
    pub log_prefix: String,
    /// Timeout of the `/v1/models` passthrough.
    pub models_timeout_secs: u64,
    pub relay: RelayConfig,
}

impl Default for OpenClawConfig {
    fn default() -> Self {
        Self {
            port: 18793,
            base_url: "http://127.0.0.1:18789".to_string(),
            log_dir: PathBuf::from("/tmp/openclaw"),
            log_prefix: "openclaw-".to_string(),
            models_timeout_secs: 30,
            relay: RelayConfig::default(),
        }
    }
}

impl OpenClawConfig {
    pub fn models_timeout(&self) -> Duration {
        Duration::from_secs(self.models_timeout_secs)
    }
}

impl ProxyConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("Failed to parse config at {:?}", path))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml_ng::from_str(content)?)
    }

    /// Resolve and load the configuration for `backend`.
    ///
    /// An explicit path must exist. Otherwise `$AGENTRELAY_CONFIG`, then
    /// `<config dir>/agentrelay/agentrelay.yml` are tried; with neither
    /// present the defaults apply. Environment overrides come last.
    pub fn load(explicit: Option<&Path>, backend: Backend) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_yaml_file(path)?,
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::from_yaml_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(backend, |key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, backend: Backend, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = var("CLAUDE_BIN") {
            self.claude.binary = v;
        }
        if let Some(v) = var("CLAUDE_CWD") {
            self.claude.working_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("CLAUDE_PROXY_KEY") {
            self.claude.api_key = v;
        }
        if let Some(v) = var("OPENCODE_BASE_URL") {
            self.opencode.base_url = v;
        }
        if let Some(v) = var("OPENCODE_PROXY_KEY") {
            self.opencode.api_key = v;
        }
        if let Some(v) = var("OPENCLAW_BASE_URL") {
            self.openclaw.base_url = v;
        }
        if let Some(v) = var("OPENCLAW_LOG_DIR") {
            self.openclaw.log_dir = PathBuf::from(v);
        }
        if let Some(port) = var("PORT").and_then(|p| p.parse().ok()) {
            self.set_port(backend, port);
        }
    }

    pub fn port(&self, backend: Backend) -> u16 {
        match backend {
            Backend::Claude => self.claude.port,
            Backend::OpenCode => self.opencode.port,
            Backend::OpenClaw => self.openclaw.port,
        }
    }

    pub fn set_port(&mut self, backend: Backend, port: u16) {
        match backend {
            Backend::Claude => self.claude.port = port,
            Backend::OpenCode => self.opencode.port = port,
            Backend::OpenClaw => self.openclaw.port = port,
        }
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("0.0.0.0")
    }
}

fn default_config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("AGENTRELAY_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("agentrelay").join("agentrelay.yml"))
}
