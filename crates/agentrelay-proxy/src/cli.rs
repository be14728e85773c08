//! CLI arguments

use crate::config::Backend;
use clap::Parser;
use std::path::PathBuf;

/// Agentrelay - OpenAI-compatible proxy for coding agents
#[derive(Parser, Debug)]
#[command(name = "agentrelay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Backend to serve
    #[arg(value_enum)]
    pub backend: Backend,

    /// Config file (default: $AGENTRELAY_CONFIG or <config dir>/agentrelay/agentrelay.yml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind, overriding config and $PORT
    #[arg(short, long)]
    pub port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backend_and_overrides() {
        let cli = Cli::try_parse_from([
            "agentrelay",
            "openclaw",
            "--port",
            "9001",
            "--config",
            "/etc/agentrelay.yml",
        ])
        .unwrap();
        assert_eq!(cli.backend, Backend::OpenClaw);
        assert_eq!(cli.port, Some(9001));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/agentrelay.yml")));
        assert_eq!(cli.host, None);
    }

    #[test]
    fn test_backend_names() {
        for (name, backend) in [
            ("claude", Backend::Claude),
            ("opencode", Backend::OpenCode),
            ("openclaw", Backend::OpenClaw),
        ] {
            let cli = Cli::try_parse_from(["agentrelay", name]).unwrap();
            assert_eq!(cli.backend, backend);
        }
        assert!(Cli::try_parse_from(["agentrelay", "litellm"]).is_err());
        assert!(Cli::try_parse_from(["agentrelay"]).is_err());
    }
}
