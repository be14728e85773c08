//! `agentrelay` binary entrypoint.

use agentrelay_proxy::cli::Cli;
use agentrelay_proxy::{serve, ProxyConfig};
use anyhow::Context;
use clap::Parser;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ProxyConfig::load(cli.config.as_deref(), cli.backend)?;
    if let Some(host) = cli.host {
        config.host = Some(host);
    }
    if let Some(port) = cli.port {
        config.set_port(cli.backend, port);
    }

    agentrelay_telemetry::init_subscriber(&config.logging)
        .context("failed to initialise logging")?;

    serve(config, cli.backend).await
}
