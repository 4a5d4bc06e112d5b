//! funneld: the accepting side of funnel sessions.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use funnel::carrier::passthrough_handshake;
use funnel::session::{Server, ServerConfig};
use funnel::Config;

/// Default carrier port.
const DEFAULT_PORT: u16 = 8011;

#[derive(Parser, Debug)]
#[command(name = "funneld", version, about = "Socket funnelling server")]
struct Cli {
    /// Address to bind the carrier endpoint on.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Carrier port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Relay-only mode: reject direct connections.
    #[arg(short = 'R', long)]
    relay_only: bool,

    /// Configuration file path.
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let runtime = tokio::runtime::Runtime::new().context("cannot start runtime")?;
    runtime.block_on(async move {
        let server = Server::new(
            ServerConfig {
                relay_only: cli.relay_only || config.relay_only,
                ..ServerConfig::default()
            },
            config.services,
            passthrough_handshake(),
        );
        server.run(&cli.host, cli.port).await?;

        tokio::signal::ctrl_c()
            .await
            .context("cannot wait for interrupt")?;
        info!("[server] interrupted, stopping");
        server.stop().await;
        Ok(())
    })
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run() {
        eprintln!("funneld: {e:#}");
        std::process::exit(1);
    }
}
