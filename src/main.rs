//! funnel client: forwards local endpoints through a funnel server.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use funnel::carrier::{passthrough_handshake, TcpConnector};
use funnel::session::{Client, ClientConfig, Status};
use funnel::user_services::{
    DatagramForward, RemoteDatagramForward, RemoteShell, RemoteSocks, RemoteStreamForward, Shell,
    Socks, StreamForward, UserService,
};
use funnel::Config;

/// Default carrier port of a funnel server.
const DEFAULT_PORT: u16 = 8011;

#[derive(Parser, Debug)]
#[command(name = "funnel", version, about = "Socket funnelling client")]
struct Cli {
    /// Server host to connect the carrier to.
    host: String,

    /// Server carrier port.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Stream forward: [bind:]port:host:rport (local listen, remote
    /// connect).
    #[arg(short = 'L', value_name = "FORWARD")]
    stream_forwards: Vec<String>,

    /// Reverse stream forward: [bind:]port:host:rport.
    #[arg(short = 'R', value_name = "FORWARD")]
    remote_stream_forwards: Vec<String>,

    /// Datagram forward: [bind:]port:host:rport.
    #[arg(short = 'U', value_name = "FORWARD")]
    datagram_forwards: Vec<String>,

    /// Reverse datagram forward: [bind:]port:host:rport.
    #[arg(short = 'V', value_name = "FORWARD")]
    remote_datagram_forwards: Vec<String>,

    /// SOCKS server exposed locally: [bind:]port.
    #[arg(short = 'D', value_name = "LISTEN")]
    socks: Vec<String>,

    /// SOCKS server exposed remotely: [bind:]port.
    #[arg(short = 'F', value_name = "LISTEN")]
    remote_socks: Vec<String>,

    /// Shell server exposed locally: [bind:]port.
    #[arg(short = 'X', value_name = "LISTEN")]
    shells: Vec<String>,

    /// Shell server exposed remotely: [bind:]port.
    #[arg(short = 'Y', value_name = "LISTEN")]
    remote_shells: Vec<String>,

    /// Maximum carrier connection attempts.
    #[arg(short = 'm', long, default_value_t = 1)]
    max_attempts: u32,

    /// Seconds between connection attempts.
    #[arg(long, default_value_t = 10)]
    reconnect_delay: u64,

    /// Disable reconnection entirely.
    #[arg(long)]
    no_reconnection: bool,

    /// Configuration file path.
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn build_user_services(cli: &Cli) -> Result<Vec<Arc<dyn UserService>>> {
    let mut services: Vec<Arc<dyn UserService>> = Vec::new();
    for option in &cli.stream_forwards {
        services.push(StreamForward::parse(option).context("invalid -L option")?);
    }
    for option in &cli.remote_stream_forwards {
        services.push(RemoteStreamForward::parse(option).context("invalid -R option")?);
    }
    for option in &cli.datagram_forwards {
        services.push(DatagramForward::parse(option).context("invalid -U option")?);
    }
    for option in &cli.remote_datagram_forwards {
        services.push(RemoteDatagramForward::parse(option).context("invalid -V option")?);
    }
    for option in &cli.socks {
        services.push(Socks::parse(option).context("invalid -D option")?);
    }
    for option in &cli.remote_socks {
        services.push(RemoteSocks::parse(option).context("invalid -F option")?);
    }
    for option in &cli.shells {
        services.push(Shell::parse(option).context("invalid -X option")?);
    }
    for option in &cli.remote_shells {
        services.push(RemoteShell::parse(option).context("invalid -Y option")?);
    }
    Ok(services)
}

fn run() -> Result<bool> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let user_services = build_user_services(&cli)?;

    let runtime = tokio::runtime::Runtime::new().context("cannot start runtime")?;
    runtime.block_on(async move {
        let connector = Arc::new(TcpConnector::new(cli.host.clone(), cli.port));
        let client = Client::new(
            connector,
            passthrough_handshake(),
            ClientConfig {
                max_attempts: cli.max_attempts,
                reconnect_delay: Duration::from_secs(cli.reconnect_delay),
                no_reconnection: cli.no_reconnection,
                ..ClientConfig::default()
            },
            config.services,
            user_services,
            Arc::new(|status: Status| info!("[client] status: {status}")),
            Arc::new(|name: &str, result: funnel::Result<()>| match result {
                Ok(()) => info!("[client] service <{name}> OK"),
                Err(e) => log::error!("[client] service <{name}> KO: {e}"),
            }),
        );

        client.run();

        let waiter = Arc::clone(&client);
        tokio::select! {
            () = waiter.wait_stop() => Ok(client.reached_running()),
            result = tokio::signal::ctrl_c() => {
                result.context("cannot wait for interrupt")?;
                info!("[client] interrupted, stopping");
                // User cancel is a clean stop whatever the session did.
                client.stop().await;
                Ok(true)
            }
        }
    })
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run() {
        // Clean stop (or user cancel) exits 0; a session that never ran
        // is a startup failure.
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("funnel: {e:#}");
            std::process::exit(1);
        }
    }
}
