// Command-line front end: loads the payload file, binds the listen address and serves until
// Ctrl-C. Set RUST_LOG to control verbosity.

use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use payload_tftpd::config::{self, ServerConfig};
use payload_tftpd::shutdown::{self, ShutdownTrigger};
use payload_tftpd::Server;

/// Read-only TFTP server that sends the same file to every client.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:69")]
    address: SocketAddr,

    /// File to serve to clients.
    #[arg(short, long, default_value = "payload.svg")]
    payload: PathBuf,

    /// Times each block is sent before a transfer is abandoned [default: 10].
    #[arg(short, long)]
    retries: Option<u8>,

    /// Milliseconds to wait for each acknowledgment [default: 6000].
    #[arg(short, long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Local ports used for transfers, as LOW-HIGH. The OS picks when unset.
    #[arg(long, value_parser = config::parse_port_range)]
    port_range: Option<RangeInclusive<u16>>,
}

async fn shutdown_on_ctrl_c(trigger: ShutdownTrigger) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            log::info!("Ctrl-C received");
            trigger.shutdown();
        }
        Err(e) => {
            log::error!("Couldn't listen for Ctrl-C, shutdown must be forced: {e}");
            // Dropping the trigger would stop the server.
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let payload = config::load_payload(&cli.payload)
        .with_context(|| format!("reading payload {}", cli.payload.display()))?;

    let server = Server::new(ServerConfig {
        payload: Some(payload),
        retries: cli.retries,
        timeout: cli.timeout_ms.map(Duration::from_millis),
        transfer_ports: cli.port_range,
    })
    .context("invalid configuration")?;

    let settings = server.settings();
    log::info!(
        "Serving {} ({} bytes), {} tries per block, {:?} timeout",
        cli.payload.display(),
        settings.payload.len(),
        settings.retries,
        settings.timeout
    );

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(shutdown_on_ctrl_c(trigger));

    server
        .listen_and_serve(cli.address, shutdown)
        .await
        .with_context(|| format!("serving on {}", cli.address))?;

    Ok(())
}
