use clap::Parser;
use clap_derive::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tracing::{info, Level};

use tftpd::config::TftpdConfig;
use tftpd::server::TftpServer;

#[derive(Parser)]
struct Args {
    /// address to listen on for incoming requests
    #[clap(long, default_value = "0.0.0.0")]
    bind_ip: IpAddr,

    #[clap(long, default_value_t = 69)]
    port: u16,

    /// directory served as the transfer root
    #[clap(long, default_value = ".")]
    file_dir: PathBuf,

    /// accept write requests (off by default)
    #[clap(long, default_value_t = false)]
    enable_wrq: bool,

    /// number of retransmissions before a transfer is given up
    #[clap(long, default_value_t = 3)]
    retries: u32,

    /// per-attempt receive timeout in seconds
    #[clap(long, default_value_t = 5)]
    timeout: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = TftpdConfig::new(SocketAddr::new(args.bind_ip, args.port), args.file_dir);
    config.writes_enabled = args.enable_wrq;
    config.max_retries = args.retries;
    config.receive_timeout = Duration::from_secs(args.timeout);

    let server = TftpServer::new(Arc::new(config)).await?;

    select! {
        _ = server.listen() => {}
        _ = tokio::signal::ctrl_c() => {
            // in-flight sessions wind down through their own timeouts
            info!("shutting down");
        }
    }
    Ok(())
}
