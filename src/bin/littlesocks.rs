use anyhow::{Result, bail};
use clap::Parser;
use littlesocks::config::{DEFAULT_LISTEN_ADDR, Config};
use littlesocks::{Socks5Server, UserPass};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "littlesocks", author, version, about = "A small SOCKS5 proxy server", long_about = None)]
struct Args {
    /// Address to bind the SOCKS5 server (host:port)
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    addr: String,

    /// Username for SOCKS5 proxy
    #[arg(short, long)]
    username: Option<String>,

    /// Password for SOCKS5 proxy
    #[arg(short, long)]
    password: Option<String>,

    /// Seconds allowed to resolve and connect to a target
    #[arg(long, default_value_t = 10)]
    dial_timeout: u64,

    /// Seconds a connection may stay idle at any stage
    #[arg(long, default_value_t = 120)]
    idle_timeout: u64,

    /// Seconds BIND waits for the incoming connection
    #[arg(long, default_value_t = 60)]
    bind_timeout: u64,

    /// Enable the BIND command
    #[arg(long)]
    allow_bind: bool,

    /// Disable the UDP ASSOCIATE command
    #[arg(long)]
    no_udp: bool,

    /// Maximum number of concurrent client connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    // Check for auth and grab it if present
    let auth = match (args.username, args.password) {
        (Some(u), Some(p)) => {
            info!("Authentication enabled");
            Some(UserPass::new(u, p))
        }
        (None, None) => None,
        _ => bail!("[ERR] must provide both username and password (or neither)"),
    };

    // Build engine configuration from flags
    let config = Config::new(args.addr)
        .with_auth(auth)
        .with_dial_timeout(Duration::from_secs(args.dial_timeout))
        .with_idle_timeout(Duration::from_secs(args.idle_timeout))
        .with_bind_timeout(Duration::from_secs(args.bind_timeout))
        .with_bind(args.allow_bind)
        .with_udp_associate(!args.no_udp)
        .with_max_connections(args.max_connections);

    // Instantiate server
    let mut server = Socks5Server::new(config);

    // DEBUG
    info!("Starting SOCKS5 proxy server on {}", server.config().listen_addr);

    // Failures below are logged here, the exit code carries the rest
    if let Err(e) = server.bind().await {
        error!("Failed to create SOCKS5 server: {e:#}");
        return Ok(ExitCode::FAILURE);
    }

    // Run it until signalled
    if let Err(e) = server.run_until(shutdown_signal()).await {
        error!("Server error: {e:#}");
        return Ok(ExitCode::FAILURE);
    }

    Ok(ExitCode::SUCCESS)
}

/// shutdown_signal resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received signal SIGINT, shutting down gracefully..."),
                    _ = term.recv() => info!("Received signal SIGTERM, shutting down gracefully..."),
                }
                return;
            }
            Err(e) => warn!("SIGTERM handler unavailable: {e}"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received signal SIGINT, shutting down gracefully..."),
        Err(e) => {
            // Without a signal handler the server runs until killed
            error!("failed to listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
    }
}
