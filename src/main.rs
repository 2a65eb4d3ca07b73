//! # Edge Latency - Main Entry Point
//!
//! One binary, two roles:
//!
//! - **consumer** (default): connects to the peer, runs the method and
//!   message loops plus the aggregator, and logs latency statistics every
//!   interval until interrupted or the connection drops
//! - **producer**: listens for consumers and answers their time requests
//!
//! ## Error Handling
//!
//! Only startup failures end the process with an error: invalid
//! configuration, a subscriber that cannot be installed, a transport that
//! cannot be opened or a port that cannot be bound. Failures while running
//! are logged by the loops and never stop the process on their own.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use edge_latency::{
    cli::{Args, Mode, MonitorConfig},
    logging::init_logging,
    monitor::{run_monitor, MonitorContext},
    peer::{PeerIdentity, PeerServer},
    shutdown::Shutdown,
    transport::TcpTransport,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Held until exit so buffered file output is flushed
    let _log_guard = init_logging(args.log_dir.as_deref())?;

    info!("Starting Edge Latency {} ({})", edge_latency::VERSION, args.mode);
    info!("Configuration: {:?}", args);

    let shutdown = Shutdown::new();
    let interrupt_listener = shutdown.listen_for_interrupt();

    let result = match args.mode {
        Mode::Consumer => run_consumer(&args, shutdown).await,
        Mode::Producer => run_producer(&args, shutdown).await,
    };

    interrupt_listener.abort();
    result
}

async fn run_consumer(args: &Args, shutdown: Shutdown) -> Result<()> {
    let config = MonitorConfig::from_args(args)?;

    let transport = TcpTransport::open(&config.transport_config(), shutdown.clone())
        .await
        .with_context(|| format!("failed to connect to {}:{}", config.host, config.port))?;

    let context = MonitorContext::new(config, shutdown);
    run_monitor(&context, Arc::new(transport)).await?;
    Ok(())
}

async fn run_producer(args: &Args, shutdown: Shutdown) -> Result<()> {
    let identity = PeerIdentity {
        name: args.target.clone(),
        method: args.method_name.clone(),
        channel: args.channel.clone(),
    };
    let addr = format!("{}:{}", args.host, args.port);

    let server = PeerServer::bind(&addr, identity).await?;
    server.serve(shutdown).await
}
