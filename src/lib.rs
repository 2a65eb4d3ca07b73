//! # Edge Latency Library
//!
//! Continuously measures round-trip latency between this process and a
//! cooperating peer using two request patterns side by side:
//!
//! - **Direct method calls**: request/response RPC answered with the peer's
//!   current time
//! - **Messages**: a published event answered by an event from the peer,
//!   matched back to its request by a correlation token
//!
//! Every completed round-trip becomes a [`Sample`] of three timestamps
//! (`begin`, `produced`, `end`). An aggregator periodically drains the
//! samples and logs min/max/average per latency phase, percentiles and an
//! optional histogram.
//!
//! ## Architecture Overview
//!
//! - `requester`: the method loop and the message loop, one request in flight each
//! - `responder`: inbound event callback that records message samples
//! - `correlator`: single-slot pairing of the in-flight message with its answer
//! - `sample`: sample type and the lock-free sample buffer
//! - `metrics`: window statistics and report rendering
//! - `shutdown`: the shared cancellation signal
//! - `transport`: capability traits and the TCP implementation
//! - `monitor`: wires the above together for the consumer side
//! - `peer`: the producer side answering time requests
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use edge_latency::{run_monitor, MonitorConfig, MonitorContext, Shutdown, TcpTransport};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let shutdown = Shutdown::new();
//!     shutdown.listen_for_interrupt();
//!
//!     let config = MonitorConfig::default();
//!     let transport = TcpTransport::open(&config.transport_config(), shutdown.clone()).await?;
//!     let context = MonitorContext::new(config, shutdown);
//!     let summary = run_monitor(&context, Arc::new(transport)).await?;
//!
//!     println!("{} samples recorded", summary.samples_recorded);
//!     Ok(())
//! }
//! ```

/// Command-line arguments and the validated monitor configuration
pub mod cli;

/// Pairing of the outstanding message request with its answer
pub mod correlator;

/// Subscriber setup with coloured console output and optional file logging
pub mod logging;

/// Window statistics, histograms and the periodic aggregator
pub mod metrics;

/// Consumer-side orchestration of loops, responder and aggregator
pub mod monitor;

/// Producer-side server answering time requests
pub mod peer;

/// Method and message requester loops
pub mod requester;

/// Inbound message callback recording message samples
pub mod responder;

pub mod sample;

pub mod shutdown;

/// Transport capabilities and the TCP implementation
///
/// The core only depends on the capability traits, so loops and the
/// responder can be exercised against in-memory doubles. Features:
/// - Length-prefixed bincode framing
/// - Method calls matched to responses by request id
/// - Per-channel inbound event handlers
pub mod transport;

pub mod utils;

pub use cli::{Args, Mode, MonitorConfig};
pub use correlator::Correlator;
pub use metrics::{AggregateWindow, Aggregator};
pub use monitor::{run_monitor, MonitorContext, MonitorSummary};
pub use peer::{PeerIdentity, PeerServer};
pub use sample::{Category, Sample, SampleBuffer};
pub use shutdown::{Shutdown, ShutdownReason};
pub use transport::{TcpTransport, Transport, TransportError};

/// The current version of the monitor
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// Used by the command line when an option is not given, and by the
/// `Default` impls of the configuration types.
pub mod defaults {
    use std::time::Duration;

    /// Peer host the consumer connects to and the producer binds
    pub const HOST: &str = "127.0.0.1";

    pub const PORT: u16 = 8080;

    /// Time allowed for establishing the connection
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Upper bound for one method call, after which the method loop moves on
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

    /// How often statistics are computed and printed
    pub const AGGREGATION_INTERVAL: Duration = Duration::from_secs(60);

    /// Name the producer answers to
    pub const TARGET: &str = "producer";

    pub const METHOD_NAME: &str = "GetTimeMethod";

    pub const MESSAGE_CHANNEL: &str = "GetTimeMessage";
}
