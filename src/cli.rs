use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::sample::Category;
use crate::transport::tcp::TransportConfig;

/// Edge Latency - round-trip latency monitor for method calls and messages
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Which side of the exchange to run
    #[clap(long, value_enum, default_value_t = Mode::Consumer, env = "EDGE_LATENCY_MODE", help_heading = "Core Options")]
    pub mode: Mode,

    /// Peer host (consumer) or bind address (producer)
    #[clap(long, default_value = crate::defaults::HOST, env = "EDGE_LATENCY_HOST")]
    pub host: String,

    /// Peer port (consumer) or listen port (producer)
    #[clap(short = 'p', long, default_value_t = crate::defaults::PORT, env = "EDGE_LATENCY_PORT")]
    pub port: u16,

    /// Measure direct method calls
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set, env = "EDGE_LATENCY_METHOD")]
    pub method: bool,

    /// Measure published messages
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set, env = "EDGE_LATENCY_MESSAGE")]
    pub message: bool,

    /// Print a histogram of total latency with each report
    #[clap(long, default_value_t = false, action = clap::ArgAction::Set, env = "EDGE_LATENCY_HISTOGRAM")]
    pub histogram: bool,

    /// How often statistics are printed (e.g. "30s", "1m")
    #[clap(short = 'i', long, value_parser = parse_duration, default_value = "1m", env = "EDGE_LATENCY_INTERVAL")]
    pub interval: Duration,

    /// Name of the peer the method is invoked on
    #[clap(long, default_value = crate::defaults::TARGET, env = "EDGE_LATENCY_TARGET")]
    pub target: String,

    /// Method invoked for the method measurement
    #[clap(long, default_value = crate::defaults::METHOD_NAME, env = "EDGE_LATENCY_METHOD_NAME")]
    pub method_name: String,

    /// Channel used for the message measurement
    #[clap(long, default_value = crate::defaults::MESSAGE_CHANNEL, env = "EDGE_LATENCY_CHANNEL")]
    pub channel: String,

    /// Time allowed for connecting to the peer
    #[clap(long, value_parser = parse_duration, default_value = "10s", env = "EDGE_LATENCY_CONNECT_TIMEOUT")]
    pub connect_timeout: Duration,

    /// Time allowed for a single method call
    #[clap(long, value_parser = parse_duration, default_value = "30s", env = "EDGE_LATENCY_CALL_TIMEOUT")]
    pub call_timeout: Duration,

    /// Also write logs to daily-rolling files in this directory
    #[clap(long, env = "EDGE_LATENCY_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

/// Which side of the exchange this process plays
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum Mode {
    /// Issue requests and measure their latency
    #[clap(name = "consumer")]
    Consumer,

    /// Answer requests with the current time
    #[clap(name = "producer")]
    Producer,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Consumer => write!(f, "consumer"),
            Mode::Producer => write!(f, "producer"),
        }
    }
}

/// Validated settings for the measuring side
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub method_enabled: bool,
    pub message_enabled: bool,
    pub histogram_enabled: bool,
    pub interval: Duration,
    pub target: String,
    pub method_name: String,
    pub channel: String,
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            method_enabled: true,
            message_enabled: true,
            histogram_enabled: false,
            interval: crate::defaults::AGGREGATION_INTERVAL,
            target: crate::defaults::TARGET.to_string(),
            method_name: crate::defaults::METHOD_NAME.to_string(),
            channel: crate::defaults::MESSAGE_CHANNEL.to_string(),
            host: crate::defaults::HOST.to_string(),
            port: crate::defaults::PORT,
            connect_timeout: crate::defaults::CONNECT_TIMEOUT,
            call_timeout: crate::defaults::CALL_TIMEOUT,
        }
    }
}

impl MonitorConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        let config = Self {
            method_enabled: args.method,
            message_enabled: args.message,
            histogram_enabled: args.histogram,
            interval: args.interval,
            target: args.target.clone(),
            method_name: args.method_name.clone(),
            channel: args.channel.clone(),
            host: args.host.clone(),
            port: args.port,
            connect_timeout: args.connect_timeout,
            call_timeout: args.call_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            bail!("aggregation interval must be greater than zero");
        }
        if self.call_timeout.is_zero() {
            bail!("call timeout must be greater than zero");
        }
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must be greater than zero");
        }
        if !self.method_enabled && !self.message_enabled {
            bail!("at least one of method or message measurement must be enabled");
        }
        if self.method_enabled && self.method_name.trim().is_empty() {
            bail!("method name must not be empty");
        }
        if self.message_enabled && self.channel.trim().is_empty() {
            bail!("message channel must not be empty");
        }
        Ok(())
    }

    /// Categories that are measured and reported
    pub fn categories(&self) -> Vec<Category> {
        Category::ALL
            .into_iter()
            .filter(|c| match c {
                Category::Method => self.method_enabled,
                Category::Message => self.message_enabled,
            })
            .collect()
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            host: self.host.clone(),
            port: self.port,
            connect_timeout: self.connect_timeout,
            call_timeout: self.call_timeout,
            ..Default::default()
        }
    }
}

/// Parse duration from string (e.g., "10s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let secs = match unit {
        "ms" => num / 1_000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Duration::try_from_secs_f64(secs).map_err(|_| format!("Duration is out of range: {}", s))
}
