//! Process-wide, one-shot shutdown signal shared by every loop.
//!
//! Wraps a [`CancellationToken`]: once triggered it stays triggered. Blocking
//! waits select on [`Shutdown::triggered`] so they wake as soon as the signal
//! fires instead of at the next poll.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Where a shutdown request came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl-C / SIGINT delivered to the process
    Interrupt,
    /// The underlying connection went away
    TransportClosed,
    /// Requested programmatically
    Requested(String),
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Interrupt => write!(f, "interrupt received"),
            ShutdownReason::TransportClosed => write!(f, "transport closed"),
            ShutdownReason::Requested(why) => write!(f, "requested: {}", why),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Only the first call records a reason.
    pub fn trigger(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock();
            if slot.is_some() {
                debug!("Shutdown already in progress, ignoring: {}", reason);
                return;
            }
            info!("Shutting down ({})", reason);
            *slot = Some(reason);
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal has fired (immediately if it already has)
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().clone()
    }

    /// Trigger on the first Ctrl-C. The listener stops once shutdown happens
    /// for any other reason.
    pub fn listen_for_interrupt(&self) -> tokio::task::JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => shutdown.trigger(ShutdownReason::Interrupt),
                    Err(e) => tracing::warn!("Unable to listen for interrupt: {}", e),
                },
                _ = shutdown.triggered() => {}
            }
        })
    }
}
