//! # Request/Response Correlator
//!
//! Pairs the one outstanding published event with the event the peer sends
//! back. The correlator is a single slot: [`Correlator::begin_wait`] arms it
//! and hands out a fresh correlation token, [`Correlator::wait`] parks the
//! message loop until the slot is released or shutdown fires, and
//! [`Correlator::signal`] (called from the inbound responder) releases it.
//!
//! ## Constraints
//!
//! - At most one request may be outstanding. Arming the slot again discards
//!   the previous expectation.
//! - A response carrying a different token still releases the waiter. The
//!   mismatch is reported so it can be logged. Supporting pipelined or
//!   multi-peer traffic would need a token → completion map instead of the
//!   single slot.
//! - Each arming is a new generation, so a release belongs to exactly one
//!   `wait` and never carries over to the next request.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::shutdown::Shutdown;

/// Handle for the single in-flight request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    generation: u64,
}

/// How a `wait` call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The response arrived and released the slot
    Released,
    /// Shutdown fired before a response arrived
    Cancelled,
    /// The slot was re-armed for a newer request while waiting
    Superseded,
}

/// What a `signal` call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    /// Released the waiter for the matching token
    Released,
    /// Released the waiter although the token differs from the one issued
    ReleasedMismatched { expected: String },
    /// Nothing was waiting (already released, or never armed)
    Ignored,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    expected: Option<String>,
    arrived: bool,
}

/// Token generator; returns the same format the responder parses back
pub fn token_for(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[derive(Debug, Default)]
pub struct Correlator {
    slot: Mutex<Slot>,
    notify: Notify,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the slot for a new request issued now.
    pub fn begin_wait(&self) -> PendingRequest {
        let issued_at = Utc::now();
        self.begin_wait_with(token_for(issued_at), issued_at)
    }

    /// Arm the slot with an explicit token.
    pub fn begin_wait_with(&self, token: String, issued_at: DateTime<Utc>) -> PendingRequest {
        let mut slot = self.slot.lock();
        slot.generation = slot.generation.wrapping_add(1);
        slot.expected = Some(token.clone());
        slot.arrived = false;
        let generation = slot.generation;
        drop(slot);
        // Wake anything still parked on an older generation
        self.notify.notify_waiters();

        PendingRequest {
            token,
            issued_at,
            generation,
        }
    }

    /// Park until `pending` is released or `shutdown` fires.
    pub async fn wait(&self, pending: &PendingRequest, shutdown: &Shutdown) -> WaitOutcome {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the slot so a concurrent signal can't slip by
            notified.as_mut().enable();

            {
                let slot = self.slot.lock();
                if slot.generation != pending.generation {
                    return WaitOutcome::Superseded;
                }
                if slot.arrived {
                    return WaitOutcome::Released;
                }
            }

            if shutdown.is_triggered() {
                return WaitOutcome::Cancelled;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = shutdown.triggered() => return WaitOutcome::Cancelled,
            }
        }
    }

    /// Release the current waiter. Never blocks.
    pub fn signal(&self, token: &str) -> SignalOutcome {
        let mut slot = self.slot.lock();
        let expected = match slot.expected.take() {
            Some(expected) if !slot.arrived => expected,
            other => {
                slot.expected = other;
                return SignalOutcome::Ignored;
            }
        };
        slot.arrived = true;
        drop(slot);
        self.notify.notify_waiters();

        if expected == token {
            SignalOutcome::Released
        } else {
            SignalOutcome::ReleasedMismatched { expected }
        }
    }

    /// Whether the current request is still waiting for its response
    pub fn is_outstanding(&self) -> bool {
        let slot = self.slot.lock();
        slot.expected.is_some() && !slot.arrived
    }
}
