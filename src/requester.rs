//! # Requester Loops
//!
//! Two independent loops keep exactly one request in flight each:
//!
//! - [`MethodLoop`] invokes a direct method and records the sample itself
//!   once the response comes back.
//! - [`MessageLoop`] publishes an event whose correlation token encodes the
//!   issue time, then parks on the [`Correlator`] until the inbound
//!   [`Responder`](crate::responder::Responder) has recorded the sample and
//!   released it.
//!
//! Failures are logged and the loop moves on to its next iteration. Only
//! the shutdown signal ends a loop.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::correlator::{Correlator, WaitOutcome};
use crate::sample::{Category, Sample, SampleBuffer};
use crate::shutdown::Shutdown;
use crate::transport::{EventPublisher, MethodInvoker, TimePayload, TransportError};
use crate::utils::error_chain;

/// Why a single method round-trip produced no sample
#[derive(Debug, Error)]
pub enum CallError {
    #[error("method call failed")]
    Transport(#[from] TransportError),
    #[error("method response is not a time payload")]
    Payload(#[from] serde_json::Error),
}

/// Counters kept by a loop for its final log line
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub completed: u64,
    pub failed: u64,
}

/// Drives direct method calls against the peer
pub struct MethodLoop<I: ?Sized> {
    invoker: Arc<I>,
    buffer: Arc<SampleBuffer>,
    target: String,
    method: String,
}

impl<I: MethodInvoker + ?Sized> MethodLoop<I> {
    pub fn new(
        invoker: Arc<I>,
        buffer: Arc<SampleBuffer>,
        target: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            invoker,
            buffer,
            target: target.into(),
            method: method.into(),
        }
    }

    /// One round-trip; returns the sample it pushed
    pub async fn call_once(&self) -> Result<Sample, CallError> {
        let begin = Utc::now();
        let response = self
            .invoker
            .invoke_method(&self.target, &self.method, TimePayload { utc_time: begin }.to_json())
            .await?;
        if !response.is_success() {
            return Err(TransportError::Remote {
                status: response.status,
            }
            .into());
        }
        let produced = TimePayload::from_json(&response.payload)?.utc_time;
        let end = Utc::now();

        let sample = Sample::new(Category::Method, begin, produced, end);
        self.buffer.push(sample);
        Ok(sample)
    }

    /// Call repeatedly until shutdown. An in-flight call is allowed to finish.
    pub async fn run(&self, shutdown: Shutdown) -> LoopStats {
        info!("Method loop started ({} on '{}')", self.method, self.target);
        let mut stats = LoopStats::default();

        while !shutdown.is_triggered() {
            match self.call_once().await {
                Ok(_) => stats.completed += 1,
                Err(e) => {
                    stats.failed += 1;
                    if !shutdown.is_triggered() {
                        warn!("{} on '{}' failed: {}", self.method, self.target, error_chain(&e));
                    }
                }
            }
        }

        info!(
            "Method loop stopped after {} calls ({} failed)",
            stats.completed + stats.failed,
            stats.failed
        );
        stats
    }
}

/// Drives publish/await-answer exchanges with the peer
pub struct MessageLoop<P: ?Sized> {
    publisher: Arc<P>,
    correlator: Arc<Correlator>,
    channel: String,
}

impl<P: EventPublisher + ?Sized> MessageLoop<P> {
    pub fn new(publisher: Arc<P>, correlator: Arc<Correlator>, channel: impl Into<String>) -> Self {
        Self {
            publisher,
            correlator,
            channel: channel.into(),
        }
    }

    /// Publish one request and wait for its answer or shutdown
    pub async fn exchange_once(&self, shutdown: &Shutdown) -> Result<WaitOutcome, TransportError> {
        let pending = self.correlator.begin_wait();
        let body = request_body(pending.issued_at);
        self.publisher
            .send_event(&self.channel, body, &pending.token)
            .await?;
        debug!("Published request {}", pending.token);
        Ok(self.correlator.wait(&pending, shutdown).await)
    }

    /// Exchange repeatedly until shutdown
    pub async fn run(&self, shutdown: Shutdown) -> LoopStats {
        info!("Message loop started (channel '{}')", self.channel);
        let mut stats = LoopStats::default();

        while !shutdown.is_triggered() {
            match self.exchange_once(&shutdown).await {
                Ok(WaitOutcome::Released) => stats.completed += 1,
                Ok(WaitOutcome::Cancelled) => break,
                Ok(WaitOutcome::Superseded) => {
                    warn!("Message request superseded before its answer arrived")
                }
                Err(e) => {
                    stats.failed += 1;
                    if !shutdown.is_triggered() {
                        warn!("Publishing to '{}' failed: {}", self.channel, error_chain(&e));
                    }
                }
            }
        }

        info!(
            "Message loop stopped after {} exchanges ({} failed)",
            stats.completed + stats.failed,
            stats.failed
        );
        stats
    }
}

fn request_body(issued_at: DateTime<Utc>) -> Vec<u8> {
    TimePayload {
        utc_time: issued_at,
    }
    .to_json()
}
