//! # Producer Peer
//!
//! The cooperating side of a measurement. [`PeerServer`] accepts consumer
//! connections and answers both request patterns with its current UTC time:
//!
//! - a `MethodRequest` for `GetTimeMethod` addressed to this peer gets a
//!   `200` response carrying `{"UtcTime": ...}`,
//! - an event on `GetTimeMessage` gets an event back on the same channel
//!   with the same correlation token.
//!
//! Each connection is served by its own task and ends when the consumer
//! hangs up or the shutdown signal fires.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::shutdown::Shutdown;
use crate::transport::tcp::{configure_socket, read_frame, write_frame};
use crate::transport::{
    Frame, TimePayload, TransportError, STATUS_NOT_FOUND, STATUS_NOT_IMPLEMENTED, STATUS_OK,
};
use crate::utils::{error_chain, format_latency_f64};

/// What this peer answers to
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub name: String,
    pub method: String,
    pub channel: String,
}

impl Default for PeerIdentity {
    fn default() -> Self {
        Self {
            name: crate::defaults::TARGET.to_string(),
            method: crate::defaults::METHOD_NAME.to_string(),
            channel: crate::defaults::MESSAGE_CHANNEL.to_string(),
        }
    }
}

impl PeerIdentity {
    /// Build the reply for one inbound frame, if it warrants one
    pub fn answer(&self, frame: Frame) -> Option<Frame> {
        match frame {
            Frame::MethodRequest {
                request_id,
                target,
                method,
                ..
            } => {
                let (status, payload) = if target != self.name {
                    debug!("Method call for unknown target '{}'", target);
                    (STATUS_NOT_FOUND, Vec::new())
                } else if method != self.method {
                    debug!("Method '{}' is not implemented", method);
                    (STATUS_NOT_IMPLEMENTED, Vec::new())
                } else {
                    (STATUS_OK, TimePayload::now().to_json())
                };
                Some(Frame::MethodResponse {
                    request_id,
                    status,
                    payload,
                })
            }
            Frame::Event {
                channel,
                correlation_id,
                ..
            } if channel == self.channel => Some(Frame::Event {
                channel,
                correlation_id,
                body: TimePayload::now().to_json(),
            }),
            Frame::Event { channel, .. } => {
                debug!("Ignoring event on channel '{}'", channel);
                None
            }
            Frame::MethodResponse { request_id, .. } => {
                warn!("Ignoring unexpected method response {}", request_id);
                None
            }
        }
    }
}

/// TCP server answering time requests
pub struct PeerServer {
    listener: TcpListener,
    identity: Arc<PeerIdentity>,
    buffer_size: usize,
}

impl PeerServer {
    pub async fn bind(addr: &str, identity: PeerIdentity) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind peer server on {}", addr))?;
        debug!("Peer server listening on: {}", listener.local_addr()?);
        Ok(Self {
            listener,
            identity: Arc::new(identity),
            buffer_size: 8192,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown, then wait for their tasks to end
    pub async fn serve(self, shutdown: Shutdown) -> Result<()> {
        info!(
            "Peer '{}' serving on {}",
            self.identity.name,
            self.listener.local_addr()?
        );
        let next_connection_id = AtomicU64::new(1);
        let mut connections = Vec::new();

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.triggered() => break,
            };

            match accepted {
                Ok((stream, client_addr)) => {
                    let connection_id = next_connection_id.fetch_add(1, Ordering::Relaxed);
                    info!("Accepted connection {} from {}", connection_id, client_addr);
                    if let Err(e) = configure_socket(&stream, self.buffer_size) {
                        warn!("Failed to configure connection {}: {}", connection_id, e);
                    }
                    connections.retain(|task: &tokio::task::JoinHandle<()>| !task.is_finished());
                    connections.push(tokio::spawn(handle_connection(
                        connection_id,
                        stream,
                        Arc::clone(&self.identity),
                        shutdown.clone(),
                    )));
                }
                Err(e) => {
                    error!("Failed to accept TCP connection: {}", e);
                }
            }
        }

        for task in connections {
            if let Err(e) = task.await {
                warn!("Connection task failed: {}", e);
            }
        }
        info!("Peer '{}' stopped", self.identity.name);
        Ok(())
    }
}

async fn handle_connection(
    connection_id: u64,
    mut stream: TcpStream,
    identity: Arc<PeerIdentity>,
    shutdown: Shutdown,
) {
    debug!("Handling connection {}", connection_id);
    let (mut reader, mut writer) = stream.split();

    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = shutdown.triggered() => break,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(TransportError::Closed) => {
                info!("Connection {} closed by consumer", connection_id);
                break;
            }
            Err(e) => {
                warn!("Connection {} failed: {}", connection_id, error_chain(&e));
                break;
            }
        };

        let Some(reply) = identity.answer(frame) else {
            continue;
        };
        let is_event = matches!(reply, Frame::Event { .. });
        let started = Instant::now();
        if let Err(e) = write_frame(&mut writer, &reply).await {
            warn!(
                "Replying on connection {} failed: {}",
                connection_id,
                error_chain(&e)
            );
            break;
        }
        if is_event {
            info!(
                "Sent message in {}",
                format_latency_f64(started.elapsed().as_secs_f64() * 1_000_000.0)
            );
        }
    }

    debug!("Connection {} handler finished", connection_id);
}
