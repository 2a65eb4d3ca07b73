use super::{
    AckOutcome, EventPublisher, Frame, InboundHandler, InboundMessage, MethodInvoker,
    MethodResponse, Transport, TransportError, MAX_FRAME_LEN,
};
use crate::shutdown::{Shutdown, ShutdownReason};
use crate::utils::error_chain;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<MethodResponse>>>>;
type HandlerTable = Arc<Mutex<HashMap<String, Arc<dyn InboundHandler>>>>;

/// Connection settings for the TCP transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub buffer_size: usize,
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: crate::defaults::HOST.to_string(),
            port: crate::defaults::PORT,
            buffer_size: 8192,
            connect_timeout: crate::defaults::CONNECT_TIMEOUT,
            call_timeout: crate::defaults::CALL_TIMEOUT,
        }
    }
}

/// Read one length-prefixed frame
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_bytes).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => TransportError::Closed,
            _ => e.into(),
        });
    }
    let frame_len = u32::from_le_bytes(len_bytes) as usize;

    if frame_len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(frame_len));
    }

    let mut frame_data = vec![0u8; frame_len];
    reader.read_exact(&mut frame_data).await?;
    Frame::from_bytes(&frame_data)
}

/// Write one length-prefixed frame, bounded by a write timeout
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let frame_bytes = frame.to_bytes()?;
    if frame_bytes.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(frame_bytes.len()));
    }
    let frame_len = frame_bytes.len() as u32;

    let write_fut = async {
        writer.write_all(&frame_len.to_le_bytes()).await?;
        writer.write_all(&frame_bytes).await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    };

    // An unresponsive reader must not stall the caller forever
    match timeout(WRITE_TIMEOUT, write_fut).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(TransportError::Timeout(WRITE_TIMEOUT)),
    }
}

/// Apply the low-latency socket options used on both ends of a connection
pub fn configure_socket(stream: &TcpStream, buffer_size: usize) -> std::io::Result<()> {
    let socket = socket2::SockRef::from(stream);
    socket.set_nodelay(true)?;
    socket.set_recv_buffer_size(buffer_size)?;
    socket.set_send_buffer_size(buffer_size)?;
    Ok(())
}

/// Client side of the TCP transport.
///
/// A background reader task routes method responses to their callers by
/// request id and dispatches inbound events to the registered handlers.
/// Losing the connection triggers the shared shutdown signal.
pub struct TcpTransport {
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: PendingCalls,
    handlers: HandlerTable,
    next_request_id: AtomicU64,
    call_timeout: Duration,
    peer_addr: SocketAddr,
    reader: Mutex<Option<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Connect to the peer and start the reader task
    pub async fn open(config: &TransportConfig, shutdown: Shutdown) -> Result<Self, TransportError> {
        let addr = format!("{}:{}", config.host, config.port);
        debug!("Connecting TCP transport to: {}", addr);

        let stream = match timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(stream) => stream?,
            Err(_) => return Err(TransportError::Timeout(config.connect_timeout)),
        };
        configure_socket(&stream, config.buffer_size)?;
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let handlers: HandlerTable = Arc::new(Mutex::new(HashMap::new()));
        let closing = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(Self::read_loop(
            read_half,
            Arc::clone(&pending),
            Arc::clone(&handlers),
            Arc::clone(&closing),
            shutdown,
        ));

        info!("TCP transport connected to {}", peer_addr);
        Ok(Self {
            writer: tokio::sync::Mutex::new(Some(write_half)),
            pending,
            handlers,
            next_request_id: AtomicU64::new(1),
            call_timeout: config.call_timeout,
            peer_addr,
            reader: Mutex::new(Some(reader)),
            closing,
        })
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(stream) => write_frame(stream, frame).await,
            None => Err(TransportError::NotConnected),
        }
    }

    async fn read_loop(
        mut reader: OwnedReadHalf,
        pending: PendingCalls,
        handlers: HandlerTable,
        closing: Arc<AtomicBool>,
        shutdown: Shutdown,
    ) {
        loop {
            let frame = tokio::select! {
                frame = read_frame(&mut reader) => frame,
                _ = shutdown.triggered() => break,
            };

            match frame {
                Ok(Frame::MethodResponse {
                    request_id,
                    status,
                    payload,
                }) => {
                    let caller = pending.lock().remove(&request_id);
                    match caller {
                        Some(tx) => {
                            let _ = tx.send(MethodResponse { status, payload });
                        }
                        None => debug!("Dropping response {} with no waiting caller", request_id),
                    }
                }
                Ok(Frame::Event {
                    channel,
                    correlation_id,
                    body,
                }) => {
                    let handler = handlers.lock().get(&channel).cloned();
                    match handler {
                        Some(handler) => {
                            let outcome = handler.handle(InboundMessage {
                                channel: channel.clone(),
                                correlation_id,
                                body,
                            });
                            if outcome == AckOutcome::Abandoned {
                                debug!("Inbound event on '{}' abandoned by handler", channel);
                            }
                        }
                        None => warn!("No handler registered for channel '{}', dropping event", channel),
                    }
                }
                Ok(Frame::MethodRequest { method, .. }) => {
                    warn!("Ignoring unexpected method request '{}' from peer", method);
                }
                Err(e) => {
                    if !closing.load(Ordering::Acquire) {
                        warn!("TCP transport connection lost: {}", error_chain(&e));
                        shutdown.trigger(ShutdownReason::TransportClosed);
                    }
                    break;
                }
            }
        }

        // Dropping the senders fails every outstanding call with `Closed`
        pending.lock().clear();
        debug!("TCP transport reader finished");
    }
}

#[async_trait]
impl MethodInvoker for TcpTransport {
    async fn invoke_method(
        &self,
        target: &str,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<MethodResponse, TransportError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        let frame = Frame::MethodRequest {
            request_id,
            target: target.to_string(),
            method: method.to_string(),
            payload,
        };
        if let Err(e) = self.send_frame(&frame).await {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match timeout(self.call_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(TransportError::Timeout(self.call_timeout))
            }
        }
    }
}

#[async_trait]
impl EventPublisher for TcpTransport {
    async fn send_event(
        &self,
        channel: &str,
        payload: Vec<u8>,
        correlation_id: &str,
    ) -> Result<(), TransportError> {
        let frame = Frame::Event {
            channel: channel.to_string(),
            correlation_id: Some(correlation_id.to_string()),
            body: payload,
        };
        self.send_frame(&frame).await
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn register_inbound_handler(&self, channel: &str, handler: Arc<dyn InboundHandler>) {
        debug!("Registering inbound handler for channel '{}'", channel);
        self.handlers.lock().insert(channel.to_string(), handler);
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("Closing TCP transport");

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.pending.lock().clear();

        let writer = self.writer.lock().await.take();
        if let Some(mut stream) = writer {
            // The peer may already be gone; nothing left to release in that case
            if let Err(e) = stream.shutdown().await {
                debug!("TCP transport shutdown: {}", e);
            }
        }

        info!("TCP transport to {} closed", self.peer_addr);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "TCP"
    }
}
