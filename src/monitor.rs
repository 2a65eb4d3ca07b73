//! # Consumer Orchestration
//!
//! [`MonitorContext`] is the explicitly constructed state shared by every
//! task of the measuring side: the validated configuration, the sample
//! buffer, the correlator and the shutdown signal. `main` builds it once and
//! hands it to [`run_monitor`] together with an open transport.
//!
//! `run_monitor` wires the pieces together:
//!
//! 1. registers the [`Responder`] for the message channel,
//! 2. spawns the enabled requester loops and the aggregator,
//! 3. waits for all of them to observe the shutdown signal,
//! 4. closes the transport.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::cli::MonitorConfig;
use crate::correlator::Correlator;
use crate::metrics::{Aggregator, ReportOptions};
use crate::requester::{LoopStats, MessageLoop, MethodLoop};
use crate::responder::Responder;
use crate::sample::SampleBuffer;
use crate::shutdown::Shutdown;
use crate::transport::Transport;
use crate::utils::error_chain;

/// State owned by the process entry point and shared with every task
#[derive(Debug, Clone)]
pub struct MonitorContext {
    pub config: MonitorConfig,
    pub buffer: Arc<SampleBuffer>,
    pub correlator: Arc<Correlator>,
    pub shutdown: Shutdown,
}

impl MonitorContext {
    pub fn new(config: MonitorConfig, shutdown: Shutdown) -> Self {
        Self {
            config,
            buffer: Arc::new(SampleBuffer::new()),
            correlator: Arc::new(Correlator::new()),
            shutdown,
        }
    }

    fn report_options(&self) -> ReportOptions {
        ReportOptions {
            categories: self.config.categories(),
            histogram: self.config.histogram_enabled,
        }
    }
}

/// What the loops did over the lifetime of the monitor
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSummary {
    pub method: Option<LoopStats>,
    pub message: Option<LoopStats>,
    pub samples_recorded: u64,
}

/// Run the enabled loops and the aggregator until shutdown, then close `transport`
pub async fn run_monitor<T>(context: &MonitorContext, transport: Arc<T>) -> Result<MonitorSummary>
where
    T: Transport + ?Sized + 'static,
{
    let config = &context.config;
    info!(
        "Monitoring via {} transport (method: {}, message: {}, interval: {:?})",
        transport.name(),
        config.method_enabled,
        config.message_enabled,
        config.interval
    );

    if config.message_enabled {
        let responder = Responder::new(Arc::clone(&context.buffer), Arc::clone(&context.correlator));
        transport.register_inbound_handler(&config.channel, Arc::new(responder));
    }

    let method_task = config.method_enabled.then(|| {
        let method_loop = MethodLoop::new(
            Arc::clone(&transport),
            Arc::clone(&context.buffer),
            config.target.clone(),
            config.method_name.clone(),
        );
        let shutdown = context.shutdown.clone();
        tokio::spawn(async move { method_loop.run(shutdown).await })
    });

    let message_task = config.message_enabled.then(|| {
        let message_loop = MessageLoop::new(
            Arc::clone(&transport),
            Arc::clone(&context.correlator),
            config.channel.clone(),
        );
        let shutdown = context.shutdown.clone();
        tokio::spawn(async move { message_loop.run(shutdown).await })
    });

    let aggregator_task = {
        let aggregator = Aggregator::new(
            Arc::clone(&context.buffer),
            config.interval,
            context.report_options(),
        );
        let shutdown = context.shutdown.clone();
        tokio::spawn(async move { aggregator.run(shutdown).await })
    };

    let mut summary = MonitorSummary::default();
    if let Some(task) = method_task {
        summary.method = Some(task.await.context("method loop task failed")?);
    }
    if let Some(task) = message_task {
        summary.message = Some(task.await.context("message loop task failed")?);
    }
    aggregator_task.await.context("aggregator task failed")?;
    debug!("All monitor tasks finished");

    if let Err(e) = transport.close().await {
        warn!("Closing {} transport failed: {}", transport.name(), error_chain(&e));
    }

    summary.samples_recorded = context.buffer.total_pushed();
    match context.shutdown.reason() {
        Some(reason) => info!(
            "Monitor stopped ({}); {} samples recorded",
            reason, summary.samples_recorded
        ),
        None => info!("Monitor stopped; {} samples recorded", summary.samples_recorded),
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Category;
    use crate::shutdown::ShutdownReason;
    use crate::transport::{
        EventPublisher, InboundHandler, InboundMessage, MethodInvoker, MethodResponse,
        TimePayload, TransportError, STATUS_OK,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Answers method calls and echoes events straight back to the registered handler
    struct LoopbackTransport {
        handler: Mutex<Option<Arc<dyn InboundHandler>>>,
        calls: AtomicUsize,
        events: AtomicUsize,
        closed: AtomicBool,
        drop_after: Option<(usize, Shutdown)>,
    }

    impl LoopbackTransport {
        fn new(drop_after: Option<(usize, Shutdown)>) -> Self {
            Self {
                handler: Mutex::new(None),
                calls: AtomicUsize::new(0),
                events: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                drop_after,
            }
        }
    }

    #[async_trait]
    impl MethodInvoker for LoopbackTransport {
        async fn invoke_method(
            &self,
            _target: &str,
            _method: &str,
            _payload: Vec<u8>,
        ) -> Result<MethodResponse, TransportError> {
            tokio::task::yield_now().await;
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((limit, shutdown)) = &self.drop_after {
                if n >= *limit {
                    shutdown.trigger(ShutdownReason::TransportClosed);
                    return Err(TransportError::Closed);
                }
            }
            Ok(MethodResponse {
                status: STATUS_OK,
                payload: TimePayload::now().to_json(),
            })
        }
    }

    #[async_trait]
    impl EventPublisher for LoopbackTransport {
        async fn send_event(
            &self,
            channel: &str,
            _payload: Vec<u8>,
            correlation_id: &str,
        ) -> Result<(), TransportError> {
            tokio::task::yield_now().await;
            self.events.fetch_add(1, Ordering::SeqCst);
            let handler = self.handler.lock().clone();
            if let Some(handler) = handler {
                handler.handle(InboundMessage {
                    channel: channel.to_string(),
                    correlation_id: Some(correlation_id.to_string()),
                    body: TimePayload::now().to_json(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        fn register_inbound_handler(&self, _channel: &str, handler: Arc<dyn InboundHandler>) {
            *self.handler.lock() = Some(handler);
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "loopback"
        }
    }

    fn config(method: bool, message: bool) -> MonitorConfig {
        MonitorConfig {
            method_enabled: method,
            message_enabled: message,
            interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    async fn wait_for_samples(buffer: &SampleBuffer, at_least: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while buffer.total_pushed() < at_least {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("samples should be recorded");
    }

    #[tokio::test]
    async fn test_both_loops_record_until_shutdown() {
        let context = MonitorContext::new(config(true, true), Shutdown::new());
        let transport = Arc::new(LoopbackTransport::new(None));

        let monitor = {
            let context = context.clone();
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { run_monitor(&context, transport).await })
        };

        wait_for_samples(&context.buffer, 50).await;
        context
            .shutdown
            .trigger(ShutdownReason::Requested("test".into()));

        let summary = tokio::time::timeout(Duration::from_secs(5), monitor)
            .await
            .expect("monitor should stop")
            .unwrap()
            .unwrap();

        assert!(transport.closed.load(Ordering::SeqCst));
        let method = summary.method.unwrap();
        let message = summary.message.unwrap();
        assert!(method.completed > 0);
        assert!(message.completed > 0);
        assert_eq!(
            summary.samples_recorded,
            method.completed + message.completed
        );

        let samples = context.buffer.drain_snapshot();
        assert!(samples.iter().any(|s| s.category == Category::Method));
        assert!(samples.iter().any(|s| s.category == Category::Message));
    }

    #[tokio::test]
    async fn test_disabled_method_loop_never_calls() {
        let context = MonitorContext::new(config(false, true), Shutdown::new());
        let transport = Arc::new(LoopbackTransport::new(None));

        let monitor = {
            let context = context.clone();
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { run_monitor(&context, transport).await })
        };

        wait_for_samples(&context.buffer, 10).await;
        context
            .shutdown
            .trigger(ShutdownReason::Requested("test".into()));
        let summary = monitor.await.unwrap().unwrap();

        assert_eq!(summary.method, None);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert!(transport.events.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_transport_teardown_stops_everything() {
        let shutdown = Shutdown::new();
        let context = MonitorContext::new(config(true, false), shutdown.clone());
        let transport = Arc::new(LoopbackTransport::new(Some((20, shutdown.clone()))));

        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            run_monitor(&context, Arc::clone(&transport)),
        )
        .await
        .expect("teardown should end the monitor")
        .unwrap();

        assert_eq!(shutdown.reason(), Some(ShutdownReason::TransportClosed));
        assert_eq!(summary.method, Some(LoopStats { completed: 19, failed: 1 }));
        assert!(transport.closed.load(Ordering::SeqCst));
    }
}
