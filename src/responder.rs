//! Inbound handler for the peer's answers to published events.
//!
//! The correlation token carries the time the request was issued, the body
//! carries the time the peer produced its answer. A sample is only pushed
//! once both parse; the correlator is released either way so the message
//! loop never waits on an answer that has already arrived.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::correlator::{Correlator, SignalOutcome};
use crate::sample::{Category, Sample, SampleBuffer};
use crate::transport::{AckOutcome, InboundHandler, InboundMessage, TimePayload};
use crate::utils::error_chain;

/// Reasons an inbound answer could not be turned into a sample
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("message has no correlation token")]
    MissingCorrelationId,
    #[error("correlation token '{token}' is not a timestamp")]
    InvalidToken {
        token: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("message body is not a time payload")]
    InvalidBody(#[from] serde_json::Error),
}

/// Parse the issue time back out of a correlation token
pub fn parse_token(token: &str) -> Result<DateTime<Utc>, PayloadError> {
    DateTime::parse_from_rfc3339(token)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|source| PayloadError::InvalidToken {
            token: token.to_string(),
            source,
        })
}

pub struct Responder {
    buffer: Arc<SampleBuffer>,
    correlator: Arc<Correlator>,
}

impl Responder {
    pub fn new(buffer: Arc<SampleBuffer>, correlator: Arc<Correlator>) -> Self {
        Self { buffer, correlator }
    }

    /// Build the sample for an inbound answer observed at `end`
    fn build_sample(message: &InboundMessage, end: DateTime<Utc>) -> Result<Sample, PayloadError> {
        let token = message
            .correlation_id
            .as_deref()
            .ok_or(PayloadError::MissingCorrelationId)?;
        let begin = parse_token(token)?;
        let produced = TimePayload::from_json(&message.body)?.utc_time;
        Ok(Sample::new(Category::Message, begin, produced, end))
    }

    fn release(&self, token: &str) {
        match self.correlator.signal(token) {
            SignalOutcome::Released => {}
            SignalOutcome::ReleasedMismatched { expected } => warn!(
                "Correlation token mismatch: expected '{}', got '{}'; releasing waiter anyway",
                expected, token
            ),
            SignalOutcome::Ignored => debug!("No request waiting for token '{}'", token),
        }
    }
}

impl InboundHandler for Responder {
    fn handle(&self, message: InboundMessage) -> AckOutcome {
        let end = Utc::now();
        let token = message.correlation_id.clone().unwrap_or_default();

        let outcome = match Self::build_sample(&message, end) {
            Ok(sample) => {
                self.buffer.push(sample);
                AckOutcome::Completed
            }
            Err(e) => {
                warn!(
                    "Abandoning inbound message on '{}': {}",
                    message.channel,
                    error_chain(&e)
                );
                AckOutcome::Abandoned
            }
        };

        self.release(&token);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::{token_for, WaitOutcome};
    use crate::shutdown::Shutdown;
    use chrono::Duration;

    fn responder() -> (Responder, Arc<SampleBuffer>, Arc<Correlator>) {
        let buffer = Arc::new(SampleBuffer::new());
        let correlator = Arc::new(Correlator::new());
        (
            Responder::new(Arc::clone(&buffer), Arc::clone(&correlator)),
            buffer,
            correlator,
        )
    }

    fn answer(token: Option<String>, body: Vec<u8>) -> InboundMessage {
        InboundMessage {
            channel: "GetTimeMessage".to_string(),
            correlation_id: token,
            body,
        }
    }

    #[tokio::test]
    async fn test_valid_answer_pushes_sample_and_releases() {
        let (responder, buffer, correlator) = responder();
        let pending = correlator.begin_wait();
        let produced = pending.issued_at + Duration::milliseconds(5);

        let outcome = responder.handle(answer(
            Some(pending.token.clone()),
            TimePayload { utc_time: produced }.to_json(),
        ));

        assert_eq!(outcome, AckOutcome::Completed);
        assert_eq!(
            correlator.wait(&pending, &Shutdown::new()).await,
            WaitOutcome::Released
        );

        let samples = buffer.drain_snapshot();
        assert_eq!(samples.len(), 1);
        let sample = samples[0];
        assert_eq!(sample.category, Category::Message);
        assert_eq!(sample.begin, pending.issued_at);
        assert_eq!(sample.produced, produced);
        assert!(sample.end >= sample.begin);
    }

    #[tokio::test]
    async fn test_bad_body_is_abandoned_without_sample() {
        let (responder, buffer, correlator) = responder();
        let pending = correlator.begin_wait();

        let outcome = responder.handle(answer(Some(pending.token.clone()), b"{oops".to_vec()));

        assert_eq!(outcome, AckOutcome::Abandoned);
        assert!(buffer.is_empty(), "no partial sample may be pushed");
        assert_eq!(
            correlator.wait(&pending, &Shutdown::new()).await,
            WaitOutcome::Released
        );
    }

    #[test]
    fn test_bad_token_is_abandoned() {
        let (responder, buffer, correlator) = responder();
        let _pending = correlator.begin_wait();

        let outcome = responder.handle(answer(
            Some("not-a-time".to_string()),
            TimePayload::now().to_json(),
        ));

        assert_eq!(outcome, AckOutcome::Abandoned);
        assert!(buffer.is_empty());
        assert!(!correlator.is_outstanding());
    }

    #[test]
    fn test_missing_token_is_abandoned() {
        let (responder, buffer, _correlator) = responder();
        let outcome = responder.handle(answer(None, TimePayload::now().to_json()));
        assert_eq!(outcome, AckOutcome::Abandoned);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_parse_token_round_trip() {
        let now = Utc::now();
        assert_eq!(parse_token(&token_for(now)).unwrap(), now);

        let err = parse_token("yesterday").unwrap_err();
        assert!(error_chain(&err).starts_with("correlation token 'yesterday' is not a timestamp: "));
    }
}
