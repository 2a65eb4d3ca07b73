//! # Latency Samples and the Shared Sample Buffer
//!
//! A [`Sample`] is one completed round-trip: when the request was issued,
//! when the peer says it produced the answer, and when the answer was
//! observed locally. Samples are produced concurrently by the requester
//! loops and the inbound responder, and drained periodically by the
//! aggregator.
//!
//! ## Timestamps
//!
//! `produced` comes from the remote peer's clock, so `begin <= produced <= end`
//! is expected but not guaranteed. All derived durations are signed and
//! may be negative under clock skew.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use crossbeam::queue::SegQueue;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Which request pattern produced a sample
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    /// Direct method invocation (request/response RPC)
    Method,
    /// Published event answered by an event from the peer
    Message,
}

impl Category {
    /// All categories in report order
    pub const ALL: [Category; 2] = [Category::Method, Category::Message];
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Method => write!(f, "Method"),
            Category::Message => write!(f, "Message"),
        }
    }
}

/// One completed round-trip
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub category: Category,
    pub begin: DateTime<Utc>,
    pub produced: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Sample {
    pub fn new(
        category: Category,
        begin: DateTime<Utc>,
        produced: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            category,
            begin,
            produced,
            end,
        }
    }

    /// Time from issuing the request until the peer produced its answer
    pub fn request_latency(&self) -> ChronoDuration {
        self.produced - self.begin
    }

    /// Time from the peer producing its answer until it was observed here
    pub fn response_latency(&self) -> ChronoDuration {
        self.end - self.produced
    }

    /// Full round-trip time; always `request_latency + response_latency`
    pub fn total_latency(&self) -> ChronoDuration {
        self.end - self.begin
    }
}

/// Unbounded multi-producer/multi-consumer buffer of completed samples.
///
/// `push` never blocks. Each pushed sample is handed out by exactly one
/// `drain_up_to` call.
#[derive(Debug, Default)]
pub struct SampleBuffer {
    queue: SegQueue<Sample>,
    pushed: AtomicU64,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, sample: Sample) {
        self.queue.push(sample);
        self.pushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of samples currently buffered
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total samples ever pushed into this buffer
    pub fn total_pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Remove and return at most `max` samples.
    ///
    /// Stops early if the queue runs dry, so concurrent drains may each get
    /// fewer than requested but never the same sample twice.
    pub fn drain_up_to(&self, max: usize) -> Vec<Sample> {
        let mut drained = Vec::with_capacity(max.min(self.queue.len()));
        while drained.len() < max {
            match self.queue.pop() {
                Some(sample) => drained.push(sample),
                None => break,
            }
        }
        drained
    }

    /// Drain exactly the samples present when the call starts.
    ///
    /// Samples pushed while draining stay buffered for the next call.
    pub fn drain_snapshot(&self) -> Vec<Sample> {
        let snapshot = self.queue.len();
        self.drain_up_to(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn at_ms(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000 + ms).unwrap()
    }

    fn sample(category: Category, begin: i64, produced: i64, end: i64) -> Sample {
        Sample::new(category, at_ms(begin), at_ms(produced), at_ms(end))
    }

    #[test]
    fn test_derived_latencies_are_consistent() {
        let s = sample(Category::Method, 0, 120, 300);
        assert_eq!(s.request_latency().num_milliseconds(), 120);
        assert_eq!(s.response_latency().num_milliseconds(), 180);
        assert_eq!(s.total_latency(), s.request_latency() + s.response_latency());
    }

    #[test]
    fn test_clock_skew_gives_negative_phase() {
        // Peer clock runs behind: produced appears before begin
        let s = sample(Category::Message, 100, 40, 250);
        assert_eq!(s.request_latency().num_milliseconds(), -60);
        assert_eq!(s.response_latency().num_milliseconds(), 210);
        assert_eq!(s.total_latency(), s.request_latency() + s.response_latency());
    }

    #[test]
    fn test_drain_up_to_then_snapshot_takes_everything_buffered() {
        let buffer = SampleBuffer::new();
        for i in 0..5 {
            buffer.push(sample(Category::Method, i, i, i));
        }

        let first = buffer.drain_up_to(3);
        assert_eq!(first.len(), 3);
        buffer.push(sample(Category::Message, 99, 99, 99));

        let rest = buffer.drain_snapshot();
        assert_eq!(rest.len(), 3);
        assert!(buffer.is_empty());
        assert_eq!(buffer.total_pushed(), 6);
    }

    #[test]
    fn test_pushes_during_snapshot_drain_stay_for_next_cycle() {
        let buffer = Arc::new(SampleBuffer::new());
        for i in 0..1_000 {
            buffer.push(sample(Category::Method, i, i, i));
        }

        let producers: Vec<_> = (1..=4)
            .map(|p| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for i in 0..2_000 {
                        let id = p * 10_000 + i;
                        buffer.push(sample(Category::Message, id, id, id));
                    }
                })
            })
            .collect();

        // Only this thread drains, so the queue never shrinks under it
        let len_before = buffer.len();
        let drained = buffer.drain_snapshot();
        assert!(drained.len() >= len_before);

        for handle in producers {
            handle.join().unwrap();
        }
        let remaining = buffer.drain_snapshot();

        assert_eq!(
            (drained.len() + remaining.len()) as u64,
            buffer.total_pushed()
        );
        let distinct: HashSet<i64> = drained
            .iter()
            .chain(remaining.iter())
            .map(|s| s.begin.timestamp_millis())
            .collect();
        assert_eq!(distinct.len(), 9_000);
    }

    #[test]
    fn test_drain_up_to_on_empty_buffer() {
        let buffer = SampleBuffer::new();
        assert!(buffer.drain_up_to(10).is_empty());
        assert!(buffer.drain_snapshot().is_empty());
    }

    #[test]
    fn test_concurrent_push_and_drain_never_duplicates() {
        let buffer = Arc::new(SampleBuffer::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let id = p * 1_000 + i;
                        buffer.push(sample(Category::Method, id, id, id));
                    }
                })
            })
            .collect();

        let drainers: Vec<_> = (0..2)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    for _ in 0..200 {
                        seen.extend(buffer.drain_up_to(7));
                    }
                    seen
                })
            })
            .collect();

        for handle in producers {
            handle.join().unwrap();
        }
        let mut all: Vec<Sample> = drainers
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.extend(buffer.drain_snapshot());

        assert_eq!(all.len(), 2_000);
        let distinct: HashSet<i64> = all.iter().map(|s| s.begin.timestamp_millis()).collect();
        assert_eq!(distinct.len(), 2_000);
    }
}
