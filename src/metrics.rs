//! # Windowed Latency Statistics
//!
//! The aggregator wakes on a fixed interval, drains whatever the sample
//! buffer held at the start of the cycle and folds it into an
//! [`AggregateWindow`]: per category, min/max/average for the request,
//! response and total phases, a fixed-bucket histogram of total latency and
//! HDR-histogram percentiles. Nothing is carried from one window to the next.
//!
//! ## Numeric Semantics
//!
//! Latencies are signed microsecond counts. Negative values (clock skew
//! between the peers) are folded with signed comparisons; the bucket
//! histogram puts them in the lowest bucket and the percentile estimate
//! clamps them to zero.

use anyhow::Result;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::sample::{Category, Sample, SampleBuffer};
use crate::shutdown::Shutdown;
use crate::utils::{format_latency_f64, format_latency_us, histogram_bar};

/// Width of one histogram bucket in milliseconds
pub const BUCKET_WIDTH_MS: i64 = 1_000;

/// Number of buckets, the last one collecting everything at or above 10s
pub const BUCKET_COUNT: usize = 11;

const BAR_WIDTH: usize = 40;

/// Latency phases tracked for each sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatencyPhase {
    Request,
    Response,
    Total,
}

impl fmt::Display for LatencyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LatencyPhase::Request => write!(f, "Request"),
            LatencyPhase::Response => write!(f, "Response"),
            LatencyPhase::Total => write!(f, "Total"),
        }
    }
}

/// Running min/max/sum of one phase, in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseStats {
    pub min_us: i64,
    pub max_us: i64,
    pub sum_us: i128,
    pub count: u64,
}

impl Default for PhaseStats {
    fn default() -> Self {
        Self {
            min_us: i64::MAX,
            max_us: i64::MIN,
            sum_us: 0,
            count: 0,
        }
    }
}

impl PhaseStats {
    pub fn record(&mut self, value_us: i64) {
        self.min_us = self.min_us.min(value_us);
        self.max_us = self.max_us.max(value_us);
        self.sum_us += value_us as i128;
        self.count += 1;
    }

    /// `None` for an empty window
    pub fn average_us(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum_us as f64 / self.count as f64)
        }
    }
}

/// Fixed 1-second buckets of total latency: `<1000ms`, `1000`, …, `9000`, `>10000`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BucketHistogram {
    pub buckets: [u64; BUCKET_COUNT],
}

impl BucketHistogram {
    /// Bucket index for a total latency; negatives land in the first bucket
    pub fn bucket_index(total_ms: i64) -> usize {
        total_ms
            .div_euclid(BUCKET_WIDTH_MS)
            .clamp(0, BUCKET_COUNT as i64 - 1) as usize
    }

    pub fn record(&mut self, total_ms: i64) {
        self.buckets[Self::bucket_index(total_ms)] += 1;
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().sum()
    }

    pub fn label(index: usize) -> String {
        match index {
            0 => format!("<{}", BUCKET_WIDTH_MS),
            i if i == BUCKET_COUNT - 1 => format!(">{}", i as i64 * BUCKET_WIDTH_MS),
            i => format!("{}", i as i64 * BUCKET_WIDTH_MS),
        }
    }
}

/// Percentile estimates of total latency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

/// Everything computed for one category in one window
#[derive(Debug, Clone)]
pub struct CategoryWindow {
    pub category: Category,
    pub request: PhaseStats,
    pub response: PhaseStats,
    pub total: PhaseStats,
    pub histogram: BucketHistogram,
    total_hdr: Histogram<u64>,
}

impl CategoryWindow {
    fn new(category: Category) -> Result<Self> {
        Ok(Self {
            category,
            request: PhaseStats::default(),
            response: PhaseStats::default(),
            total: PhaseStats::default(),
            histogram: BucketHistogram::default(),
            // 3 significant figures, auto-resizing
            total_hdr: Histogram::<u64>::new(3)?,
        })
    }

    fn record(&mut self, sample: &Sample) {
        let request_us = micros(sample.request_latency());
        let response_us = micros(sample.response_latency());
        let total_us = micros(sample.total_latency());

        self.request.record(request_us);
        self.response.record(response_us);
        self.total.record(total_us);
        self.histogram.record(sample.total_latency().num_milliseconds());

        if let Err(e) = self.total_hdr.record(total_us.max(0) as u64) {
            warn!("Dropping {} sample from percentile estimate: {}", self.category, e);
        }
    }

    pub fn count(&self) -> u64 {
        self.total.count
    }

    pub fn phase(&self, phase: LatencyPhase) -> &PhaseStats {
        match phase {
            LatencyPhase::Request => &self.request,
            LatencyPhase::Response => &self.response,
            LatencyPhase::Total => &self.total,
        }
    }

    pub fn percentiles(&self) -> Option<Percentiles> {
        if self.total_hdr.is_empty() {
            return None;
        }
        Some(Percentiles {
            p50_us: self.total_hdr.value_at_quantile(0.50),
            p95_us: self.total_hdr.value_at_quantile(0.95),
            p99_us: self.total_hdr.value_at_quantile(0.99),
        })
    }

    /// Printable report for this category
    pub fn report(&self, include_histogram: bool) -> CategoryReport<'_> {
        CategoryReport {
            window: self,
            include_histogram,
        }
    }
}

fn micros(latency: chrono::Duration) -> i64 {
    // Saturate rather than fail on absurd clock differences
    latency.num_microseconds().unwrap_or_else(|| {
        if latency < chrono::Duration::zero() {
            i64::MIN
        } else {
            i64::MAX
        }
    })
}

/// Statistics for one aggregation cycle
#[derive(Debug, Default)]
pub struct AggregateWindow {
    categories: BTreeMap<Category, CategoryWindow>,
}

impl AggregateWindow {
    pub fn from_samples(samples: &[Sample]) -> Result<Self> {
        let mut window = Self::default();
        for sample in samples {
            window.record(sample)?;
        }
        Ok(window)
    }

    pub fn record(&mut self, sample: &Sample) -> Result<()> {
        let window = match self.categories.entry(sample.category) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(CategoryWindow::new(sample.category)?),
        };
        window.record(sample);
        Ok(())
    }

    /// Stats for a category, `None` when it had no samples this window
    pub fn category(&self, category: Category) -> Option<&CategoryWindow> {
        self.categories
            .get(&category)
            .filter(|w| w.count() > 0)
    }

    pub fn sample_count(&self) -> u64 {
        self.categories.values().map(|w| w.count()).sum()
    }
}

/// Display adapter producing the text report of one category
pub struct CategoryReport<'a> {
    window: &'a CategoryWindow,
    include_histogram: bool,
}

impl<'a> fmt::Display for CategoryReport<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let w = self.window;
        writeln!(f, "{} latency ({} samples)", w.category, w.count())?;
        for phase in [LatencyPhase::Request, LatencyPhase::Response, LatencyPhase::Total] {
            let stats = w.phase(phase);
            let avg = stats.average_us().map_or("-".to_string(), format_latency_f64);
            writeln!(
                f,
                "  {:<9} min {:>14}  max {:>14}  avg {:>14}",
                phase.to_string(),
                format_latency_us(stats.min_us),
                format_latency_us(stats.max_us),
                avg
            )?;
        }
        if let Some(p) = w.percentiles() {
            write!(
                f,
                "  Total     p50 {:>14}  p95 {:>14}  p99 {:>14}",
                format_latency_us(p.p50_us as i64),
                format_latency_us(p.p95_us as i64),
                format_latency_us(p.p99_us as i64)
            )?;
        }

        if self.include_histogram {
            let max = w.histogram.buckets.iter().copied().max().unwrap_or(0);
            writeln!(f)?;
            write!(f, "  Histogram (ms)")?;
            for (i, &count) in w.histogram.buckets.iter().enumerate() {
                write!(
                    f,
                    "\n  {:>6} | {:>6} {}",
                    BucketHistogram::label(i),
                    count,
                    histogram_bar(count, max, BAR_WIDTH)
                )?;
            }
        }
        Ok(())
    }
}

/// Which parts of the report are printed
#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub categories: Vec<Category>,
    pub histogram: bool,
}

/// Periodically drains the sample buffer and prints window statistics
pub struct Aggregator {
    buffer: Arc<SampleBuffer>,
    interval: Duration,
    options: ReportOptions,
}

impl Aggregator {
    pub fn new(buffer: Arc<SampleBuffer>, interval: Duration, options: ReportOptions) -> Self {
        Self {
            buffer,
            interval,
            options,
        }
    }

    /// Drain the samples present right now and compute their statistics
    pub fn run_cycle(&self) -> Result<AggregateWindow> {
        let samples = self.buffer.drain_snapshot();
        debug!("Aggregating {} samples", samples.len());
        AggregateWindow::from_samples(&samples)
    }

    /// Report lines for a window; categories with no samples are skipped
    pub fn render(&self, window: &AggregateWindow) -> Vec<String> {
        self.options
            .categories
            .iter()
            .filter_map(|&category| window.category(category))
            .map(|w| w.report(self.options.histogram).to_string())
            .collect()
    }

    /// Run cycles until shutdown. The first cycle runs one interval after start.
    pub async fn run(&self, shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.triggered() => break,
            }

            match self.run_cycle() {
                Ok(window) => {
                    let lines = self.render(&window);
                    if lines.is_empty() {
                        info!("No samples collected in the last {:?}", self.interval);
                    }
                    for line in lines {
                        info!("{}", line);
                    }
                }
                Err(e) => warn!("Aggregation cycle failed: {:#}", e),
            }
        }
        debug!("Aggregator stopped");
    }
}
