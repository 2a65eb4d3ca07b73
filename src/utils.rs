//! # Utility Functions
//!
//! Small helpers shared by the report printer, the loops and the transport:
//!
//! - **Formatting**: signed latency values and histogram bars
//! - **Diagnostics**: flattening an error's source chain into one log line
//!
//! ## Usage Examples
//!
//! ```rust
//! use edge_latency::utils::*;
//!
//! assert_eq!(format_latency_us(1_500), "1.500ms");
//! assert_eq!(format_latency_us(-250), "-0.250ms");
//! assert_eq!(histogram_bar(5, 10, 10), "█████");
//! ```

/// Format a signed microsecond count as milliseconds
///
/// Latencies derived from two different clocks can be negative, so the sign
/// is kept rather than clamped.
///
/// ## Examples
///
/// ```rust
/// # use edge_latency::utils::format_latency_us;
/// assert_eq!(format_latency_us(12_000), "12.000ms");
/// assert_eq!(format_latency_us(0), "0.000ms");
/// ```
pub fn format_latency_us(micros: i64) -> String {
    let sign = if micros < 0 { "-" } else { "" };
    let abs = micros.unsigned_abs();
    format!("{}{}.{:03}ms", sign, abs / 1_000, abs % 1_000)
}

/// Format a fractional microsecond average the same way
pub fn format_latency_f64(micros: f64) -> String {
    format!("{:.3}ms", micros / 1_000.0)
}

/// Render a histogram bar proportional to `count / max`
///
/// - **Zero max**: returns an empty bar to avoid dividing by zero
/// - **Non-zero count**: always draws at least one block so small buckets stay visible
pub fn histogram_bar(count: u64, max: u64, width: usize) -> String {
    if max == 0 || count == 0 {
        return String::new();
    }

    let ratio = (count as f64 / max as f64).min(1.0);
    let filled = ((ratio * width as f64).round() as usize).clamp(1, width.max(1));
    "█".repeat(filled)
}

/// Join an error and all of its sources into a single line
///
/// `"outer: middle: root cause"`
pub fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut line = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        line.push_str(": ");
        line.push_str(&cause.to_string());
        source = cause.source();
    }
    line
}
