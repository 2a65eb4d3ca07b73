//! Console and file logging setup.
//!
//! Console lines are coloured by level and prefixed with a UTC timestamp.
//! When a log directory is given, the same events are also written, without
//! colour, to a daily-rolling file through a non-blocking writer.

use anyhow::{Context, Result};
use chrono::Utc;
use colored::*;
use std::fmt;
use std::path::Path;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// File name prefix of the rolling log files
pub const LOG_FILE_PREFIX: &str = "edge-latency";

/// A tracing event formatter that colours the whole line by level.
///
/// Output looks like `2024-05-01T12:00:00.123456Z  INFO message`.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Buffer the fields so the colour applies to the entire line
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let level = *event.metadata().level();
        let line = format!(
            "{} {:>5} {}",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ"),
            level,
            buffer
        );

        let colored_output = match level {
            Level::INFO => line.white(),
            Level::WARN => line.yellow(),
            Level::ERROR => line.red(),
            Level::DEBUG => line.blue(),
            Level::TRACE => line.purple(),
        };

        writeln!(writer, "{}", colored_output)
    }
}

/// Daily-rolling, non-blocking writer into `dir`
pub fn file_writer(dir: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(dir)
        .with_context(|| format!("failed to open log file in {}", dir.display()))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Install the global subscriber.
///
/// The level comes from `RUST_LOG` and defaults to `info`. The returned
/// guard flushes the file writer when dropped and must live as long as the
/// process logs.
pub fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = tracing_subscriber::fmt::layer().event_format(ColorizedFormatter);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let (writer, guard) = file_writer(dir)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install the logging subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_formatter_prefixes_timestamp_and_level() {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .event_format(ColorizedFormatter)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("Correlation token mismatch");
        });

        let output = String::from_utf8(capture.0.lock().clone()).unwrap();
        assert!(output.contains(" WARN Correlation token mismatch"));
        assert!(output.contains(&Utc::now().format("%Y-%m-%d").to_string()));
        assert!(output.ends_with('\n'));
    }

    #[test]
    fn test_file_writer_creates_rolling_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        {
            let (mut writer, _guard) = file_writer(&log_dir).unwrap();
            writer.write_all(b"hello from the monitor\n").unwrap();
        }

        let files: Vec<_> = std::fs::read_dir(&log_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with(LOG_FILE_PREFIX));
        assert!(files[0].ends_with(".log"));

        let contents = std::fs::read_to_string(log_dir.join(&files[0])).unwrap();
        assert_eq!(contents, "hello from the monitor\n");
    }
}
