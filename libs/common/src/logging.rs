//! Logging bootstrap shared by collector services
//!
//! Console output uses a compact `timestamp [LEVEL] message` line. When a log
//! directory is configured, a daily-rolling file layer is added on top.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Bracketed level tag: `[INFO]`, `[WARN]`, ...
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

fn level_color(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "\x1b[35m",
        Level::DEBUG => "\x1b[34m",
        Level::INFO => "\x1b[32m",
        Level::WARN => "\x1b[33m",
        Level::ERROR => "\x1b[31m",
    }
}

/// Event formatter producing `2025-12-02T00:50:44.809123Z [INFO] Service started`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = event.metadata().level();
        if writer.has_ansi_escapes() {
            write!(
                writer,
                "{}{}\x1b[0m ",
                level_color(level),
                format_level(level)
            )?;
        } else {
            write!(writer, "{} ", format_level(level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Options for [`init_logging`]
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Service name, used as the default filter target and the log file prefix
    pub service: String,
    /// Filter directive applied when `RUST_LOG` is not set
    pub level: String,
    /// Directory for daily-rolling log files; console only when `None`
    pub dir: Option<PathBuf>,
    /// Colored console output
    pub ansi: bool,
}

impl LogOptions {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            level: "info".to_string(),
            dir: None,
            ansi: true,
        }
    }

    /// Build the filter directive: `RUST_LOG` wins over the configured level.
    fn filter(&self) -> EnvFilter {
        match std::env::var("RUST_LOG") {
            Ok(directive) if !directive.trim().is_empty() => EnvFilter::new(directive),
            _ => EnvFilter::new(&self.level),
        }
    }
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held by
/// `main` for the process lifetime.
pub fn init_logging(options: &LogOptions) -> Result<Option<WorkerGuard>> {
    let console_layer = fmt::layer()
        .with_ansi(options.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let (file_layer, guard) = match &options.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", options.service));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed();
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(options.filter())
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_tags() {
        assert_eq!(format_level(&Level::INFO), "[INFO]");
        assert_eq!(format_level(&Level::ERROR), "[ERROR]");
        assert_eq!(format_level(&Level::TRACE), "[TRACE]");
    }

    #[test]
    fn test_default_options() {
        let options = LogOptions::new("collsrv");
        assert_eq!(options.level, "info");
        assert!(options.dir.is_none());
    }
}
