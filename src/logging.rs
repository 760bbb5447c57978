//! Structured logging for the driver core.
//!
//! A NUT driver normally logs to stderr in the foreground and is expected to
//! fall back to a log file once it has forked to background (see
//! `Lifecycle::daemonize`). Verbosity is controlled by the `-D` flag
//! (repeatable) combined with the `debug_min` config knob — whichever is
//! more verbose wins, mirroring `nut_debug_level` in the original driver
//! core.

use crate::error::{NutError, Result};
use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::Once;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static INIT_ONCE: Once = Once::new();
static INIT_ERROR: OnceCell<String> = OnceCell::new();

/// Where log output goes once the subscriber is initialized.
#[derive(Debug, Clone)]
pub enum LogTarget {
    /// Foreground run: everything to stderr.
    Stderr,
    /// Backgrounded run: daily-rotated files under `directory`.
    File { directory: String },
}

/// Resolves the effective tracing level from `-D` count and `debug_min`.
///
/// `-D` may be given 0 to N times on the command line; `debug_min` is the
/// `ups.conf`/`-x` floor. The more verbose (lower) of the two wins, same as
/// `nut_debug_level = max(cli_d_count, debug_min)` in the original core.
#[must_use]
pub fn resolve_level(d_count: u8, debug_min: u8) -> Level {
    let verbosity = d_count.max(debug_min);
    match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialize the global tracing subscriber. Idempotent: only the first
/// call takes effect, subsequent calls just re-check for an init error.
pub fn init_logging(target: &LogTarget, level: Level) -> Result<()> {
    INIT_ONCE.call_once(|| {
        if let Err(e) = try_init(target, level) {
            let _ = INIT_ERROR.set(e.to_string());
        }
    });

    if let Some(err) = INIT_ERROR.get() {
        return Err(NutError::config(err.clone()));
    }
    Ok(())
}

fn try_init(target: &LogTarget, level: Level) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("nutdrv_core={level}").into());

    let writer: BoxMakeWriter = match target {
        LogTarget::Stderr => BoxMakeWriter::new(std::io::stderr),
        LogTarget::File { directory } => {
            let dir = Path::new(directory);
            let appender = rolling::Builder::new()
                .rotation(rolling::Rotation::DAILY)
                .filename_prefix("nutdrv")
                .filename_suffix("log")
                .max_log_files(7)
                .build(dir)
                .map_err(|e| NutError::config(format!("failed to open log directory: {e}")))?;
            let (non_blocking_appender, guard) = non_blocking(appender);
            let _ = LOG_GUARD.set(guard);
            BoxMakeWriter::new(non_blocking_appender)
        }
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_filter(LevelFilter::from_level(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();

    tracing::info!(?level, "logging initialized");
    Ok(())
}

/// Context carried on every line emitted by a [`StructuredLogger`].
#[derive(Debug, Clone, Default)]
pub struct LogContext {
    pub component: String,
    pub upsname: Option<String>,
    pub extra_fields: std::collections::HashMap<String, String>,
}

impl LogContext {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            upsname: None,
            extra_fields: std::collections::HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_upsname(mut self, upsname: String) -> Self {
        self.upsname = Some(upsname);
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: &str, value: String) -> Self {
        self.extra_fields.insert(key.to_string(), value);
        self
    }
}

/// A logger bound to a fixed [`LogContext`], so call sites don't have to
/// repeat `upsname=...` on every line.
#[derive(Clone)]
pub struct StructuredLogger {
    context: LogContext,
}

impl StructuredLogger {
    pub fn new(context: LogContext) -> Self {
        Self { context }
    }

    pub fn info(&self, message: &str) {
        let fields = self.format_fields();
        tracing::info!(%fields, "{}", message);
    }

    pub fn warn(&self, message: &str) {
        let fields = self.format_fields();
        tracing::warn!(%fields, "{}", message);
    }

    pub fn error(&self, message: &str) {
        let fields = self.format_fields();
        tracing::error!(%fields, "{}", message);
    }

    pub fn debug(&self, message: &str) {
        let fields = self.format_fields();
        tracing::debug!(%fields, "{}", message);
    }

    pub fn trace(&self, message: &str) {
        let fields = self.format_fields();
        tracing::trace!(%fields, "{}", message);
    }

    fn format_fields(&self) -> String {
        let mut fields = vec![format!("component={}", self.context.component)];
        if let Some(ref upsname) = self.context.upsname {
            fields.push(format!("upsname={upsname}"));
        }
        for (key, value) in &self.context.extra_fields {
            fields.push(format!("{key}={value}"));
        }
        fields.join(",")
    }
}

pub fn get_logger(component: &str) -> StructuredLogger {
    StructuredLogger::new(LogContext::new(component))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_level_takes_the_more_verbose_input() {
        assert_eq!(resolve_level(0, 0), Level::INFO);
        assert_eq!(resolve_level(1, 0), Level::DEBUG);
        assert_eq!(resolve_level(0, 2), Level::TRACE);
        assert_eq!(resolve_level(3, 1), Level::TRACE);
    }

    #[test]
    fn log_context_builder() {
        let ctx = LogContext::new("ctrlsocket")
            .with_upsname("ups1".to_string())
            .with_field("peer", "3".to_string());
        assert_eq!(ctx.component, "ctrlsocket");
        assert_eq!(ctx.upsname, Some("ups1".to_string()));
        assert_eq!(ctx.extra_fields.get("peer"), Some(&"3".to_string()));
    }
}
