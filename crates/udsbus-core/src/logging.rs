//! Engine log events.
//!
//! The engine logs through `tracing`. Embedders that cannot install a
//! subscriber (or want the events in their own pipeline) can additionally
//! register a [`LogSink`], which receives every event as
//! `(level, unix_millis, message)`.

use std::fmt;
use std::sync::Arc;

/// Severity of a forwarded log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// Callback receiving `(level, unix_millis, message)`.
pub type LogSink = Arc<dyn Fn(LogLevel, i64, &str) + Send + Sync>;

/// Forwards engine events to the optional sink.
#[derive(Clone, Default)]
pub struct Logger {
    sink: Option<LogSink>,
}

impl Logger {
    pub fn new(sink: Option<LogSink>) -> Self {
        Self { sink }
    }

    /// Deliver an already-formatted event to the sink, if any.
    pub fn forward(&self, level: LogLevel, message: &str) {
        if let Some(ref sink) = self.sink {
            sink(level, chrono::Utc::now().timestamp_millis(), message);
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

/// Emit an event through `tracing` and the logger's sink.
///
/// ```rust,ignore
/// emit!(self.logger, INFO, "broker listening on {}", path.display());
/// ```
macro_rules! emit {
    ($logger:expr, $level:ident, $($arg:tt)+) => {{
        let message = format!($($arg)+);
        tracing::event!(tracing::Level::$level, "{}", message);
        $logger.forward($crate::logging::LogLevel::from(tracing::Level::$level), &message);
    }};
}

pub(crate) use emit;
