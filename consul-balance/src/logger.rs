//! The logging capability handed to [`LoadBalancingClient`](crate::LoadBalancingClient).

use std::error::Error as StdError;
use std::fmt;

/// Severity of a log record, from most to least serious.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self {
            Severity::Fatal => "fatal",
            Severity::Error => "error",
            Severity::Warn => "warn",
            Severity::Info => "info",
            Severity::Debug => "debug",
        };
        f.write_str(level)
    }
}

/// Sink for the client's operational messages.
///
/// Only [`Logger::log`] has to be implemented, the per-severity helpers forward to it.
pub trait Logger: Send + Sync {
    fn log(&self, severity: Severity, message: &str, error: Option<&(dyn StdError + 'static)>);

    fn fatal(&self, message: &str, error: Option<&(dyn StdError + 'static)>) {
        self.log(Severity::Fatal, message, error)
    }

    fn error(&self, message: &str, error: Option<&(dyn StdError + 'static)>) {
        self.log(Severity::Error, message, error)
    }

    fn warn(&self, message: &str, error: Option<&(dyn StdError + 'static)>) {
        self.log(Severity::Warn, message, error)
    }

    fn info(&self, message: &str, error: Option<&(dyn StdError + 'static)>) {
        self.log(Severity::Info, message, error)
    }

    fn debug(&self, message: &str, error: Option<&(dyn StdError + 'static)>) {
        self.log(Severity::Debug, message, error)
    }
}

/// Default [`Logger`] that forwards every record to [`tracing`].
///
/// `tracing` has no fatal level: fatal records are emitted at error level with `fatal = true`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, severity: Severity, message: &str, error: Option<&(dyn StdError + 'static)>) {
        match (severity, error) {
            (Severity::Fatal, Some(err)) => {
                tracing::error!(fatal = true, error = %err, "{}", message)
            }
            (Severity::Fatal, None) => tracing::error!(fatal = true, "{}", message),
            (Severity::Error, Some(err)) => tracing::error!(error = %err, "{}", message),
            (Severity::Error, None) => tracing::error!("{}", message),
            (Severity::Warn, Some(err)) => tracing::warn!(error = %err, "{}", message),
            (Severity::Warn, None) => tracing::warn!("{}", message),
            (Severity::Info, Some(err)) => tracing::info!(error = %err, "{}", message),
            (Severity::Info, None) => tracing::info!("{}", message),
            (Severity::Debug, Some(err)) => tracing::debug!(error = %err, "{}", message),
            (Severity::Debug, None) => tracing::debug!("{}", message),
        }
    }
}
