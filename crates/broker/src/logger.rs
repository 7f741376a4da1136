//! Structured logging capability consumed by brokers.
//!
//! Backends only see `Arc<dyn Logger>`. The default, [`TracingLogger`],
//! forwards onto the `tracing` macros and leaves subscriber setup to the
//! application.

use std::fmt;

pub use courier_metadata::Level;

use crate::error::LoggerError;

pub trait Logger: Send + Sync {
    fn log(&self, level: Level, args: fmt::Arguments<'_>);

    /// Flush any buffered records.
    fn sync(&self) -> Result<(), LoggerError>;

    fn debug(&self, msg: &str) {
        self.log(Level::Debug, format_args!("{msg}"));
    }

    fn debugf(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }

    fn info(&self, msg: &str) {
        self.log(Level::Info, format_args!("{msg}"));
    }

    fn infof(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    fn warn(&self, msg: &str) {
        self.log(Level::Warn, format_args!("{msg}"));
    }

    fn warnf(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    fn error(&self, msg: &str) {
        self.log(Level::Error, format_args!("{msg}"));
    }

    fn errorf(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }

    /// Log at panic level, then panic with the same message.
    fn panic(&self, msg: &str) -> ! {
        self.panicf(format_args!("{msg}"))
    }

    fn panicf(&self, args: fmt::Arguments<'_>) -> ! {
        let msg = args.to_string();
        self.log(Level::Panic, format_args!("{msg}"));
        panic!("{msg}")
    }

    /// Log at fatal level, flush, and exit the process with status 1.
    fn fatal(&self, msg: &str) -> ! {
        self.fatalf(format_args!("{msg}"))
    }

    fn fatalf(&self, args: fmt::Arguments<'_>) -> ! {
        self.log(Level::Fatal, args);
        let _ = self.sync();
        std::process::exit(1)
    }
}

/// Forwards every call to the globally installed `tracing` subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        match level {
            Level::Debug => tracing::debug!("{}", args),
            Level::Info => tracing::info!("{}", args),
            Level::Warn => tracing::warn!("{}", args),
            Level::Error => tracing::error!("{}", args),
            Level::Panic | Level::Fatal => tracing::error!(severity = %level, "{}", args),
        }
    }

    fn sync(&self) -> Result<(), LoggerError> {
        Ok(())
    }
}
