//! courier-logger: JSON structured logger behind the broker `Logger` capability
//!
//! Each `ApiLogger` owns a private `tracing` dispatcher, so building one never
//! touches the global subscriber.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::sync::Arc;

use courier_broker::{Level, Logger, LoggerError};
use courier_metadata::LoggingConfig;
use serde_json::{Map, Value};
use tracing::level_filters::LevelFilter;
use tracing::{Dispatch, Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::registry::LookupSpan;

#[derive(Debug, Clone, PartialEq)]
pub struct LoggerOptions {
    /// Records below this level are dropped
    pub level: Level,
    /// Adds file, line and target to every record
    pub development_mode: bool,
    pub initial_fields: BTreeMap<String, serde_json::Value>,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            level: Level::Info,
            development_mode: false,
            initial_fields: BTreeMap::new(),
        }
    }
}

impl From<&LoggingConfig> for LoggerOptions {
    fn from(config: &LoggingConfig) -> Self {
        Self {
            level: config.level,
            development_mode: config.development_mode,
            initial_fields: config.initial_fields.clone(),
        }
    }
}

/// Adds fixed top-level keys to every JSON record. Keys the event already
/// carries are left alone.
struct InitialFields<F> {
    inner: F,
    fields: Map<String, Value>,
}

impl<S, N, F> FormatEvent<S, N> for InitialFields<F>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    F: FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        if self.fields.is_empty() {
            return self.inner.format_event(ctx, writer, event);
        }

        let mut line = String::new();
        self.inner.format_event(ctx, Writer::new(&mut line), event)?;
        let mut record: Map<String, Value> =
            serde_json::from_str(line.trim_end()).map_err(|_| fmt::Error)?;
        for (key, value) in &self.fields {
            record.entry(key.clone()).or_insert_with(|| value.clone());
        }
        let line = serde_json::to_string(&record).map_err(|_| fmt::Error)?;
        writeln!(writer, "{line}")
    }
}

pub struct ApiLogger {
    level: Level,
    dispatch: Dispatch,
}

impl ApiLogger {
    /// Logger writing JSON lines to stdout.
    pub fn new(opts: &LoggerOptions) -> Result<Arc<dyn Logger>, LoggerError> {
        Ok(Arc::new(Self::with_writer(opts, std::io::stdout)?))
    }

    pub fn with_writer<W>(opts: &LoggerOptions, writer: W) -> Result<Self, LoggerError>
    where
        W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
    {
        let format = tracing_subscriber::fmt::format()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_target(opts.development_mode)
            .with_file(opts.development_mode)
            .with_line_number(opts.development_mode);

        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_max_level(LevelFilter::DEBUG)
            .with_writer(writer)
            .event_format(InitialFields {
                inner: format,
                fields: opts.initial_fields.clone().into_iter().collect(),
            })
            .finish();

        Ok(Self {
            level: opts.level,
            dispatch: Dispatch::new(subscriber),
        })
    }

    pub fn level(&self) -> Level {
        self.level
    }
}

impl Logger for ApiLogger {
    fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if level < self.level {
            return;
        }
        tracing::dispatcher::with_default(&self.dispatch, || match level {
            Level::Debug => tracing::debug!(severity = %level, "{}", args),
            Level::Info => tracing::info!(severity = %level, "{}", args),
            Level::Warn => tracing::warn!(severity = %level, "{}", args),
            Level::Error | Level::Panic | Level::Fatal => {
                tracing::error!(severity = %level, "{}", args)
            }
        });
    }

    fn sync(&self) -> Result<(), LoggerError> {
        std::io::stdout().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Buffer {
        fn lines(&self) -> Vec<serde_json::Value> {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Buffer {
        type Writer = Buffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn logger_with(opts: LoggerOptions) -> (ApiLogger, Buffer) {
        let buffer = Buffer::default();
        let logger = ApiLogger::with_writer(&opts, buffer.clone()).unwrap();
        (logger, buffer)
    }

    #[test]
    fn test_writes_json_with_initial_fields() {
        let mut initial_fields = BTreeMap::new();
        initial_fields.insert("release".to_string(), serde_json::json!("v1.0.0"));
        let (logger, buffer) = logger_with(LoggerOptions {
            level: Level::Debug,
            development_mode: false,
            initial_fields,
        });

        logger.infof(format_args!("connected to {}", "mem://a"));

        let lines = buffer.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["message"], "connected to mem://a");
        assert_eq!(lines[0]["severity"], "info");
        assert_eq!(lines[0]["level"], "INFO");
        assert_eq!(lines[0]["release"], "v1.0.0");
    }

    #[test]
    fn test_initial_fields_do_not_override_event_keys() {
        let mut initial_fields = BTreeMap::new();
        initial_fields.insert("message".to_string(), serde_json::json!("shadowed"));
        initial_fields.insert("shard".to_string(), serde_json::json!(3));
        let (logger, buffer) = logger_with(LoggerOptions {
            initial_fields,
            ..Default::default()
        });

        logger.warn("disk almost full");

        let lines = buffer.lines();
        assert_eq!(lines[0]["message"], "disk almost full");
        assert_eq!(lines[0]["shard"], 3);
        assert_eq!(lines[0]["severity"], "warn");
    }

    #[test]
    fn test_records_below_level_are_dropped() {
        let (logger, buffer) = logger_with(LoggerOptions {
            level: Level::Warn,
            ..Default::default()
        });

        logger.debug("dropped");
        logger.info("dropped");
        logger.warn("kept");
        logger.error("kept too");

        let lines = buffer.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["severity"], "warn");
        assert_eq!(lines[1]["severity"], "error");
    }

    #[test]
    fn test_development_mode_adds_location() {
        let (logger, buffer) = logger_with(LoggerOptions {
            development_mode: true,
            ..Default::default()
        });
        logger.info("where am i");

        let lines = buffer.lines();
        assert!(lines[0].get("filename").is_some());
        assert!(lines[0].get("line_number").is_some());
    }

    #[test]
    fn test_panic_is_logged_then_raised() {
        let (logger, buffer) = logger_with(LoggerOptions::default());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            logger.panic("testing");
        }));
        assert!(result.is_err());

        let lines = buffer.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["severity"], "panic");
        assert_eq!(lines[0]["level"], "ERROR");
    }

    #[test]
    fn test_options_from_config() {
        let config = LoggingConfig {
            level: Level::Error,
            development_mode: true,
            initial_fields: BTreeMap::new(),
        };
        let opts = LoggerOptions::from(&config);
        assert_eq!(opts.level, Level::Error);
        assert!(opts.development_mode);
    }

    #[test]
    fn test_new_returns_capability() {
        let logger = ApiLogger::new(&LoggerOptions::default()).unwrap();
        assert!(logger.sync().is_ok());
    }
}
