// Logging setup for herald
//
// Library code only emits `tracing` events; nothing is printed unless the
// embedding application installs a subscriber. This module offers a
// ready-made one built on `tracing-subscriber`.
//
// ```rust,no_run
// use herald::logging::{self, LogConfig};
//
// // Console output at INFO, RUST_LOG still honoured
// logging::init(LogConfig::default())?;
//
// // Or: per-dispatch tracing for herald, colored, with file/line
// logging::init(LogConfig::development())?;
// ```
//
// Event levels used by the crate:
// - `trace`: every enqueue and dispatch
// - `debug`: looper prepare/start/stop, pool prefill, thread exit
// - `warn`:  messages refused by a quitting queue, slow dispatches
// - `error`: panics in idle handlers and looper threads

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use tracing::{Level, Subscriber};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

/// Configuration for [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum level for every target not named in `target_filters`.
    pub level: Level,
    /// Emit JSON lines on the console instead of human-readable text.
    pub json_format: bool,
    pub show_file_line: bool,
    /// Include thread names and ids. Useful since every looper owns a thread.
    pub show_thread_info: bool,
    /// Extra directives, e.g. `"herald::looper=trace,herald::queue=debug"`.
    pub target_filters: Option<String>,
    /// Also append plain-text output to this file.
    pub log_file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            show_file_line: false,
            show_thread_info: true,
            target_filters: None,
            log_file: None,
        }
    }
}

impl LogConfig {
    /// DEBUG everywhere, TRACE for herald, with source locations.
    pub fn development() -> Self {
        Self {
            level: Level::DEBUG,
            show_file_line: true,
            target_filters: Some("herald=trace".to_string()),
            ..Default::default()
        }
    }

    /// INFO, JSON lines, no source locations.
    pub fn production() -> Self {
        Self {
            json_format: true,
            ..Default::default()
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

static INIT: Once = Once::new();

/// Install the global subscriber described by `config`.
///
/// Only the first call has any effect. Fails if the log file cannot be
/// opened; in that case no subscriber is installed.
pub fn init(config: LogConfig) -> io::Result<()> {
    let file = match &config.log_file {
        Some(path) => Some(open_log_file(path)?),
        None => None,
    };

    INIT.call_once(|| {
        let filter = env_filter(&config);

        let console: Box<dyn Layer<_> + Send + Sync> = if config.json_format {
            fmt::layer()
                .json()
                .flatten_event(true)
                .with_file(config.show_file_line)
                .with_line_number(config.show_file_line)
                .with_thread_names(config.show_thread_info)
                .with_thread_ids(config.show_thread_info)
                .boxed()
        } else {
            fmt::layer()
                .with_ansi(atty::is(atty::Stream::Stdout))
                .with_file(config.show_file_line)
                .with_line_number(config.show_file_line)
                .with_thread_names(config.show_thread_info)
                .with_thread_ids(config.show_thread_info)
                .boxed()
        };

        let file_layer = file.map(|file| {
            fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_thread_ids(true)
        });

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .with(file_layer);
        set_global_subscriber(subscriber);
    });
    Ok(())
}

fn env_filter(config: &LogConfig) -> EnvFilter {
    let mut filter = EnvFilter::from_default_env().add_directive(config.level.into());
    if let Some(filters) = &config.target_filters {
        for directive in filters.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            match directive.parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(err) => eprintln!("Ignoring invalid log directive {directive:?}: {err}"),
            }
        }
    }
    filter
}

fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error setting global tracing subscriber: {err}");
    }
}
