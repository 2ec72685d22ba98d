// Logging for conduit pipelines
//
// Built on the `tracing` ecosystem. The orchestrating code initialises a global
// subscriber once; forked worker instances inherit it and log inside an
// `instance_span!` carrying their role, index and pid.
//
// # Usage Examples
//
// ```rust
// use conduit::logging;
//
// // INFO level, human-readable console output
// logging::init_default();
//
// // Or from a loaded pipeline config
// let config = logging::LogConfig {
//     level: tracing::Level::DEBUG,
//     json_format: false,
//     ..Default::default()
// };
// logging::init(config);
// ```
//
// ```rust
// use conduit::{log_lifecycle, pool_span};
//
// let span = pool_span!("telemetry", 1);
// let _guard = span.enter();
// log_lifecycle!("telemetry", 0, "started");
// ```

use std::io;
use std::path::Path;
use std::sync::Once;

use tracing::{Level, Subscriber};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Configuration for the logging system.
///
/// ```rust
/// use conduit::logging::LogConfig;
/// use tracing::Level;
///
/// let custom_config = LogConfig {
///     level: Level::DEBUG,
///     json_format: true,
///     show_file_line: false,
///     show_thread_info: true,
///     show_time: true,
///     target_filters: Some("conduit=debug,conduit::pool=trace".to_string()),
/// };
/// ```
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: Level,
    /// Whether to use JSON format for logs
    pub json_format: bool,
    /// Whether to include file and line information
    pub show_file_line: bool,
    /// Whether to include thread name/id. Worker threads are named `<role>-<index>`.
    pub show_thread_info: bool,
    /// Whether to include timestamps
    pub show_time: bool,
    /// Target filter expressions (format: "target=level,target2=level2,...")
    pub target_filters: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            show_file_line: true,
            show_thread_info: true,
            show_time: true,
            target_filters: None,
        }
    }
}

// Initialization guard to ensure we only initialize once
static INIT: Once = Once::new();

fn build_filter(config: &LogConfig) -> EnvFilter {
    let mut env_filter = EnvFilter::from_default_env().add_directive(config.level.into());

    if let Some(filters) = &config.target_filters {
        for filter in filters.split(',') {
            if let Ok(directive) = filter.trim().parse() {
                env_filter = env_filter.add_directive(directive);
            }
        }
    }
    env_filter
}

/// Initialize the global subscriber.
///
/// Safe to call multiple times; only the first call takes effect.
pub fn init(config: LogConfig) {
    INIT.call_once(|| {
        let registry = tracing_subscriber::registry().with(build_filter(&config));

        let subscriber: Box<dyn Subscriber + Send + Sync> = match (config.json_format, config.show_time) {
            (true, _) => Box::new(registry.with(fmt::layer().json().flatten_event(true))),
            (false, true) => Box::new(
                registry.with(
                    fmt::layer()
                        .with_ansi(atty::is(atty::Stream::Stdout))
                        .with_file(config.show_file_line)
                        .with_line_number(config.show_file_line)
                        .with_thread_names(config.show_thread_info)
                        .with_thread_ids(config.show_thread_info),
                ),
            ),
            (false, false) => Box::new(
                registry.with(
                    fmt::layer()
                        .without_time()
                        .with_ansi(atty::is(atty::Stream::Stdout))
                        .with_file(config.show_file_line)
                        .with_line_number(config.show_file_line)
                        .with_thread_names(config.show_thread_info)
                        .with_thread_ids(config.show_thread_info),
                ),
            ),
        };

        set_global_subscriber(subscriber);
    });
}

fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error setting global tracing subscriber: {err}");
    }
}

/// Open `path` for appending, creating it if needed.
pub fn file_writer(path: &Path) -> io::Result<std::fs::File> {
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

/// Initialize logging to both the console and `log_file`.
///
/// Returns an error if the file cannot be opened for appending.
pub fn init_with_file(config: LogConfig, log_file: &Path) -> io::Result<()> {
    let file = file_writer(log_file)?;

    INIT.call_once(|| {
        let console_layer = fmt::layer()
            .with_ansi(atty::is(atty::Stream::Stdout))
            .with_file(config.show_file_line)
            .with_line_number(config.show_file_line)
            .with_thread_names(config.show_thread_info)
            .with_thread_ids(config.show_thread_info);

        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .with_file(true)
            .with_line_number(true)
            .with_thread_names(true)
            .with_thread_ids(true);

        let subscriber = tracing_subscriber::registry()
            .with(build_filter(&config))
            .with(console_layer)
            .with(file_layer);

        set_global_subscriber(subscriber);
    });

    Ok(())
}

/// INFO level, human-readable console output.
pub fn init_default() {
    init(LogConfig::default());
}

/// DEBUG level with trace output for pool and worker internals.
pub fn init_development() {
    init(LogConfig {
        level: Level::DEBUG,
        target_filters: Some("conduit=debug,conduit::pool=trace,conduit::worker=trace".to_string()),
        ..Default::default()
    });
}

/// JSON output without file/line information, for log aggregators.
pub fn init_production() {
    init(LogConfig {
        level: Level::INFO,
        json_format: true,
        show_file_line: false,
        show_thread_info: true,
        show_time: true,
        target_filters: None,
    });
}

/// Warnings and errors only, compact, for test runs.
pub fn init_test() {
    init(LogConfig {
        level: Level::WARN,
        json_format: false,
        show_file_line: true,
        show_thread_info: false,
        show_time: false,
        target_filters: None,
    });
}

/// Span covering the lifetime of one worker pool.
///
/// ```rust
/// let span = conduit::pool_span!("command", 2);
/// let _guard = span.enter();
/// ```
#[macro_export]
macro_rules! pool_span {
    ($role:expr, $count:expr) => {
        tracing::info_span!("pool", role = $role, count = $count)
    };
    ($role:expr, $count:expr, $($fields:tt)*) => {
        tracing::info_span!("pool", role = $role, count = $count, $($fields)*)
    };
}

/// Span entered by each worker instance for its whole run.
#[macro_export]
macro_rules! instance_span {
    ($role:expr, $index:expr) => {
        tracing::info_span!("worker", role = $role, instance = $index)
    };
    ($role:expr, $index:expr, $($fields:tt)*) => {
        tracing::info_span!("worker", role = $role, instance = $index, $($fields)*)
    };
}

/// Log worker instance lifecycle events (started, stopped, crashed).
///
/// ```rust
/// conduit::log_lifecycle!("telemetry", 0, "started");
/// conduit::log_lifecycle!("telemetry", 0, "stopped", iterations = 12);
/// ```
#[macro_export]
macro_rules! log_lifecycle {
    ($role:expr, $index:expr, $event:expr) => {
        tracing::info!(role = $role, instance = $index, event = $event);
    };
    ($role:expr, $index:expr, $event:expr, $($fields:tt)*) => {
        tracing::info!(role = $role, instance = $index, event = $event, $($fields)*);
    };
}

/// Log queue events such as drains.
#[macro_export]
macro_rules! log_queue {
    ($queue:expr, $event:expr) => {
        tracing::debug!(queue = $queue, event = $event);
    };
    ($queue:expr, $event:expr, $($fields:tt)*) => {
        tracing::debug!(queue = $queue, event = $event, $($fields)*);
    };
}

/// Log an error with optional context fields.
///
/// ```rust
/// let error = std::io::Error::new(std::io::ErrorKind::NotFound, "link down");
/// conduit::log_error!(error, role = "heartbeat_sender");
/// ```
#[macro_export]
macro_rules! log_error {
    ($error:expr) => {
        tracing::error!(error = %$error);
    };
    ($error:expr, $($fields:tt)*) => {
        tracing::error!(error = %$error, $($fields)*);
    };
}
