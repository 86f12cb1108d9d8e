//! Logging for the pledge runners.
//!
//! Built on `tracing`. Queue threads inherit the dispatcher of the thread that
//! started them, and the `promise_span!`, `queue_span!`, `log_queue!`,
//! `log_pool!` and `log_error!` macros keep field names consistent across the
//! crate.
//!
//! A worker process speaks its wire protocol on stdout, so it logs to stderr:
//!
//! ```rust
//! use pledge::logging;
//!
//! logging::init(logging::LogConfig {
//!     to_stderr: true,
//!     ..Default::default()
//! });
//! pledge::log_queue!(3, "started");
//! ```

use std::io;
use std::sync::Once;

use tracing::{Level, Subscriber};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

/// Configuration for the pledge logging system
///
/// # Examples
///
/// ```rust
/// use pledge::logging::LogConfig;
/// use tracing::Level;
///
/// let custom_config = LogConfig {
///     level: Level::DEBUG,
///     json_format: true,
///     target_filters: Some("pledge::queue=trace".to_string()),
///     ..Default::default()
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
    /// Whether to include thread name/id
    pub show_thread_info: bool,
    /// Whether to include timestamps
    pub show_time: bool,
    /// Write to stderr instead of stdout
    pub to_stderr: bool,
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
            to_stderr: false,
            target_filters: None,
        }
    }
}

// Initialization guard to ensure we only initialize once
static INIT: Once = Once::new();

fn env_filter(config: &LogConfig) -> EnvFilter {
    let mut env_filter = EnvFilter::from_default_env().add_directive(config.level.into());

    // Add any target-specific filters if provided
    if let Some(filters) = &config.target_filters {
        for filter in filters.split(',') {
            if let Ok(directive) = filter.trim().parse() {
                env_filter = env_filter.add_directive(directive);
            }
        }
    }
    env_filter
}

fn console_writer(to_stderr: bool) -> (BoxMakeWriter, bool) {
    if to_stderr {
        (BoxMakeWriter::new(io::stderr), atty::is(atty::Stream::Stderr))
    } else {
        (BoxMakeWriter::new(io::stdout), atty::is(atty::Stream::Stdout))
    }
}

fn console_layer<S>(config: &LogConfig) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let (writer, ansi) = console_writer(config.to_stderr);

    if config.json_format {
        return fmt::layer()
            .json()
            .flatten_event(true)
            .with_writer(writer)
            .boxed();
    }

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_file(config.show_file_line)
        .with_line_number(config.show_file_line)
        .with_thread_names(config.show_thread_info)
        .with_thread_ids(config.show_thread_info);

    if config.show_time {
        layer.boxed()
    } else {
        layer.without_time().boxed()
    }
}

/// Initialize the logging system with the given configuration
///
/// It's safe to call multiple times; only the first call will take effect.
pub fn init(config: LogConfig) {
    INIT.call_once(|| {
        let subscriber = tracing_subscriber::registry()
            .with(env_filter(&config))
            .with(console_layer(&config));

        if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("Error setting global tracing subscriber: {}", err);
        }
    });
}

/// Warnings and errors only, without timestamps.
pub fn init_test() {
    let config = LogConfig {
        level: Level::WARN,
        json_format: false,
        show_file_line: true,
        show_thread_info: false,
        show_time: false,
        to_stderr: false,
        target_filters: None,
    };
    init(config);
}

/// Create a span around the execution of one promise
///
/// ```rust
/// let span = pledge::promise_span!("0f0c8d4e");
/// let _guard = span.enter();
///
/// let span = pledge::promise_span!("0f0c8d4e", queue = 2);
/// ```
#[macro_export]
macro_rules! promise_span {
    ($promise_id:expr) => {
        $crate::logging::debug_span!("promise", id = %$promise_id)
    };
    ($promise_id:expr, $($fields:tt)*) => {
        $crate::logging::debug_span!("promise", id = %$promise_id, $($fields)*)
    };
}

/// Create a span for the lifetime of a queue's consumer thread
#[macro_export]
macro_rules! queue_span {
    ($queue:expr) => {
        $crate::logging::info_span!("queue", index = $queue)
    };
    ($queue:expr, $($fields:tt)*) => {
        $crate::logging::info_span!("queue", index = $queue, $($fields)*)
    };
}

/// Log queue lifecycle events
///
/// ```rust
/// pledge::log_queue!(1, "started");
/// pledge::log_queue!(1, "stopped", reason = "idle");
/// ```
#[macro_export]
macro_rules! log_queue {
    ($queue:expr, $event:expr) => {
        $crate::logging::debug!(queue = $queue, event = $event)
    };
    ($queue:expr, $event:expr, $($fields:tt)*) => {
        $crate::logging::debug!(queue = $queue, event = $event, $($fields)*)
    };
}

/// Log pool events
#[macro_export]
macro_rules! log_pool {
    ($pool:expr, $event:expr) => {
        $crate::logging::info!(pool = $pool, event = $event)
    };
    ($pool:expr, $event:expr, $($fields:tt)*) => {
        $crate::logging::info!(pool = $pool, event = $event, $($fields)*)
    };
}

/// Log error events - use for all error conditions
///
/// ```rust
/// let error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
/// pledge::log_error!(error);
/// pledge::log_error!(error, queue = 4);
/// ```
#[macro_export]
macro_rules! log_error {
    ($error:expr) => {
        $crate::logging::error!(error = %$error)
    };
    ($error:expr, $($fields:tt)*) => {
        $crate::logging::error!(error = %$error, $($fields)*)
    };
}

/// Get the current tracing dispatcher
///
/// Queue threads capture it at spawn time so their events reach the same
/// subscriber as the spawning thread.
#[inline]
pub fn current_subscriber() -> tracing::Dispatch {
    tracing::dispatcher::get_default(|d| d.clone())
}

// Re-export the most commonly used tracing macros for convenience
pub use tracing::{debug, debug_span, error, info, info_span, trace, warn};
