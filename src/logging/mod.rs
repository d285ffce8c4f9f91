//! Logging infrastructure - structured tracing for the collector
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable log levels via environment
//! - Zero-cost when disabled
//! - Optional JSON and file output
//! - Span-based performance tracking

use once_cell::sync::OnceCell;
use std::io;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

// Re-export tracing macros for use throughout the crate
pub use tracing::{debug, error, info, trace, warn};

/// Global logging state. Holds the appender guard so buffered file output
/// is flushed for the lifetime of the process.
static LOGGER_INITIALIZED: OnceCell<Option<WorkerGuard>> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Log file path (console output when `None`)
    pub log_path: Option<String>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // NLIB_GC_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("NLIB_GC_LOG_LEVEL") {
            config.level = parse_level(&level_str);
        }

        if let Ok(path) = std::env::var("NLIB_GC_LOG_FILE") {
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("NLIB_GC_LOG_JSON").is_ok();
        config.show_spans = std::env::var("NLIB_GC_LOG_SPANS").is_ok();

        config
    }

    /// Minimal logging for hot production paths
    pub fn performance() -> Self {
        Self {
            level: Level::ERROR,
            ..Self::default()
        }
    }

    /// Verbose logging including per-object refcount traffic
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            log_path: Some("nlib_gc.log".to_string()),
            json_format: false,
            show_spans: true,
        }
    }
}

fn parse_level(s: &str) -> Level {
    match s.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with configuration read from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration (idempotent)
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = config.level.as_str().to_lowercase();
            EnvFilter::new(format!("nlib_gc={level},gc={level}"))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let (writer, guard) = match config.log_path.as_deref() {
            Some(path) => {
                let path = Path::new(path);
                let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
                let file = path.file_name().map(|f| f.to_os_string()).unwrap_or_else(|| "nlib_gc.log".into());
                let appender = tracing_appender::rolling::never(dir.unwrap_or_else(|| Path::new(".")), file);
                let (nb, guard) = tracing_appender::non_blocking(appender);
                (tracing_subscriber::fmt::writer::BoxMakeWriter::new(nb), Some(guard))
            }
            None => (tracing_subscriber::fmt::writer::BoxMakeWriter::new(io::stdout), None),
        };

        let layer = fmt::layer()
            .with_writer(writer)
            .with_span_events(span_events)
            .with_target(true)
            .with_thread_ids(cfg!(debug_assertions))
            .with_line_number(cfg!(debug_assertions));

        let layer = if config.json_format {
            layer.json().boxed()
        } else {
            layer.compact().boxed()
        };

        // Ignore the error if the host already installed a global subscriber
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init()
            .ok();

        guard
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Collector event helpers
// ============================================================================

/// Log GC cycle start
pub fn log_gc_start(registered: usize, roots: usize, force: bool) {
    debug!(
        target: "gc",
        event = "gc_start",
        registered,
        roots,
        force,
        "Starting garbage collection cycle"
    );
}

/// Log GC mark phase
pub fn log_gc_mark(marked: usize) {
    debug!(
        target: "gc",
        event = "gc_mark",
        objects_marked = marked,
        "GC mark phase complete"
    );
}

/// Log GC sweep phase
pub fn log_gc_sweep(swept: usize, bytes_reclaimed: usize) {
    debug!(
        target: "gc",
        event = "gc_sweep",
        objects_swept = swept,
        bytes_reclaimed,
        "GC sweep phase complete"
    );
}

/// Log GC cycle completion
pub fn log_gc_complete(duration_us: u64, collected: usize, alive: usize) {
    info!(
        target: "gc",
        event = "gc_complete",
        objects_collected = collected,
        objects_alive = alive,
        duration_us,
        "Garbage collection cycle complete"
    );
}

/// Performance tracking utilities
pub mod perf {
    use std::time::Instant;
    use tracing::debug;

    /// Track operation duration (returns guard that logs on drop)
    #[must_use]
    pub fn track(operation: &'static str) -> PerformanceGuard {
        PerformanceGuard {
            operation,
            start: Instant::now(),
        }
    }

    pub struct PerformanceGuard {
        operation: &'static str,
        start: Instant,
    }

    impl Drop for PerformanceGuard {
        fn drop(&mut self) {
            let elapsed = self.start.elapsed();
            debug!(
                operation = self.operation,
                duration_us = elapsed.as_micros() as u64,
                "operation completed"
            );
        }
    }
}
