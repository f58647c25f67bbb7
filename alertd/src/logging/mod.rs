//! Logging setup.
//!
//! Console output always; a daily-rolling log file when a log directory is
//! given. Both use local timezone timestamps. `RUST_LOG` overrides the
//! default filter.

use std::path::Path;

use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "alertd=info,alert_queue=info";

/// Filter directive used for `-v`.
pub const VERBOSE_LOG_FILTER: &str = "alertd=debug,alert_queue=debug";

/// Filter directive used for `-vv` and more.
pub const TRACE_LOG_FILTER: &str = "alertd=trace,alert_queue=trace";

const LOG_FILE_PREFIX: &str = "alertd.log";

/// Custom timer that uses the local timezone via chrono.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Filter directive for a `-v` count.
pub fn filter_for_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => DEFAULT_LOG_FILTER,
        1 => VERBOSE_LOG_FILTER,
        _ => TRACE_LOG_FILTER,
    }
}

/// Initialize logging.
///
/// Returns the file writer guard when logging to a file; keep it alive for
/// the lifetime of the process.
pub fn init_logging(log_dir: Option<&Path>, verbose: u8) -> crate::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_for_verbosity(verbose)));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(file_layer)
        .try_init()
        .map_err(|e| crate::Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert!(DEFAULT_LOG_FILTER.contains("alertd=info"));
        assert!(DEFAULT_LOG_FILTER.contains("alert_queue=info"));
    }

    #[test]
    fn test_filter_for_verbosity() {
        assert_eq!(filter_for_verbosity(0), DEFAULT_LOG_FILTER);
        assert_eq!(filter_for_verbosity(1), VERBOSE_LOG_FILTER);
        assert_eq!(filter_for_verbosity(5), TRACE_LOG_FILTER);
        for verbose in 0..3 {
            assert!(EnvFilter::try_new(filter_for_verbosity(verbose)).is_ok());
        }
    }
}
