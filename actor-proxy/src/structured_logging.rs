//! Logging setup shared by the daemon, the client commands and served actors
//!
//! Logs go to stderr since `call` and `commands` print their results on
//! stdout.

use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::constants;

/// Initialize tracing.
///
/// With `enable_dev_log`, logs go at debug level to [`constants::dev_log_path`]
/// and the returned guard must be held until exit so the last lines are
/// flushed. Otherwise `RUST_LOG` filters what reaches stderr.
pub fn init_tracing(
    enable_dev_log: bool,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    if enable_dev_log {
        use std::fs::OpenOptions;
        use tracing_appender::non_blocking;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(constants::dev_log_path())?;

        let (file_writer, guard) = non_blocking(file);

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG),
            )
            .try_init()?;

        eprintln!(
            "Development logging enabled - writing to {} (PID: {})",
            constants::dev_log_path().display(),
            std::process::id()
        );

        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(tracing_subscriber::EnvFilter::from_default_env()),
            )
            .try_init()?;

        Ok(None)
    }
}
