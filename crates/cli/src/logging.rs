//! Logging setup for CLI commands.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use weft_core::dirs::LOG_DIR;

fn log_dir() -> PathBuf {
  std::env::current_dir()
    .unwrap_or_else(|_| PathBuf::from("."))
    .join(LOG_DIR)
}

/// Console-only logging for quick commands.
pub fn init_cli_logging() {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
    .with_target(false)
    .init();
}

/// Console plus daily-rotated file logging under the corpus log directory.
/// The guard must stay alive for the duration of the run.
pub fn init_run_logging() -> Option<WorkerGuard> {
  let log_dir = log_dir();
  if std::fs::create_dir_all(&log_dir).is_err() {
    init_cli_logging();
    return None;
  }

  let file_appender = tracing_appender::rolling::daily(&log_dir, "weft.log");
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  let env_filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
  let console_layer = tracing_subscriber::fmt::layer().with_target(false).with_ansi(true);
  let file_layer = tracing_subscriber::fmt::layer()
    .with_target(true)
    .with_ansi(false)
    .with_writer(file_writer);

  tracing_subscriber::registry()
    .with(env_filter)
    .with(console_layer)
    .with(file_layer)
    .init();

  Some(guard)
}

/// Persist the debug representation of an internal error for bug reports.
pub fn write_error_trace(error: &anyhow::Error) -> Option<PathBuf> {
  let log_dir = log_dir();
  std::fs::create_dir_all(&log_dir).ok()?;
  let stamp = std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .ok()?
    .as_secs();
  let path = log_dir.join(format!("error-{stamp}.log"));
  std::fs::write(&path, format!("{error:?}\n")).ok()?;
  Some(path)
}
