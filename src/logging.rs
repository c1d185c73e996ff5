//! Tracing subscriber setup.
//!
//! Filtering follows `RUST_LOG` when set, then the configured filter, then
//! `warn`. Output goes to stderr, or to a file through a non-blocking writer
//! when `logging.file` is configured.

use std::path::Path;

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

const DEFAULT_FILTER: &str = "warn";

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let filter = env_filter(config.filter.as_deref());

  match &config.file {
    Some(path) => {
      let (writer, guard) = file_writer(path)?;
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
      Ok(None)
    }
  }
}

fn env_filter(configured: Option<&str>) -> EnvFilter {
  EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(configured.unwrap_or(DEFAULT_FILTER)))
    .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn file_writer(path: &Path) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
  let dir = match path.parent() {
    Some(dir) if !dir.as_os_str().is_empty() => dir,
    _ => Path::new("."),
  };
  let name = path
    .file_name()
    .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::never(dir, name);
  Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_invalid_filter_falls_back() {
    // Must not panic on garbage directives
    let _ = env_filter(Some("not a [valid filter"));
  }

  #[test]
  fn test_file_path_without_name() {
    assert!(file_writer(Path::new("/")).is_err());
  }
}
