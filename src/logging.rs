//! Tracing setup: human-readable lines on stderr plus a daily log file.

use std::path::PathBuf;

use color_eyre::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_ENV: &str = "HSYNC_LOG";

/// Directory holding the rolling log files.
pub fn log_dir() -> Option<PathBuf> {
  dirs::data_dir().map(|d| d.join("heritage-sync").join("logs"))
}

/// Install the global subscriber.
///
/// Level comes from `--verbose`, then `HSYNC_LOG`, then defaults to info.
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the program.
pub fn init(verbose: bool) -> Result<Option<WorkerGuard>> {
  let filter = if verbose {
    EnvFilter::new("hsync=debug")
  } else {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("hsync=info"))
  };

  let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

  let (file, guard) = match log_dir() {
    Some(dir) => {
      std::fs::create_dir_all(&dir)?;
      let appender = tracing_appender::rolling::daily(dir, "hsync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_ansi(false).with_writer(writer)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(stderr)
    .with(file)
    .try_init()?;

  Ok(guard)
}
