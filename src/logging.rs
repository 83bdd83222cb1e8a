use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE_PREFIX: &str = "hearthkeep.log";

/// Initialize the tracing subscriber.
///
/// Logs go to stderr and, when `log_dir` is given, to a daily rolling file
/// inside it. RUST_LOG controls the level (default `info`). Keep the
/// returned guard alive for the life of the process or buffered file
/// output is lost.
pub fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let stderr = fmt::layer().with_writer(io::stderr);

  match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::registry().with(filter).with(stderr).init();
      None
    }
  }
}
