use std::path::{Path, PathBuf};

use tracing_appender::rolling;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILE: &str = "forge.log";

/// Initialize the tracing/logging system.
///
/// Console output is human-readable or JSON (`structured`). When `log_file`
/// is set, a daily-rolling JSON file layer is added. `RUST_LOG` overrides
/// `log_level`.
pub fn init_logging(log_level: &str, log_file: Option<&Path>, structured: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let json_console = structured.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
    });
    let plain_console = (!structured).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_ansi(true)
    });
    let file_layer = log_file.map(|path| {
        let (dir, filename) = split_log_path(path);
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(rolling::daily(dir, filename))
            .with_target(true)
            .with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_console)
        .with(plain_console)
        .with(file_layer)
        .init();
}

/// Directory and file name for the rolling appender.
fn split_log_path(path: &Path) -> (PathBuf, String) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| DEFAULT_LOG_FILE.to_string());
    (dir, filename)
}
