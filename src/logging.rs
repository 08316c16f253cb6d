//! Logging setup: compact stderr output plus a daily rolling file under the
//! data directory, filtered by `RUST_LOG`.

use std::fs;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::paths;

const DEFAULT_FILTER: &str = "info,reqwest=warn,hyper=warn,symphonia=warn";

/// Initialize structured logging.
///
/// - Console output goes to stderr; stdout carries the IPC protocol.
/// - File output: `{data_dir}/logs/voice-loop.<date>.log`, daily rotation,
///   latest 5 files kept. Skipped (with a warning) if the directory cannot
///   be created.
/// - Filter: `RUST_LOG`, defaulting to `info` with noisy HTTP and codec
///   crates at `warn`.
///
/// Calling this twice is a no-op.
pub fn init() {
    let log_dir = paths::get_log_dir();

    let file_layer = match fs::create_dir_all(&log_dir).map_err(|e| e.to_string()).and_then(|_| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("voice-loop")
            .filename_suffix("log")
            .max_log_files(5)
            .build(&log_dir)
            .map_err(|e| e.to_string())
    }) {
        Ok(appender) => Some(
            fmt::layer()
                .with_writer(appender)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .boxed(),
        ),
        Err(e) => {
            eprintln!("voice-loop: file logging disabled ({}): {}", log_dir.display(), e);
            None
        }
    };

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .compact();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let initialized = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .is_ok();

    if initialized {
        tracing::info!(log_dir = %log_dir.display(), "Logger initialized");
    }
}
