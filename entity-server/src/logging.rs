//! Tracing setup for the server binary
//!
//! Logs go to the engine log file (`PathManager::log_file_path`) when it can be
//! opened, otherwise to stderr.

use engine_config::PathManager;
use std::sync::{Once, OnceLock};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static INIT: Once = Once::new();
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const DEFAULT_FILTER: &str = "info,entity_server=debug,entity_core=info,llm=info";

fn filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| match level {
        Some(level) => EnvFilter::new(format!(
            "{},entity_server={},entity_core={},llm={}",
            level, level, level, level
        )),
        None => EnvFilter::new(DEFAULT_FILTER),
    })
}

/// Install the global subscriber once.
///
/// `RUST_LOG` wins over `level`; `to_file` false forces stderr.
pub fn init_logging(level: Option<&str>, to_file: bool) {
    INIT.call_once(|| {
        let log_path = if to_file {
            PathManager::log_file_path()
        } else {
            None
        };

        let Some(path) = log_path else {
            init_stderr_logging(level);
            return;
        };

        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                eprintln!("[entity-server] Failed to create log directory {:?}: {}", parent, e);
            }
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path);

        match file {
            Ok(file) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(file);
                let _ = LOG_GUARD.set(guard);

                let subscriber = tracing_subscriber::registry().with(filter(level)).with(
                    fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true)
                        .with_file(true)
                        .with_line_number(true),
                );

                match tracing::subscriber::set_global_default(subscriber) {
                    Ok(()) => tracing::info!("Logging initialized, writing to {:?}", path),
                    Err(e) => eprintln!("[entity-server] Failed to set tracing subscriber: {}", e),
                }
            }
            Err(e) => {
                eprintln!("[entity-server] Failed to open log file {:?}: {}", path, e);
                init_stderr_logging(level);
            }
        }
    });
}

fn init_stderr_logging(level: Option<&str>) {
    let subscriber = tracing_subscriber::registry().with(filter(level)).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true),
    );

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("[entity-server] Failed to set tracing subscriber: {}", e);
    }
}
