//! Tracing configuration and log routing.
//!
//! The server logs to stdout and the command-line tools log to stderr, since their stdout
//! carries results. Both mirror every event to the log file named by
//! [`Config::log_file`](crate::config::Config::log_file) through a non-blocking writer, so
//! generation threads never wait on disk I/O.
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, fmt::writer::BoxMakeWriter, prelude::*};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Configure the server subscriber: stdout plus `log_file`, filtered by `RUST_LOG` (default
/// `info`).
pub fn init_tracing(log_file: &Path) {
    init(BoxMakeWriter::new(std::io::stdout), "info", log_file);
}

/// Configure the command-line subscriber: stderr plus `log_file`, filtered by `RUST_LOG`
/// (default `warn`).
pub fn init_cli_tracing(log_file: &Path) {
    init(BoxMakeWriter::new(std::io::stderr), "warn", log_file);
}

fn init(console: BoxMakeWriter, default_level: &str, log_file: &Path) {
    let console_layer = fmt::layer()
        .with_writer(console)
        .with_target(false)
        .compact();

    let file_layer = match open_log_file(log_file) {
        Ok(file) => {
            let (writer, guard) = tracing_appender::non_blocking(file);
            let _ = LOG_GUARD.set(guard);
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_ansi(false)
                    .compact(),
            )
        }
        Err(err) => {
            eprintln!("Failed to open log file {}: {err}", log_file.display());
            None
        }
    };

    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(console_layer)
        .with(file_layer)
        .init();
}

/// `RUST_LOG` directives, or `default_level` when the variable is unset or invalid.
fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Open `path` for appending, creating its parent directory first.
fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn log_file_parent_directories_are_created() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock after epoch")
            .as_nanos();
        let root = std::env::temp_dir().join(format!("ai-runner-logs-{nanos}"));
        let path = root.join("nested").join("server.log");

        let mut file = open_log_file(&path).expect("log file opens");
        writeln!(file, "first").expect("write");
        drop(file);
        let mut file = open_log_file(&path).expect("log file reopens");
        writeln!(file, "second").expect("write");
        drop(file);

        assert_eq!(std::fs::read_to_string(&path).expect("read log"), "first\nsecond\n");
        std::fs::remove_dir_all(root).ok();
    }
}
