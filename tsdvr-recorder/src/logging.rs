//! Logging bootstrap: console output, optionally mirrored into daily
//! rotated log files with a retention sweep. The library crates log
//! through the `log` facade; a `tracing-log` bridge funnels those records
//! into the subscriber set up here.

use std::fs;
use std::io;
use std::path::Path;

use chrono::Local;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE_NAME: &str = "tsdvr.log";

/// Initialize logging.
///
/// With a `log_dir`, old log files are swept and a daily-rotated file
/// appender runs next to the console output.
pub fn init(
    log_dir: Option<&Path>,
    retention_days: u64,
    verbose: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let console = fmt::layer()
        .with_writer(io::stdout)
        .with_target(true)
        .with_timer(LocalTimeTimer);

    if let Some(dir) = log_dir {
        fs::create_dir_all(dir)?;
        clean_old_logs(dir, retention_days)?;

        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        // Keep the flushing guard alive for the program lifetime.
        let _ = Box::leak(Box::new(guard));

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_target(true)
            .with_ansi(false)
            .with_timer(LocalTimeTimer);
        tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console)
                .with(file_layer),
        )?;
    } else {
        tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(env_filter).with(console),
        )?;
    }

    tracing_log::LogTracer::init()?;
    Ok(())
}

/// Remove log files older than `retention_days`.
fn clean_old_logs(log_dir: &Path, retention_days: u64) -> io::Result<()> {
    if !log_dir.exists() {
        return Ok(());
    }
    let cutoff = Local::now() - chrono::Duration::days(retention_days as i64);

    for entry in fs::read_dir(log_dir)?.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.contains(LOG_FILE_NAME));
        if !is_log {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            if let Ok(modified) = metadata.modified() {
                let modified: chrono::DateTime<Local> = modified.into();
                if modified < cutoff {
                    if let Err(e) = fs::remove_file(&path) {
                        eprintln!("failed to remove old log file {:?}: {}", path, e);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Local-time timestamps in log lines.
#[derive(Debug, Clone, Copy)]
struct LocalTimeTimer;

impl fmt::time::FormatTime for LocalTimeTimer {
    fn format_time(&self, w: &mut fmt::format::Writer) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.6f"))
    }
}
