/// Logger setup: stderr plus a daily log file, and log retention
use log::{info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use time::OffsetDateTime;

use crate::utils::{format_date, format_datetime};

const LOG_PREFIX: &str = "ruuvisender-";
const LOG_SUFFIX: &str = ".log";

/// Writes every log line to stderr and, when available, the log file.
struct Tee {
    file: Option<File>,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

pub fn log_file_path(dir: &Path, now: &OffsetDateTime) -> PathBuf {
    dir.join(format!("{}{}{}", LOG_PREFIX, format_date(now), LOG_SUFFIX))
}

/// Initialize logging; `RUST_LOG` overrides the default `info` level.
///
/// Returns the daily log file in use, if it could be opened.
pub fn init(log_dir: &Path) -> Option<PathBuf> {
    let path = log_file_path(log_dir, &OffsetDateTime::now_utc());
    let file = OpenOptions::new().create(true).append(true).open(&path);
    let (file, open_error) = match file {
        Ok(file) => (Some(file), None),
        Err(e) => (None, Some(e)),
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {:<5} {}",
                format_datetime(&OffsetDateTime::now_utc()),
                record.level(),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(Box::new(Tee { file })))
        .init();

    match open_error {
        Some(e) => {
            warn!("Cannot open log file {}: {}", path.display(), e);
            None
        }
        None => Some(path),
    }
}

/// Keep only the `max_files` most recent log files in `dir`, by modification time.
///
/// Returns the number of files removed.
pub fn cleanup_old_logs(dir: &Path, max_files: usize) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot list log directory {}: {}", dir.display(), e);
            return 0;
        }
    };

    let mut logs: Vec<(SystemTime, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with(LOG_PREFIX) && name.ends_with(LOG_SUFFIX)
        })
        .filter_map(|entry| {
            let modified = entry.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, entry.path()))
        })
        .collect();

    if logs.len() <= max_files {
        return 0;
    }

    // Oldest first
    logs.sort();
    let excess = logs.len() - max_files;
    let mut removed = 0;
    for (_, path) in logs.into_iter().take(excess) {
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Deleted old log file: {}", path.display());
                removed += 1;
            }
            Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
        }
    }
    removed
}
