/// zabbix_sender input file formatting
use log::{debug, info};
use std::borrow::Cow;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::models::CollectionResult;

/// Formatted `zabbix_sender` input, one line per metric.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub lines: Vec<String>,
    pub devices: usize,
}

impl Batch {
    pub fn metrics(&self) -> usize {
        self.lines.len()
    }
}

/// Build the batch for all configured devices in the result.
///
/// Only numeric metrics are emitted; devices left without any are skipped.
pub fn format_batch(result: &CollectionResult, hostname: &str, namespace: &str) -> Batch {
    let mut batch = Batch::default();

    for known in result.known.values() {
        let metrics: Vec<(&str, f64)> = known.reading.numeric_metrics().collect();
        if metrics.is_empty() {
            info!("Skipping tag {}: no numeric metrics.", known.name);
            continue;
        }

        info!(
            "Preparing data for tag {} ({} metrics).",
            known.name,
            metrics.len()
        );
        for (metric, value) in metrics {
            batch
                .lines
                .push(format_line(hostname, namespace, metric, &known.name, value));
        }
        batch.devices += 1;
    }

    batch
}

/// `<hostname> <namespace>.<metric>[<device>] <value>`
pub fn format_line(hostname: &str, namespace: &str, metric: &str, device: &str, value: f64) -> String {
    let key = format!("{}.{}[{}]", namespace, metric, device);
    format!("{} {} {}", quote(hostname), quote(&key), value)
}

// zabbix_sender splits on whitespace; quoted fields escape `"` and `\`
fn quote(field: &str) -> Cow<'_, str> {
    if field.is_empty() || field.chars().any(|c| c.is_whitespace() || c == '"') {
        let escaped = field.replace('\\', "\\\\").replace('"', "\\\"");
        Cow::Owned(format!("\"{}\"", escaped))
    } else {
        Cow::Borrowed(field)
    }
}

/// Per-run batch file path.
pub fn batch_path(dir: &Path, epoch: i64) -> PathBuf {
    dir.join(format!("ruuvisender-{}.data", epoch))
}

/// Write the batch so that `path` only ever holds a complete file.
pub fn write_batch(path: &Path, batch: &Batch) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut file = fs::File::create(&tmp)?;
        for line in &batch.lines {
            writeln!(file, "{}", line)?;
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    debug!("Wrote {} lines to {}", batch.metrics(), path.display());
    Ok(())
}
