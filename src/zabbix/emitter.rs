/// Batch emission: write, push, then delete or retain the batch file
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

use super::batch::{batch_path, format_batch, write_batch};
use super::sender::{PushOutput, Pusher, SenderSummary};
use super::EmitError;
use crate::models::CollectionResult;

/// What happened to a pushed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmissionOutcome {
    /// Everything accepted; the batch file was removed.
    Sent { processed: u64 },
    /// zabbix_sender exited non-zero (`None`: killed by a signal).
    ExitStatus(Option<i32>),
    ItemsFailed { failed: u64 },
    NothingProcessed,
}

impl EmissionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, EmissionOutcome::Sent { .. })
    }
}

/// Map a push result onto the delete/retain decision.
pub fn decide(output: &PushOutput) -> EmissionOutcome {
    if output.exit_code != Some(0) {
        return EmissionOutcome::ExitStatus(output.exit_code);
    }
    let summary = SenderSummary::parse(&output.output);
    if summary.failed > 0 {
        EmissionOutcome::ItemsFailed {
            failed: summary.failed,
        }
    } else if summary.processed == 0 {
        EmissionOutcome::NothingProcessed
    } else {
        EmissionOutcome::Sent {
            processed: summary.processed,
        }
    }
}

pub struct BatchEmitter<P> {
    pusher: P,
    batch_dir: PathBuf,
    namespace: String,
}

impl<P: Pusher> BatchEmitter<P> {
    pub fn new(pusher: P, batch_dir: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        BatchEmitter {
            pusher,
            batch_dir: batch_dir.into(),
            namespace: namespace.into(),
        }
    }

    /// Format the result into a batch file for this run and push it.
    pub async fn emit(
        &self,
        result: &CollectionResult,
        hostname: &str,
    ) -> Result<EmissionOutcome, EmitError> {
        let batch = format_batch(result, hostname, &self.namespace);
        let path = batch_path(&self.batch_dir, OffsetDateTime::now_utc().unix_timestamp());

        write_batch(&path, &batch).map_err(|source| EmitError::Write {
            path: path.clone(),
            source,
        })?;
        info!(
            "Finished writing Zabbix file: {} tags, {} metrics total.",
            batch.devices,
            batch.metrics()
        );

        self.push_file(&path).await
    }

    /// Push an existing batch file; it is deleted only when every item was accepted.
    pub async fn push_file(&self, path: &Path) -> Result<EmissionOutcome, EmitError> {
        if !path.is_file() {
            error!("Batch file {} does not exist", path.display());
            return Err(EmitError::BatchMissing(path.to_path_buf()));
        }

        let output = self.pusher.push(path).await?;
        let outcome = decide(&output);

        match outcome {
            EmissionOutcome::ExitStatus(Some(code)) => {
                error!("Zabbix sender exited with code {}", code)
            }
            EmissionOutcome::ExitStatus(None) => error!("Zabbix sender was killed by a signal"),
            EmissionOutcome::ItemsFailed { failed } => {
                error!("Zabbix sender failed: {} items failed", failed)
            }
            EmissionOutcome::NothingProcessed => {
                warn!("Zabbix sender had nothing to process: 0 items sent")
            }
            EmissionOutcome::Sent { processed } => {
                info!(
                    "Zabbix sender completed successfully. {} items sent.",
                    processed
                );
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("Failed to delete batch file {}: {}", path.display(), e);
                }
            }
        }

        if !outcome.is_success() {
            warn!("Keeping batch file {} for inspection", path.display());
        }
        Ok(outcome)
    }
}
