/// zabbix_sender invocation and result parsing
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use super::EmitError;

/// Exit status and combined stdout/stderr of one push.
#[derive(Debug, Clone, PartialEq)]
pub struct PushOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub output: String,
}

#[async_trait]
pub trait Pusher: Send + Sync {
    async fn push(&self, batch: &Path) -> Result<PushOutput, EmitError>;
}

/// Runs `<program> -c <agent config> -i <batch file>`.
#[derive(Debug, Clone)]
pub struct ZabbixSender {
    program: PathBuf,
    agent_config: PathBuf,
}

impl ZabbixSender {
    pub fn new(program: impl Into<PathBuf>, agent_config: impl Into<PathBuf>) -> Self {
        ZabbixSender {
            program: program.into(),
            agent_config: agent_config.into(),
        }
    }
}

#[async_trait]
impl Pusher for ZabbixSender {
    async fn push(&self, batch: &Path) -> Result<PushOutput, EmitError> {
        let output = Command::new(&self.program)
            .arg("-c")
            .arg(&self.agent_config)
            .arg("-i")
            .arg(batch)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| EmitError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(PushOutput {
            exit_code: output.status.code(),
            output: text,
        })
    }
}

/// Item counters reported by zabbix_sender.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderSummary {
    pub processed: u64,
    pub failed: u64,
}

impl SenderSummary {
    /// Pick `processed: <n>` and `failed: <n>` out of the output; a missing
    /// counter reads as 0.
    pub fn parse(output: &str) -> Self {
        SenderSummary {
            processed: first_count(output, "processed: ").unwrap_or(0),
            failed: first_count(output, "failed: ").unwrap_or(0),
        }
    }
}

fn first_count(output: &str, label: &str) -> Option<u64> {
    output.match_indices(label).find_map(|(index, _)| {
        let rest = &output[index + label.len()..];
        let end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        rest[..end].parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sender_response() {
        let output = "Response from \"127.0.0.1:10051\": \"processed: 14; failed: 2; total: 16; seconds spent: 0.000412\"\n\
                      sent: 16; skipped: 0; total: 16\n";
        assert_eq!(
            SenderSummary::parse(output),
            SenderSummary {
                processed: 14,
                failed: 2
            }
        );
    }

    #[test]
    fn test_parse_missing_counters_default_to_zero() {
        assert_eq!(
            SenderSummary::parse("processed: 3"),
            SenderSummary {
                processed: 3,
                failed: 0
            }
        );
        assert_eq!(SenderSummary::parse(""), SenderSummary::default());
        assert_eq!(
            SenderSummary::parse("zabbix_sender [123]: cannot connect"),
            SenderSummary::default()
        );
    }

    #[test]
    fn test_parse_skips_labels_without_digits() {
        assert_eq!(
            SenderSummary::parse("failed: n/a; failed: 4"),
            SenderSummary {
                processed: 0,
                failed: 4
            }
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let sender = ZabbixSender::new("/nonexistent/zabbix_sender", "/etc/zabbix/zabbix_agent2.conf");
        let result = sender.push(Path::new("/tmp/batch.data")).await;
        assert!(matches!(result, Err(EmitError::Spawn { .. })));
    }
}
