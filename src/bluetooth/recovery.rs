/// Bluetooth adapter recovery: interface reset and bluetoothd restart
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::process::Output;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::{sleep, Duration};

use crate::models::AdapterState;

const READY_MARKER: &str = "UP RUNNING";
const POLL_ATTEMPTS: u32 = 10;
const POLL_INTERVAL_SECS: u64 = 1;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}")]
    Failed { command: String, status: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceAction {
    Down,
    Reset,
    Up,
}

impl InterfaceAction {
    /// State the adapter is in once the action succeeded.
    fn resulting_state(self) -> AdapterState {
        match self {
            InterfaceAction::Down => AdapterState::Down,
            InterfaceAction::Reset => AdapterState::Resetting,
            // not known to be up until the status query says so
            InterfaceAction::Up => AdapterState::Unknown,
        }
    }

    fn as_arg(self) -> &'static str {
        match self {
            InterfaceAction::Down => "down",
            InterfaceAction::Reset => "reset",
            InterfaceAction::Up => "up",
        }
    }
}

/// Privileged adapter commands.
#[async_trait]
pub trait AdapterControl: Send + Sync {
    fn interface(&self) -> &str;
    async fn apply(&self, action: InterfaceAction) -> Result<(), RecoveryError>;
    /// Raw interface status text.
    async fn status(&self) -> Result<String, RecoveryError>;
    async fn restart_service(&self) -> Result<(), RecoveryError>;
}

/// `hciconfig` / `systemctl` based adapter control.
#[derive(Debug, Clone)]
pub struct SystemAdapterControl {
    interface: String,
    use_sudo: bool,
}

impl SystemAdapterControl {
    pub fn new(interface: impl Into<String>, use_sudo: bool) -> Self {
        SystemAdapterControl {
            interface: interface.into(),
            use_sudo,
        }
    }

    fn command(&self, privileged: bool, program: &str, args: &[&str]) -> (Command, String) {
        let mut argv: Vec<&str> = Vec::new();
        if privileged && self.use_sudo {
            argv.push("sudo");
        }
        argv.push(program);
        argv.extend_from_slice(args);

        let mut command = Command::new(argv[0]);
        command.args(&argv[1..]).kill_on_drop(true);
        (command, argv.join(" "))
    }

    async fn run(&self, privileged: bool, program: &str, args: &[&str]) -> Result<Output, RecoveryError> {
        let (mut command, description) = self.command(privileged, program, args);
        let output = command
            .output()
            .await
            .map_err(|source| RecoveryError::Spawn {
                command: description.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(output)
        } else {
            Err(RecoveryError::Failed {
                command: description,
                status: output.status.to_string(),
            })
        }
    }
}

#[async_trait]
impl AdapterControl for SystemAdapterControl {
    fn interface(&self) -> &str {
        &self.interface
    }

    async fn apply(&self, action: InterfaceAction) -> Result<(), RecoveryError> {
        self.run(true, "hciconfig", &[self.interface.as_str(), action.as_arg()])
            .await
            .map(|_| ())
    }

    async fn status(&self) -> Result<String, RecoveryError> {
        let output = self.run(false, "hciconfig", &[self.interface.as_str()]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn restart_service(&self) -> Result<(), RecoveryError> {
        self.run(true, "systemctl", &["restart", "bluetooth"])
            .await
            .map(|_| ())
    }
}

/// Infer the adapter state from `hciconfig <if>` output.
pub fn parse_status(output: &str) -> AdapterState {
    if output.contains(READY_MARKER) {
        AdapterState::Up
    } else if output.contains("DOWN") {
        AdapterState::Down
    } else {
        AdapterState::Unknown
    }
}

/// Remediation actions the collector can take between scans.
#[async_trait]
pub trait Recovery: Send + Sync {
    /// Level 1: take the interface down, reset it and bring it back up.
    async fn soft_reset(&self) -> AdapterState;
    /// Level 2: restart the bluetooth service.
    async fn restart_service(&self);
}

/// Recovery through an [`AdapterControl`], with a bounded readiness poll.
pub struct RecoveryController<C> {
    control: C,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl<C: AdapterControl> RecoveryController<C> {
    pub fn new(control: C) -> Self {
        RecoveryController {
            control,
            poll_attempts: POLL_ATTEMPTS,
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
        }
    }

    async fn wait_until_up(&self) -> AdapterState {
        let interface = self.control.interface();
        let mut state = AdapterState::Unknown;

        for _ in 0..self.poll_attempts {
            state = match self.control.status().await {
                Ok(output) => parse_status(&output),
                Err(e) => {
                    warn!("Failed to query {} status: {}", interface, e);
                    AdapterState::Faulted
                }
            };
            if state == AdapterState::Up {
                info!("Bluetooth adapter {} is up.", interface);
                return state;
            }
            info!("Waiting for {} to come up...", interface);
            sleep(self.poll_interval).await;
        }

        warn!(
            "Warning: {} did not come up after reset! (last state: {})",
            interface, state
        );
        state
    }
}

#[async_trait]
impl<C: AdapterControl> Recovery for RecoveryController<C> {
    async fn soft_reset(&self) -> AdapterState {
        let interface = self.control.interface();
        info!("Resetting Bluetooth adapter {}...", interface);

        for action in [InterfaceAction::Down, InterfaceAction::Reset, InterfaceAction::Up] {
            // keep going: the adapter may still come up on its own
            let state = match self.control.apply(action).await {
                Ok(()) => action.resulting_state(),
                Err(e) => {
                    error!("Adapter {} {} failed: {}", interface, action.as_arg(), e);
                    AdapterState::Faulted
                }
            };
            debug!("Adapter {} is {}", interface, state);
        }

        self.wait_until_up().await
    }

    async fn restart_service(&self) {
        info!("Resetting bluetoothd...");
        match self.control.restart_service().await {
            Ok(()) => info!("Bluetooth service restarted"),
            Err(e) => error!("Failed to restart bluetooth service: {}", e),
        }
    }
}
