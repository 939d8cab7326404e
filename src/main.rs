mod bluetooth;
mod classifier;
mod collector;
mod config;
mod logging;
mod models;
mod utils;
mod zabbix;

use clap::Parser;
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

use bluetooth::{
    run_session, AdvertisementSource, BluerScanner, RecoveryController, SystemAdapterControl,
};
use collector::{CollectError, Collector, CollectorOptions};
use config::{SensorConfig, Settings, DEFAULT_CONFIG_PATH};
use models::{DeviceAddress, Outcome, SensorReading};
use utils::resolve_hostname;
use zabbix::{BatchEmitter, ZabbixSender};

const EXIT_SUCCESS: u8 = 0;
const EXIT_EMPTY: u8 = 1;
const EXIT_FATAL: u8 = 2;
const EXIT_CONFIG: u8 = 3;
const EXIT_EMISSION: u8 = 4;

/// Collect RuuviTag readings over BLE and push them to Zabbix.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Tag configuration file ({"config": [{"mac": ..., "name": ...}]})
    #[arg(short, long, env = "RUUVI_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Scan once and list every RuuviTag in range without sending anything
    #[arg(long)]
    find: bool,
}

/// Exit status of a collection run. `delivered` only matters once data was collected.
fn exit_status(
    collected: Result<Outcome, &CollectError>,
    delivered: bool,
    fail_on_emission_error: bool,
) -> u8 {
    match collected {
        Err(_) => EXIT_FATAL,
        Ok(Outcome::EmptyAfterRecovery) => EXIT_EMPTY,
        Ok(_) if !delivered && fail_on_emission_error => EXIT_EMISSION,
        Ok(_) => EXIT_SUCCESS,
    }
}

async fn collect_and_send(settings: &Settings, tags: SensorConfig) -> ExitCode {
    let scanner = BluerScanner::new(settings.interface.as_str());
    let recovery = RecoveryController::new(SystemAdapterControl::new(
        settings.interface.as_str(),
        settings.use_sudo,
    ));
    let collector = Collector::new(
        &scanner,
        &recovery,
        Arc::new(tags),
        CollectorOptions::from_settings(settings),
    );

    let result = match collector.collect().await {
        Ok(result) => result,
        Err(e) => {
            error!("Fatal error: {}", e);
            return ExitCode::from(exit_status(Err(&e), false, settings.fail_on_emission_error));
        }
    };
    info!(
        "Collection finished ({:?}): {} known, {} unknown, {} devices total",
        result.outcome,
        result.known.len(),
        result.unknown.len(),
        result.device_count()
    );
    if !result.outcome.is_success() {
        error!("No RuuviTag data collected. Exiting.");
        return ExitCode::from(exit_status(
            Ok(result.outcome),
            false,
            settings.fail_on_emission_error,
        ));
    }

    let hostname = resolve_hostname(settings);
    let emitter = BatchEmitter::new(
        ZabbixSender::new(&settings.sender_path, &settings.agent_config),
        &settings.batch_dir,
        settings.namespace.as_str(),
    );

    let delivered = match emitter.emit(&result, &hostname).await {
        Ok(outcome) => outcome.is_success(),
        Err(e) => {
            error!("Failed to emit batch: {}", e);
            false
        }
    };

    ExitCode::from(exit_status(
        Ok(result.outcome),
        delivered,
        settings.fail_on_emission_error,
    ))
}

/// One bounded scan listing everything in range, configured or not.
async fn find_tags(
    source: &dyn AdvertisementSource,
    tags: &SensorConfig,
    settings: &Settings,
) -> ExitCode {
    info!(
        "Looking for RuuviTags for {} seconds...",
        settings.scan_duration.as_secs()
    );
    let found: BTreeMap<DeviceAddress, SensorReading> = BTreeMap::new();
    let found = match run_session(source, settings.scan_duration, found).await {
        Ok(found) => found,
        Err(e) => {
            error!("Bluetooth scan error: {}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };

    for (address, reading) in &found {
        let name = tags.name_of(address).unwrap_or("unknown");
        println!("{} ({}): {}", address, name, reading);
    }
    info!("Found {} tags.", found.len());
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("Failed to listen for SIGTERM: {}", e);
            None
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
        _ = async {
            match terminate.as_mut() {
                Some(stream) => { stream.recv().await; }
                None => std::future::pending::<()>().await,
            }
        } => {}
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let settings = Settings::from_env();
    let log_dir = match &settings {
        Ok(settings) => settings.log_dir.clone(),
        Err(_) => Settings::default().log_dir,
    };
    if let Some(path) = logging::init(&log_dir) {
        info!("Logging to {}", path.display());
    }

    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    logging::cleanup_old_logs(&settings.log_dir, settings.log_retention);

    let tags = match SensorConfig::load(&cli.config) {
        Ok(tags) => tags,
        Err(e) if cli.find => {
            warn!("Listing tags without names: {}", e);
            SensorConfig::default()
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let run = async {
        if cli.find {
            let scanner = BluerScanner::new(settings.interface.as_str());
            find_tags(&scanner, &tags, &settings).await
        } else {
            collect_and_send(&settings, tags).await
        }
    };

    // A signal ends the run where it stands: no further recovery or emission
    tokio::select! {
        code = run => code,
        _ = shutdown_signal() => {
            info!("Received signal, exiting cleanly...");
            ExitCode::SUCCESS
        }
    }
}
