/// Collection cycle: bounded scans, adapter recovery and retry policy
use log::{error, info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{sleep, Duration};

use crate::bluetooth::{run_session, AdvertisementSource, Recovery, ScanError};
use crate::classifier::ReadingBuffer;
use crate::config::{SensorConfig, Settings};
use crate::models::{AggregationPolicy, CollectionResult, Outcome};

const IN_PROGRESS_SETTLE_SECS: u64 = 1; // adapter settle time after an "in progress" reset
const SERVICE_SETTLE_SECS: u64 = 2; // bluetoothd settle time after a restart

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("scan failed after {attempts} attempts: {source}")]
    RetriesExhausted { attempts: u32, source: ScanError },
    #[error("scan after bluetooth service restart failed: {0}")]
    AfterServiceRestart(ScanError),
}

/// Remaining adapter-reset retries for one collection run.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    remaining: u32,
}

impl RetryBudget {
    pub fn new(retries: u32) -> Self {
        RetryBudget { remaining: retries }
    }

    /// Take one retry; false once the budget is spent.
    pub fn try_consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

#[derive(Debug, Clone)]
pub struct CollectorOptions {
    pub scan_duration: Duration,
    pub retries: u32,
    pub policy: AggregationPolicy,
    pub in_progress_settle: Duration,
    pub service_settle: Duration,
}

impl CollectorOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        CollectorOptions {
            scan_duration: settings.scan_duration,
            retries: settings.scan_retries,
            policy: settings.aggregation,
            ..Default::default()
        }
    }
}

impl Default for CollectorOptions {
    fn default() -> Self {
        CollectorOptions {
            scan_duration: Duration::from_secs(20),
            retries: 2,
            policy: AggregationPolicy::Latest,
            in_progress_settle: Duration::from_secs(IN_PROGRESS_SETTLE_SECS),
            service_settle: Duration::from_secs(SERVICE_SETTLE_SECS),
        }
    }
}

/// Drives scan sessions and adapter recovery until data, an empty result
/// after a service restart, or an exhausted retry budget.
pub struct Collector<'a> {
    source: &'a dyn AdvertisementSource,
    recovery: &'a dyn Recovery,
    config: Arc<SensorConfig>,
    options: CollectorOptions,
}

impl<'a> Collector<'a> {
    pub fn new(
        source: &'a dyn AdvertisementSource,
        recovery: &'a dyn Recovery,
        config: Arc<SensorConfig>,
        options: CollectorOptions,
    ) -> Self {
        Collector {
            source,
            recovery,
            config,
            options,
        }
    }

    pub async fn collect(&self) -> Result<CollectionResult, CollectError> {
        let buffer = self.scan_with_retries().await?;
        if !buffer.is_empty() {
            info!("Collected data from {} tags.", buffer.device_count());
            return Ok(self.finish(buffer, Outcome::Success));
        }

        // A clean scan that saw nothing at all: restart bluetoothd and try once more
        error!("Error: No RuuviTag data collected! Attempting Bluetooth reset and retry...");
        self.recovery.restart_service().await;
        sleep(self.options.service_settle).await;

        let buffer = self
            .scan()
            .await
            .map_err(CollectError::AfterServiceRestart)?;
        if buffer.is_empty() {
            error!("Error: Still no RuuviTag data after Bluetooth reset.");
            return Ok(self.finish(buffer, Outcome::EmptyAfterRecovery));
        }

        info!(
            "Recovered: Collected data from {} tags after Bluetooth reset.",
            buffer.device_count()
        );
        Ok(self.finish(buffer, Outcome::Recovered))
    }

    async fn scan(&self) -> Result<ReadingBuffer, ScanError> {
        let buffer = ReadingBuffer::new(Arc::clone(&self.config), self.options.policy);
        run_session(self.source, self.options.scan_duration, buffer).await
    }

    async fn scan_with_retries(&self) -> Result<ReadingBuffer, CollectError> {
        let mut budget = RetryBudget::new(self.options.retries);
        let mut in_progress_handled = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            info!(
                "Starting Bluetooth scan for {} seconds (attempt {})...",
                self.options.scan_duration.as_secs(),
                attempt
            );

            match self.scan().await {
                Ok(buffer) => {
                    info!(
                        "Data collection complete. Found {} tags.",
                        buffer.device_count()
                    );
                    return Ok(buffer);
                }
                // Transient and adapter-local: one free reset, outside the budget
                Err(e) if e.is_in_progress() && !in_progress_handled => {
                    warn!("Scan already in progress ({}). Resetting adapter...", e);
                    in_progress_handled = true;
                    self.recovery.soft_reset().await;
                    sleep(self.options.in_progress_settle).await;
                }
                Err(e) => {
                    error!("Bluetooth scan error: {}", e);
                    if !budget.try_consume() {
                        error!("Max retries reached, aborting scan.");
                        return Err(CollectError::RetriesExhausted {
                            attempts: attempt,
                            source: e,
                        });
                    }
                    info!(
                        "Attempting to reset adapter and retry ({} retries left)...",
                        budget.remaining()
                    );
                    self.recovery.soft_reset().await;
                }
            }
        }
    }

    fn finish(&self, buffer: ReadingBuffer, outcome: Outcome) -> CollectionResult {
        let (known, unknown) = buffer.into_parts();
        if !unknown.is_empty() {
            let list = unknown
                .iter()
                .map(|a| a.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            warn!(
                "Summary: {} unknown tags detected: {}",
                unknown.len(),
                list
            );
        }
        CollectionResult {
            known,
            unknown,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::testing::{advertisement, Script, ScriptedSource};
    use crate::models::{AdapterState, DeviceAddress, MetricValue};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRecovery {
        soft_resets: AtomicUsize,
        restarts: AtomicUsize,
    }

    #[async_trait]
    impl Recovery for CountingRecovery {
        async fn soft_reset(&self) -> AdapterState {
            self.soft_resets.fetch_add(1, Ordering::SeqCst);
            AdapterState::Up
        }

        async fn restart_service(&self) {
            self.restarts.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CountingRecovery {
        fn soft_resets(&self) -> usize {
            self.soft_resets.load(Ordering::SeqCst)
        }

        fn restarts(&self) -> usize {
            self.restarts.load(Ordering::SeqCst)
        }
    }

    fn config() -> Arc<SensorConfig> {
        Arc::new(
            SensorConfig::from_json(
                r#"{ "config": [
                    { "mac": "AA:BB:CC:DD:EE:FF", "name": "Sauna" },
                    { "mac": "11:22:33:44:55:66", "name": "Balcony" }
                ] }"#,
            )
            .unwrap(),
        )
    }

    fn bluez_error() -> ScanError {
        ScanError::Bluetooth("org.bluez.Error.Failed: Resource Not Ready".into())
    }

    async fn collect(
        scripts: Vec<Script>,
    ) -> (Result<CollectionResult, CollectError>, ScriptedSource, CountingRecovery) {
        let source = ScriptedSource::new(scripts);
        let recovery = CountingRecovery::default();
        let result = Collector::new(&source, &recovery, config(), CollectorOptions::default())
            .collect()
            .await;
        (result, source, recovery)
    }

    #[test]
    fn test_retry_budget() {
        let mut budget = RetryBudget::new(2);
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        assert_eq!(budget.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_keeps_last_reading_per_device() {
        let (result, source, recovery) = collect(vec![Script::Emit(vec![
            advertisement("AA:BB:CC:DD:EE:FF", 20.0),
            advertisement("11:22:33:44:55:66", 3.5),
            advertisement("aa:bb:cc:dd:ee:ff", 20.5),
        ])])
        .await;

        let result = result.unwrap();
        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(result.known.len(), 2);
        let sauna = &result.known[&DeviceAddress::new("aabbccddeeff")];
        assert_eq!(sauna.name, "Sauna");
        assert_eq!(
            sauna.reading.get("temperature"),
            Some(&MetricValue::Number(20.5))
        );
        assert_eq!(source.starts(), 1);
        assert_eq!(recovery.soft_resets(), 0);
        assert_eq!(recovery.restarts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_unknown_devices_is_success() {
        let (result, _, recovery) = collect(vec![Script::Emit(vec![advertisement(
            "99:88:77:66:55:44",
            1.0,
        )])])
        .await;

        let result = result.unwrap();
        assert_eq!(result.outcome, Outcome::Success);
        assert!(result.known.is_empty());
        assert!(result.unknown.contains(&DeviceAddress::new("998877665544")));
        assert_eq!(recovery.restarts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_exhaust_budget() {
        let (result, source, recovery) = collect(vec![
            Script::Fail(bluez_error()),
            Script::Fail(bluez_error()),
            Script::Fail(bluez_error()),
        ])
        .await;

        match result {
            Err(CollectError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhausted retries, got {:?}", other),
        }
        assert_eq!(recovery.soft_resets(), 2);
        assert_eq!(recovery.restarts(), 0);
        assert_eq!(source.starts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_then_success() {
        let (result, source, recovery) = collect(vec![
            Script::EmitThenFail(vec![advertisement("AA:BB:CC:DD:EE:FF", 19.0)], bluez_error()),
            Script::Emit(vec![advertisement("AA:BB:CC:DD:EE:FF", 21.0)]),
        ])
        .await;

        let result = result.unwrap();
        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(
            result.known[&DeviceAddress::new("aabbccddeeff")]
                .reading
                .get("temperature"),
            Some(&MetricValue::Number(21.0))
        );
        assert_eq!(recovery.soft_resets(), 1);
        assert_eq!(source.starts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_discovery_start_uses_budget() {
        let (result, source, recovery) = collect(vec![
            Script::Hang,
            Script::Emit(vec![advertisement("AA:BB:CC:DD:EE:FF", 21.0)]),
        ])
        .await;

        assert_eq!(result.unwrap().outcome, Outcome::Success);
        assert_eq!(recovery.soft_resets(), 1);
        assert_eq!(recovery.restarts(), 0);
        assert_eq!(source.starts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_progress_bypasses_budget_once() {
        let in_progress = || ScanError::InProgress("org.bluez.Error.InProgress".into());
        let (result, source, recovery) = collect(vec![
            Script::Fail(in_progress()),
            Script::Fail(in_progress()),
            Script::Fail(bluez_error()),
            Script::Emit(vec![advertisement("AA:BB:CC:DD:EE:FF", 21.0)]),
        ])
        .await;

        assert_eq!(result.unwrap().outcome, Outcome::Success);
        // one free reset, then two from the budget
        assert_eq!(recovery.soft_resets(), 3);
        assert_eq!(source.starts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_twice_is_empty_after_recovery() {
        let (result, source, recovery) =
            collect(vec![Script::Emit(vec![]), Script::Emit(vec![])]).await;

        let result = result.unwrap();
        assert_eq!(result.outcome, Outcome::EmptyAfterRecovery);
        assert_eq!(result.device_count(), 0);
        assert_eq!(recovery.restarts(), 1);
        assert_eq!(recovery.soft_resets(), 0);
        assert_eq!(source.starts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_then_data_is_recovered() {
        let (result, source, recovery) = collect(vec![
            Script::Emit(vec![]),
            Script::Emit(vec![advertisement("11:22:33:44:55:66", 4.0)]),
        ])
        .await;

        let result = result.unwrap();
        assert_eq!(result.outcome, Outcome::Recovered);
        assert_eq!(result.known.len(), 1);
        assert_eq!(recovery.restarts(), 1);
        assert_eq!(source.starts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_after_service_restart_is_fatal() {
        let (result, _, recovery) =
            collect(vec![Script::Emit(vec![]), Script::Fail(bluez_error())]).await;

        assert!(matches!(result, Err(CollectError::AfterServiceRestart(_))));
        assert_eq!(recovery.restarts(), 1);
        assert_eq!(recovery.soft_resets(), 0);
    }
}
