/// Time-boxed scan session with cooperative listener shutdown
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::task::JoinError;
use tokio::time::{sleep_until, timeout_at, Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::{AdvertisementSource, ReadingSink, ScanError};

/// Run one scan session of exactly `duration`.
///
/// The duration starts before discovery is requested, so a stack that never
/// answers the start request ends the session with `StartTimeout`. A listener task feeds every advertisement into `sink`. When the duration
/// has elapsed the listener is cancelled and joined, and the sink is handed
/// back; it is never read while the listener can still write to it. Errors
/// starting discovery, or raised by the stream mid-session, are returned as-is.
pub async fn run_session<S, K>(source: &S, duration: Duration, sink: K) -> Result<K, ScanError>
where
    S: AdvertisementSource + ?Sized,
    K: ReadingSink + Send + 'static,
{
    let deadline = Instant::now() + duration;
    let mut stream = match timeout_at(deadline, source.advertisements()).await {
        Ok(started) => started?,
        Err(_) => {
            warn!(
                "Discovery did not start within {} seconds",
                duration.as_secs()
            );
            return Err(ScanError::StartTimeout(duration));
        }
    };

    let cancel = CancellationToken::new();
    let listener_cancel = cancel.clone();
    let mut listener = tokio::spawn(async move {
        let mut sink = sink;
        let mut received = 0usize;
        loop {
            tokio::select! {
                biased;
                _ = listener_cancel.cancelled() => break,
                item = stream.next() => match item {
                    Some(Ok(advertisement)) => {
                        received += 1;
                        sink.record(advertisement);
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        debug!("Advertisement stream ended early, waiting for session end");
                        listener_cancel.cancelled().await;
                        break;
                    }
                },
            }
        }
        // dropping the stream here stops discovery
        debug!("Scan listener stopped after {} advertisements", received);
        Ok(sink)
    });

    tokio::select! {
        _ = sleep_until(deadline) => {}
        joined = &mut listener => {
            // only an error (or panic) ends the listener before cancellation
            return flatten(joined);
        }
    }

    cancel.cancel();
    let result = flatten(listener.await);
    info!("Scan task completed, flushing data...");
    result
}

fn flatten<K>(joined: Result<Result<K, ScanError>, JoinError>) -> Result<K, ScanError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(ScanError::Listener(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::testing::{advertisement, Script, ScriptedSource};
    use crate::models::{DeviceAddress, MetricValue, SensorReading};
    use std::collections::BTreeMap;

    type Latest = BTreeMap<DeviceAddress, SensorReading>;

    #[tokio::test(start_paused = true)]
    async fn test_session_collects_in_arrival_order() {
        let source = ScriptedSource::new(vec![Script::Emit(vec![
            advertisement("AA:BB:CC:DD:EE:FF", 20.0),
            advertisement("11:22:33:44:55:66", 5.0),
            advertisement("aa:bb:cc:dd:ee:ff", 21.0),
        ])]);

        let sink = run_session(&source, Duration::from_secs(20), Latest::new())
            .await
            .unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(
            sink[&DeviceAddress::new("aabbccddeeff")].get("temperature"),
            Some(&MetricValue::Number(21.0))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_runs_for_full_duration() {
        let source = ScriptedSource::new(vec![Script::Emit(vec![advertisement(
            "AA:BB:CC:DD:EE:FF",
            20.0,
        )])]);

        let start = Instant::now();
        run_session(&source, Duration::from_secs(20), Latest::new())
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_secs(20));
        assert!(elapsed < Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_is_bounded_under_flood() {
        let source = ScriptedSource::new(vec![Script::Flood(advertisement(
            "AA:BB:CC:DD:EE:FF",
            20.0,
        ))]);

        let start = Instant::now();
        let sink = run_session(&source, Duration::from_secs(5), Latest::new())
            .await
            .unwrap();

        assert!(start.elapsed() < Duration::from_secs(6));
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_propagates_start_error() {
        let source = ScriptedSource::new(vec![Script::Fail(ScanError::InProgress(
            "org.bluez.Error.InProgress".into(),
        ))]);

        let start = Instant::now();
        let result = run_session(&source, Duration::from_secs(20), Latest::new()).await;

        assert!(matches!(result, Err(ScanError::InProgress(_))));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_propagates_stream_error_early() {
        let source = ScriptedSource::new(vec![Script::EmitThenFail(
            vec![advertisement("AA:BB:CC:DD:EE:FF", 20.0)],
            ScanError::Bluetooth("org.bluez.Error.Failed".into()),
        )]);

        let start = Instant::now();
        let result = run_session(&source, Duration::from_secs(20), Latest::new()).await;

        assert!(matches!(result, Err(ScanError::Bluetooth(_))));
        assert!(start.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_bounds_discovery_start() {
        let source = ScriptedSource::new(vec![Script::Hang]);

        let start = Instant::now();
        let result = run_session(&source, Duration::from_secs(20), Latest::new()).await;
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(ScanError::StartTimeout(d)) if d == Duration::from_secs(20)));
        assert!(elapsed >= Duration::from_secs(20));
        assert!(elapsed < Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_start_shortens_listening() {
        let source = ScriptedSource::new(vec![Script::SlowStart(
            Duration::from_secs(15),
            vec![advertisement("AA:BB:CC:DD:EE:FF", 20.0)],
        )]);

        let start = Instant::now();
        let sink = run_session(&source, Duration::from_secs(20), Latest::new())
            .await
            .unwrap();

        assert_eq!(sink.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(21));
    }
}
