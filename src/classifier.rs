/// Classification of decoded advertisements and the per-session reading buffer
use log::debug;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::bluetooth::{Advertisement, ReadingSink};
use crate::config::SensorConfig;
use crate::models::{AggregationPolicy, DeviceAddress, KnownReading, MetricValue, SensorReading};

// Counters are carried over from the latest sample instead of being averaged
const COUNTER_METRICS: &[&str] = &["movement_counter", "measurement_sequence_number"];

#[derive(Debug, Clone, PartialEq)]
pub enum Classification<'a> {
    Known {
        address: DeviceAddress,
        name: &'a str,
        reading: SensorReading,
    },
    Unknown(DeviceAddress),
}

/// Classify one reading against the tag configuration.
///
/// The address is normalized before lookup; the reading is passed through
/// untouched, metadata included.
pub fn classify<'a>(
    address: &str,
    reading: SensorReading,
    config: &'a SensorConfig,
) -> Classification<'a> {
    let address = DeviceAddress::new(address);
    match config.name_of(&address) {
        Some(name) => Classification::Known {
            address,
            name,
            reading,
        },
        None => Classification::Unknown(address),
    }
}

#[derive(Debug)]
struct DeviceSamples {
    name: String,
    samples: Vec<SensorReading>,
}

/// Buffer filled by the scan listener during a session.
///
/// Owned by the listener task while the session runs and handed back to the
/// collector once the listener has stopped.
#[derive(Debug)]
pub struct ReadingBuffer {
    config: Arc<SensorConfig>,
    policy: AggregationPolicy,
    known: BTreeMap<DeviceAddress, DeviceSamples>,
    unknown: BTreeSet<DeviceAddress>,
}

impl ReadingBuffer {
    pub fn new(config: Arc<SensorConfig>, policy: AggregationPolicy) -> Self {
        ReadingBuffer {
            config,
            policy,
            known: BTreeMap::new(),
            unknown: BTreeSet::new(),
        }
    }

    /// Number of distinct devices seen, configured or not.
    pub fn device_count(&self) -> usize {
        self.known.len() + self.unknown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.device_count() == 0
    }

    pub fn into_parts(
        self,
    ) -> (
        BTreeMap<DeviceAddress, KnownReading>,
        BTreeSet<DeviceAddress>,
    ) {
        let policy = self.policy;
        let known = self
            .known
            .into_iter()
            .filter_map(|(address, device)| {
                let reading = match policy {
                    AggregationPolicy::Latest => device.samples.into_iter().last(),
                    AggregationPolicy::Average => average(&device.samples),
                }?;
                Some((
                    address,
                    KnownReading {
                        name: device.name,
                        reading,
                    },
                ))
            })
            .collect();
        (known, self.unknown)
    }
}

impl ReadingSink for ReadingBuffer {
    fn record(&mut self, advertisement: Advertisement) {
        let Advertisement { address, reading } = advertisement;
        debug!("Found {}: {}", address, reading);

        match classify(&address, reading, &self.config) {
            Classification::Known {
                address,
                name,
                reading,
            } => {
                let entry = self
                    .known
                    .entry(address)
                    .or_insert_with(|| DeviceSamples {
                        name: name.to_string(),
                        samples: Vec::new(),
                    });
                if self.policy == AggregationPolicy::Latest {
                    entry.samples.clear();
                }
                entry.samples.push(reading);
            }
            Classification::Unknown(address) => {
                if !self.unknown.contains(&address) {
                    debug!("Tag {} is not in the configuration", address);
                    self.unknown.insert(address);
                }
            }
        }
    }
}

/// Mean of every numeric metric over the samples, rounded to 3 decimals.
///
/// Metadata and counters come from the latest sample. Adds a `samples` metric.
fn average(samples: &[SensorReading]) -> Option<SensorReading> {
    let latest = samples.last()?;

    let mut sums: HashMap<&str, (f64, u32)> = HashMap::new();
    for sample in samples {
        for (name, value) in sample.numeric_metrics() {
            let entry = sums.entry(name).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }

    let mut averaged = SensorReading::new();
    for (name, value) in latest.fields() {
        match value {
            MetricValue::Number(_) if !COUNTER_METRICS.contains(&name) => {
                if let Some((sum, count)) = sums.get(name) {
                    let mean = sum / f64::from(*count);
                    averaged.insert(name, (mean * 1000.0).round() / 1000.0);
                }
            }
            other => averaged.insert(name, other.clone()),
        }
    }
    averaged.insert("samples", samples.len() as f64);
    Some(averaged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Arc<SensorConfig> {
        Arc::new(
            SensorConfig::from_json(
                r#"{ "config": [ { "mac": "AA:BB:CC:DD:EE:FF", "name": "Sauna" } ] }"#,
            )
            .unwrap(),
        )
    }

    fn advertisement(address: &str, temperature: f64) -> Advertisement {
        Advertisement {
            address: address.to_string(),
            reading: SensorReading::new()
                .with("temperature", temperature)
                .with("mac", address),
        }
    }

    #[test]
    fn test_classify_is_format_insensitive() {
        let config = config();
        for raw in ["AA:BB:CC:DD:EE:FF", "aa:bb:cc:dd:ee:ff", "aabbccddeeff", "AA-BB-CC-DD-EE-FF"] {
            match classify(raw, SensorReading::new(), &config) {
                Classification::Known { name, address, .. } => {
                    assert_eq!(name, "Sauna");
                    assert_eq!(address.as_str(), "aabbccddeeff");
                }
                other => panic!("{} classified as {:?}", raw, other),
            }
        }
    }

    #[test]
    fn test_classify_unknown_keeps_address() {
        let config = config();
        let result = classify("11:22:33:44:55:66", SensorReading::new(), &config);
        assert_eq!(result, Classification::Unknown(DeviceAddress::new("112233445566")));
    }

    #[test]
    fn test_classify_preserves_metadata() {
        let config = config();
        let reading = SensorReading::new().with("temperature", 20.0).with("mac", "x");
        match classify("aabbccddeeff", reading.clone(), &config) {
            Classification::Known { reading: kept, .. } => assert_eq!(kept, reading),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_buffer_keeps_latest_reading() {
        let mut buffer = ReadingBuffer::new(config(), AggregationPolicy::Latest);
        buffer.record(advertisement("AA:BB:CC:DD:EE:FF", 20.0));
        buffer.record(advertisement("aa:bb:cc:dd:ee:ff", 21.0));
        buffer.record(advertisement("AA:BB:CC:DD:EE:FF", 22.5));

        assert_eq!(buffer.device_count(), 1);
        let (known, unknown) = buffer.into_parts();
        let sauna = &known[&DeviceAddress::new("aabbccddeeff")];
        assert_eq!(sauna.name, "Sauna");
        assert_eq!(
            sauna.reading.get("temperature"),
            Some(&MetricValue::Number(22.5))
        );
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_buffer_collects_unknown_once() {
        let mut buffer = ReadingBuffer::new(config(), AggregationPolicy::Latest);
        buffer.record(advertisement("11:22:33:44:55:66", 1.0));
        buffer.record(advertisement("11:22:33:44:55:66", 2.0));
        buffer.record(advertisement("22:33:44:55:66:77", 3.0));

        assert_eq!(buffer.device_count(), 2);
        let (known, unknown) = buffer.into_parts();
        assert!(known.is_empty());
        assert_eq!(unknown.len(), 2);
    }

    #[test]
    fn test_buffer_averages_samples() {
        let mut buffer = ReadingBuffer::new(config(), AggregationPolicy::Average);
        for (temp, counter) in [(20.0, 5.0), (21.0, 6.0), (22.5, 7.0)] {
            buffer.record(Advertisement {
                address: "AA:BB:CC:DD:EE:FF".to_string(),
                reading: SensorReading::new()
                    .with("temperature", temp)
                    .with("movement_counter", counter)
                    .with("mac", "AA:BB:CC:DD:EE:FF"),
            });
        }

        let (known, _) = buffer.into_parts();
        let reading = &known[&DeviceAddress::new("aabbccddeeff")].reading;
        assert_eq!(reading.get("temperature"), Some(&MetricValue::Number(21.167)));
        assert_eq!(reading.get("movement_counter"), Some(&MetricValue::Number(7.0)));
        assert_eq!(reading.get("samples"), Some(&MetricValue::Number(3.0)));
        assert_eq!(
            reading.get("mac"),
            Some(&MetricValue::Text("AA:BB:CC:DD:EE:FF".to_string()))
        );
    }
}
