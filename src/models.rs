use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Normalized Bluetooth hardware address.
///
/// Lowercase hex with every separator removed, so `AA:BB:CC:DD:EE:FF`,
/// `aa-bb-cc-dd-ee-ff` and `aabbccddeeff` are the same device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(raw: &str) -> Self {
        let normalized = raw
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.') && !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect();
        DeviceAddress(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single advertised field: a metric or a piece of metadata.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            MetricValue::Number(value) if value.is_finite() => Some(*value),
            _ => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Number(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_string())
    }
}

/// One decoded advertisement, keyed by metric name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorReading {
    fields: BTreeMap<String, MetricValue>,
}

impl SensorReading {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<MetricValue>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &MetricValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Numeric metrics only, in metric-name order. Metadata is dropped here.
    pub fn numeric_metrics(&self) -> impl Iterator<Item = (&str, f64)> {
        self.fields
            .iter()
            .filter_map(|(k, v)| v.as_number().map(|n| (k.as_str(), n)))
    }
}

impl fmt::Display for SensorReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.fields {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            match value {
                MetricValue::Number(n) => write!(f, "{}={}", name, n)?,
                MetricValue::Text(t) => write!(f, "{}={}", name, t)?,
            }
        }
        Ok(())
    }
}

/// Reading from a configured device together with its logical name.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownReading {
    pub name: String,
    pub reading: SensorReading,
}

/// How repeated advertisements from one device within a session are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggregationPolicy {
    /// Keep the most recently observed advertisement.
    #[default]
    Latest,
    /// Average every numeric metric over all samples.
    Average,
}

impl FromStr for AggregationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latest" | "last" => Ok(AggregationPolicy::Latest),
            "average" | "avg" | "mean" => Ok(AggregationPolicy::Average),
            other => Err(format!("unknown aggregation policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Data on the first pass (possibly after adapter resets).
    Success,
    /// Data only after the bluetooth service was restarted.
    Recovered,
    /// Still no devices after the service restart.
    EmptyAfterRecovery,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Success | Outcome::Recovered)
    }
}

/// Final result of one collection run.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionResult {
    pub known: BTreeMap<DeviceAddress, KnownReading>,
    pub unknown: BTreeSet<DeviceAddress>,
    pub outcome: Outcome,
}

impl CollectionResult {
    pub fn device_count(&self) -> usize {
        self.known.len() + self.unknown.len()
    }
}

/// Adapter state as inferred from the interface status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdapterState {
    #[default]
    Unknown,
    Down,
    Resetting,
    Up,
    Faulted,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterState::Unknown => "unknown",
            AdapterState::Down => "down",
            AdapterState::Resetting => "resetting",
            AdapterState::Up => "up",
            AdapterState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}
