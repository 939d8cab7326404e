pub mod decoder;
pub mod recovery;
pub mod scanner;
pub mod session;

use async_trait::async_trait;
use futures_util::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

use crate::models::{DeviceAddress, SensorReading};

pub use recovery::{Recovery, RecoveryController, SystemAdapterControl};
pub use scanner::BluerScanner;
pub use session::run_session;

/// A decoded advertisement as delivered by the scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// Address as reported by the stack, not yet normalized.
    pub address: String,
    pub reading: SensorReading,
}

#[derive(Debug, Error)]
pub enum ScanError {
    /// BlueZ refused to start discovery because another one is running.
    #[error("scan already in progress: {0}")]
    InProgress(String),
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    #[error("scan listener failed: {0}")]
    Listener(String),
    #[error("discovery did not start within {0:?}")]
    StartTimeout(Duration),
}

impl ScanError {
    pub fn is_in_progress(&self) -> bool {
        match self {
            ScanError::InProgress(_) => true,
            ScanError::Bluetooth(message) => {
                let message = message.to_ascii_lowercase();
                message.contains("inprogress") || message.contains("in progress")
            }
            ScanError::Listener(_) | ScanError::StartTimeout(_) => false,
        }
    }
}

pub type AdvertisementStream = Pin<Box<dyn Stream<Item = Result<Advertisement, ScanError>> + Send>>;

/// Source of decoded advertisements.
///
/// Each call starts a fresh discovery; dropping the returned stream stops it.
#[async_trait]
pub trait AdvertisementSource: Send + Sync {
    async fn advertisements(&self) -> Result<AdvertisementStream, ScanError>;
}

/// Receiver of advertisements for the lifetime of a scan session.
pub trait ReadingSink {
    fn record(&mut self, advertisement: Advertisement);
}

/// Latest reading per address, no classification. Used by discovery mode.
impl ReadingSink for BTreeMap<DeviceAddress, SensorReading> {
    fn record(&mut self, advertisement: Advertisement) {
        self.insert(
            DeviceAddress::new(&advertisement.address),
            advertisement.reading,
        );
    }
}
