/// Bluetooth Low Energy scanning through BlueZ
use async_trait::async_trait;
use bluer::{AdapterEvent, Address};
use futures_util::StreamExt;
use log::{debug, error, info, warn};

use super::decoder::{decode_ruuvi_data, RUUVITAG_MANUFACTURER_ID};
use super::{Advertisement, AdvertisementSource, AdvertisementStream, ScanError};

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        match err.kind {
            bluer::ErrorKind::InProgress => ScanError::InProgress(err.to_string()),
            _ => ScanError::Bluetooth(err.to_string()),
        }
    }
}

/// Advertisement source backed by the BlueZ daemon.
///
/// A new D-Bus session is opened for every scan so that a restarted
/// `bluetoothd` is picked up without restarting the collector.
#[derive(Debug, Clone)]
pub struct BluerScanner {
    interface: String,
}

impl BluerScanner {
    pub fn new(interface: impl Into<String>) -> Self {
        BluerScanner {
            interface: interface.into(),
        }
    }
}

#[async_trait]
impl AdvertisementSource for BluerScanner {
    async fn advertisements(&self) -> Result<AdvertisementStream, ScanError> {
        // Initialize Bluetooth session
        let session = bluer::Session::new().await.map_err(|e| {
            error!("Failed to create Bluetooth session: {}", e);
            ScanError::from(e)
        })?;

        let adapter = session.adapter(&self.interface).map_err(|e| {
            error!("Failed to get Bluetooth adapter {}: {}", self.interface, e);
            ScanError::from(e)
        })?;

        // Ensure Bluetooth adapter is powered on
        adapter.set_powered(true).await.map_err(|e| {
            error!("Failed to power on adapter: {}", e);
            ScanError::from(e)
        })?;

        // Low Energy only, and report every advertisement rather than the first
        let filter = bluer::DiscoveryFilter {
            transport: bluer::DiscoveryTransport::Le,
            duplicate_data: true,
            ..Default::default()
        };
        if let Err(e) = adapter.set_discovery_filter(filter).await {
            warn!("Failed to set discovery filter: {}", e);
        }

        let events = adapter.discover_devices_with_changes().await.map_err(|e| {
            error!("Failed to start device discovery: {}", e);
            ScanError::from(e)
        })?;
        info!("Discovery started on {}", adapter.name());

        let stream = events.filter_map(move |event| {
            // the D-Bus session must outlive the discovery stream
            let _session = &session;
            let adapter = adapter.clone();
            async move {
                match event {
                    AdapterEvent::DeviceAdded(address) => {
                        read_advertisement(&adapter, address).await.map(Ok)
                    }
                    _ => None,
                }
            }
        });

        Ok(stream.boxed())
    }
}

/// Read and decode the current RuuviTag manufacturer data of a device.
async fn read_advertisement(adapter: &bluer::Adapter, address: Address) -> Option<Advertisement> {
    let device = match adapter.device(address) {
        Ok(device) => device,
        Err(e) => {
            debug!("Device {} vanished: {}", address, e);
            return None;
        }
    };

    let manufacturer_data = match device.manufacturer_data().await {
        Ok(Some(data)) => data,
        Ok(None) => return None,
        Err(e) => {
            debug!("Failed to get manufacturer data for {}: {}", address, e);
            return None;
        }
    };

    // Not a RuuviTag
    let payload = manufacturer_data.get(&RUUVITAG_MANUFACTURER_ID)?;

    match decode_ruuvi_data(payload) {
        Ok(mut reading) => {
            if let Ok(Some(rssi)) = device.rssi().await {
                reading.insert("rssi", f64::from(rssi));
            }
            Some(Advertisement {
                address: address.to_string(),
                reading,
            })
        }
        Err(e) => {
            debug!("Ignoring RuuviTag payload from {}: {}", address, e);
            None
        }
    }
}
