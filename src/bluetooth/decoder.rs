/// RuuviTag data format 5 decoding
use thiserror::Error;

use crate::models::SensorReading;

// RuuviTag protocol constants
pub const RUUVITAG_MANUFACTURER_ID: u16 = 0x0499; // Ruuvi Innovations Ltd. manufacturer ID
const DATA_FORMAT: u8 = 5; // RuuviTag data format version 5
const PAYLOAD_LEN: usize = 24;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("unsupported data format {0}")]
    UnsupportedFormat(u8),
    #[error("invalid payload length {0}")]
    InvalidLength(usize),
}

/// Decode RuuviTag manufacturer data format 5 into a reading.
///
/// RuuviTag data format 5 uses a 24-byte payload with the following structure:
/// - Byte 0: Data format (5)
/// - Bytes 1-2: Temperature (signed 16-bit, 0.005°C resolution)
/// - Bytes 3-4: Humidity (unsigned 16-bit, 0.0025% resolution)
/// - Bytes 5-6: Pressure (unsigned 16-bit, +50000 Pa offset, 1 Pa resolution)
/// - Bytes 7-12: Acceleration X/Y/Z (signed 16-bit, mG)
/// - Bytes 13-14: Battery voltage (11 bits, +1600 mV) and TX power (5 bits, 2 dBm steps from -40)
/// - Byte 15: Movement counter
/// - Bytes 16-17: Measurement sequence number
/// - Bytes 18-23: MAC address
///
/// Fields carrying the format's "not available" sentinel are left out.
/// Metric names follow the ones used by the Zabbix item keys
/// (`temperature`, `humidity`, `pressure`, `acceleration_x`, ...); `mac` and
/// `data_format` are carried along as metadata.
pub fn decode_ruuvi_data(data: &[u8]) -> Result<SensorReading, DecodeError> {
    match data.first() {
        Some(&DATA_FORMAT) => {}
        Some(&format) => return Err(DecodeError::UnsupportedFormat(format)),
        None => return Err(DecodeError::InvalidLength(0)),
    }
    if data.len() != PAYLOAD_LEN {
        return Err(DecodeError::InvalidLength(data.len()));
    }

    let i16_at = |i: usize| i16::from_be_bytes([data[i], data[i + 1]]);
    let u16_at = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);

    let mut reading = SensorReading::new().with("data_format", DATA_FORMAT.to_string().as_str());

    let raw_temperature = i16_at(1);
    if raw_temperature != i16::MIN {
        reading.insert("temperature", round(f64::from(raw_temperature) * 0.005, 2));
    }

    let raw_humidity = u16_at(3);
    if raw_humidity != u16::MAX {
        let humidity = (f64::from(raw_humidity) * 0.0025).min(100.0);
        reading.insert("humidity", round(humidity, 2));
    }

    let raw_pressure = u16_at(5);
    if raw_pressure != u16::MAX {
        // Pa -> hPa
        let pressure = (f64::from(raw_pressure) + 50000.0) / 100.0;
        reading.insert("pressure", round(pressure, 2));
    }

    let acceleration = [i16_at(7), i16_at(9), i16_at(11)];
    if acceleration.iter().all(|&a| a != i16::MIN) {
        let [x, y, z] = acceleration.map(f64::from);
        reading.insert("acceleration_x", x);
        reading.insert("acceleration_y", y);
        reading.insert("acceleration_z", z);
        reading.insert("acceleration", round((x * x + y * y + z * z).sqrt(), 3));
    }

    let power = u16_at(13);
    let battery = power >> 5;
    if battery != 0x7FF {
        reading.insert("battery", f64::from(battery) + 1600.0);
    }
    let tx_power = power & 0x1F;
    if tx_power != 0x1F {
        reading.insert("tx_power", f64::from(tx_power) * 2.0 - 40.0);
    }

    let movement_counter = data[15];
    if movement_counter != u8::MAX {
        reading.insert("movement_counter", f64::from(movement_counter));
    }

    let sequence = u16_at(16);
    if sequence != u16::MAX {
        reading.insert("measurement_sequence_number", f64::from(sequence));
    }

    let mac = data[18..24]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":");
    reading.insert("mac", mac.as_str());

    Ok(reading)
}

fn round(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
