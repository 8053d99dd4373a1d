//! Sensor node identities, samples and the binary records exchanged with the nodes.
//!
//! Records are fixed-size and little-endian, matching what the sensor firmware
//! puts on the notify characteristic and expects on the write characteristic.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of values in one IMU reading (3-axis accelerometer + 3-axis gyroscope).
pub const PAYLOAD_LEN: usize = 6;

/// Column suffixes used when exporting frames, in payload order.
pub const AXIS_LABELS: [&str; PAYLOAD_LEN] = ["ax", "ay", "az", "gx", "gy", "gz"];

/// Size of one sample record: id byte, 3 padding bytes, u32 timestamp, 6 x f32.
pub const SAMPLE_RECORD_LEN: usize = 32;

/// Size of one command record: two 16-bit integers.
pub const COMMAND_RECORD_LEN: usize = 4;

/// Firmware default sampling period, in milliseconds.
pub const DEFAULT_SAMPLE_PERIOD_MS: u16 = 50;

/// Name of a sensor node as listed in the device registry.
///
/// Frame columns are ordered by this identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Link-layer address of a sensor node (e.g. a BLE MAC address).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Addresses compare case-insensitively, so they are stored upper-cased.
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(address.as_ref().trim().to_uppercase())
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

/// One IMU reading: `[ax, ay, az, gx, gy, gz]`.
pub type Payload = [f32; PAYLOAD_LEN];

/// One reading from one device, as accepted by the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub device_id: DeviceId,
    /// Device-local clock in milliseconds, reset to 0 at session start.
    pub timestamp_ms: u32,
    pub payload: Payload,
}

impl Sample {
    pub fn new(device_id: impl Into<DeviceId>, timestamp_ms: u32, payload: Payload) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp_ms,
            payload,
        }
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A decoded notification record, before it is attributed to a registry device.
#[derive(Debug, Clone, PartialEq)]
pub struct WireRecord {
    /// ASCII identity tag burned into the firmware.
    pub tag: u8,
    pub timestamp_ms: u32,
    pub payload: Payload,
}

impl WireRecord {
    /// Decode a raw notification.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != SAMPLE_RECORD_LEN {
            return Err(DecodeError::Length {
                expected: SAMPLE_RECORD_LEN,
                actual: bytes.len(),
            });
        }

        let timestamp_ms = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let mut payload = [0.0f32; PAYLOAD_LEN];
        for (i, chunk) in bytes[8..].chunks_exact(4).enumerate() {
            let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if !value.is_finite() {
                return Err(DecodeError::NonFinite { index: i });
            }
            payload[i] = value;
        }

        Ok(Self {
            tag: bytes[0],
            timestamp_ms,
            payload,
        })
    }

    /// Encode into the firmware layout. Padding bytes are zeroed.
    pub fn encode(&self) -> [u8; SAMPLE_RECORD_LEN] {
        let mut out = [0u8; SAMPLE_RECORD_LEN];
        out[0] = self.tag;
        out[4..8].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        for (i, value) in self.payload.iter().enumerate() {
            let at = 8 + i * 4;
            out[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// Attribute this record to the registry device whose link delivered it.
    pub fn into_sample(self, device_id: DeviceId) -> Sample {
        Sample {
            device_id,
            timestamp_ms: self.timestamp_ms,
            payload: self.payload,
        }
    }
}

/// Errors decoding a notification record.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    Length { expected: usize, actual: usize },
    NonFinite { index: usize },
    UnknownCommand(u16),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Length { expected, actual } => {
                write!(f, "record length {actual}, expected {expected}")
            }
            DecodeError::NonFinite { index } => {
                write!(f, "non-finite value in {}", AXIS_LABELS[*index])
            }
            DecodeError::UnknownCommand(kind) => write!(f, "unknown command type {kind}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Commands written to a sensor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Reset the device clock to 0 and start notifying.
    ResetTimestamp,
    /// Change the sampling period, in milliseconds.
    SetSamplePeriod(u16),
    /// Put the node into deep sleep. The link drops immediately.
    DeepSleep,
}

impl Command {
    pub fn kind(&self) -> u16 {
        match self {
            Command::ResetTimestamp => 1,
            Command::SetSamplePeriod(_) => 2,
            Command::DeepSleep => 3,
        }
    }

    pub fn value(&self) -> u16 {
        match self {
            Command::SetSamplePeriod(ms) => *ms,
            _ => 0,
        }
    }

    pub fn encode(&self) -> [u8; COMMAND_RECORD_LEN] {
        let kind = self.kind().to_le_bytes();
        let value = self.value().to_le_bytes();
        [kind[0], kind[1], value[0], value[1]]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != COMMAND_RECORD_LEN {
            return Err(DecodeError::Length {
                expected: COMMAND_RECORD_LEN,
                actual: bytes.len(),
            });
        }
        let kind = u16::from_le_bytes([bytes[0], bytes[1]]);
        let value = u16::from_le_bytes([bytes[2], bytes[3]]);
        match kind {
            1 => Ok(Command::ResetTimestamp),
            2 => Ok(Command::SetSamplePeriod(value)),
            3 => Ok(Command::DeepSleep),
            other => Err(DecodeError::UnknownCommand(other)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::ResetTimestamp => write!(f, "reset-timestamp"),
            Command::SetSamplePeriod(ms) => write!(f, "set-sample-period({ms}ms)"),
            Command::DeepSleep => write!(f, "deep-sleep"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn firmware_record(tag: u8, ts: u32, data: [f32; 6]) -> Vec<u8> {
        let mut bytes = vec![tag, 0xAA, 0xBB, 0xCC];
        bytes.extend_from_slice(&ts.to_le_bytes());
        for v in data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_decode_firmware_layout() {
        let bytes = firmware_record(b'J', 150, [0.1, -0.2, 9.8, 1.0, 2.0, 3.0]);
        let record = WireRecord::decode(&bytes).unwrap();

        assert_eq!(record.tag, b'J');
        assert_eq!(record.timestamp_ms, 150);
        assert_eq!(record.payload, [0.1, -0.2, 9.8, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_decode_rejects_short_record() {
        let bytes = firmware_record(b'J', 0, [0.0; 6]);
        let err = WireRecord::decode(&bytes[..29]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Length {
                expected: 32,
                actual: 29
            }
        );
    }

    #[test]
    fn test_decode_rejects_nan() {
        let bytes = firmware_record(b'J', 0, [0.0, 0.0, f32::NAN, 0.0, 0.0, 0.0]);
        assert_eq!(
            WireRecord::decode(&bytes).unwrap_err(),
            DecodeError::NonFinite { index: 2 }
        );
    }

    #[test]
    fn test_command_encoding() {
        assert_eq!(Command::ResetTimestamp.encode(), [1, 0, 0, 0]);
        assert_eq!(Command::SetSamplePeriod(200).encode(), [2, 0, 200, 0]);
        assert_eq!(Command::DeepSleep.encode(), [3, 0, 0, 0]);
        assert_eq!(
            Command::decode(&[2, 0, 100, 0]).unwrap(),
            Command::SetSamplePeriod(100)
        );
        assert!(Command::decode(&[9, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_address_normalization() {
        assert_eq!(
            DeviceAddress::new(" aa:bb:cc:dd:ee:ff "),
            DeviceAddress::new("AA:BB:CC:DD:EE:FF")
        );
    }
}
