//! Synchronized frames and the per-session frame log.
//!
//! A frame is one row of the output table: the device timestamp followed by
//! every device's payload, devices in ascending name order.

use crate::device::types::{DeviceId, Payload, AXIS_LABELS, PAYLOAD_LEN};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

/// One synchronized reading across all devices of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub timestamp_ms: u32,
    /// Device names, ascending. Parallel to `payloads`.
    pub devices: Vec<DeviceId>,
    pub payloads: Vec<Payload>,
}

impl Frame {
    /// Build a frame from readings keyed by device. The map order fixes the
    /// column order, so arrival order never matters.
    pub fn from_readings(timestamp_ms: u32, readings: BTreeMap<DeviceId, Payload>) -> Self {
        let (devices, payloads) = readings.into_iter().unzip();
        Self {
            timestamp_ms,
            devices,
            payloads,
        }
    }

    /// All payload values in column order, without the timestamp.
    pub fn vector(&self) -> Vec<f32> {
        self.payloads.iter().flatten().copied().collect()
    }

    pub fn payload(&self, device: &DeviceId) -> Option<&Payload> {
        self.devices
            .iter()
            .position(|d| d == device)
            .map(|i| &self.payloads[i])
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

/// Output file format for a frame log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(format!("unknown export format '{other}' (expected csv or json)")),
        }
    }
}

/// Every frame completed during one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameLog {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Devices of the session, ascending. Matches the column order of every frame.
    pub devices: Vec<DeviceId>,
    frames: Vec<Frame>,
}

impl FrameLog {
    pub fn new(devices: impl IntoIterator<Item = DeviceId>) -> Self {
        let mut devices: Vec<DeviceId> = devices.into_iter().collect();
        devices.sort();
        devices.dedup();
        Self {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            devices,
            frames: Vec::new(),
        }
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Reorder frames by timestamp. Emission order can differ when the radio
    /// reorders deliveries across devices.
    pub fn finalize(mut self) -> Self {
        self.frames.sort_by_key(|f| f.timestamp_ms);
        self
    }

    /// Column names: `ms` then `<device><axis>` per device.
    pub fn header(&self) -> Vec<String> {
        let mut header = Vec::with_capacity(1 + self.devices.len() * PAYLOAD_LEN);
        header.push("ms".to_string());
        for device in &self.devices {
            for axis in AXIS_LABELS {
                header.push(format!("{device}{axis}"));
            }
        }
        header
    }

    pub fn write_csv<W: Write>(&self, mut out: W) -> std::io::Result<()> {
        writeln!(out, "{}", self.header().join(","))?;
        for frame in &self.frames {
            write!(out, "{}", frame.timestamp_ms)?;
            for value in frame.payloads.iter().flatten() {
                write!(out, ",{value}")?;
            }
            writeln!(out)?;
        }
        out.flush()
    }

    pub fn write_json<W: Write>(&self, out: W) -> std::io::Result<()> {
        serde_json::to_writer_pretty(out, self).map_err(std::io::Error::other)
    }

    /// Default export name, e.g. `20240122_101500_sensor.csv`.
    pub fn file_name(&self, format: ExportFormat) -> String {
        format!(
            "{}_sensor.{}",
            self.started_at.format("%Y%m%d_%H%M%S"),
            format.extension()
        )
    }

    /// Write the log to `path`, creating parent directories.
    pub fn save(&self, path: &Path, format: ExportFormat) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::io::BufWriter::new(std::fs::File::create(path)?);
        match format {
            ExportFormat::Csv => self.write_csv(file),
            ExportFormat::Json => self.write_json(file),
        }
    }
}
