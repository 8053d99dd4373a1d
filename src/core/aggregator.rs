//! Timestamp aggregation: turns per-device samples into synchronized frames.
//!
//! Every device's notification task feeds samples in here. Samples are
//! grouped by their device timestamp; once every expected device has reported
//! for a timestamp, the group is emitted as a [`Frame`] exactly once and
//! forgotten. Reports arriving for an already emitted timestamp are dropped.
//!
//! Only the most recent [`EMITTED_HISTORY`] emitted timestamps are remembered.
//! Anything at or below the oldest forgotten one counts as late.

use crate::core::frame::Frame;
use crate::device::types::{DeviceId, Payload, Sample};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

/// Emitted timestamps kept for late-report detection.
pub const EMITTED_HISTORY: usize = 1024;

/// What happened to one offered sample.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Recorded; the timestamp still waits for other devices.
    Pending { reported: usize },
    /// This sample completed its timestamp.
    Completed(Frame),
    /// The device already reported for this timestamp.
    Duplicate,
    /// The frame for this timestamp was already emitted.
    Late,
}

impl IngestOutcome {
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            IngestOutcome::Completed(frame) => Some(frame),
            _ => None,
        }
    }
}

/// Samples received so far for one timestamp.
#[derive(Debug, Default)]
struct PendingFrame {
    readings: BTreeMap<DeviceId, Payload>,
}

#[derive(Debug)]
struct AggregatorState {
    expected: usize,
    pending: HashMap<u32, PendingFrame>,
    emitted: BTreeSet<u32>,
    /// Newest timestamp dropped from `emitted`.
    floor: Option<u32>,
}

impl AggregatorState {
    fn already_emitted(&self, ts: u32) -> bool {
        self.floor.is_some_and(|floor| ts <= floor) || self.emitted.contains(&ts)
    }

    fn mark_emitted(&mut self, ts: u32) {
        self.emitted.insert(ts);
        while self.emitted.len() > EMITTED_HISTORY {
            if let Some(oldest) = self.emitted.pop_first() {
                self.floor = Some(self.floor.map_or(oldest, |f| f.max(oldest)));
            }
        }
    }
}

/// Session-owned aggregation table.
///
/// The whole insert/count/emit sequence for a sample runs under one lock, so
/// two devices can never both observe the completing count.
#[derive(Debug)]
pub struct TimestampAggregator {
    state: Mutex<AggregatorState>,
}

impl TimestampAggregator {
    /// Create an aggregator expecting `expected` distinct devices per timestamp.
    pub fn new(expected: usize) -> Self {
        debug_assert!(expected >= 1, "a session needs at least one device");
        Self {
            state: Mutex::new(AggregatorState {
                expected,
                pending: HashMap::new(),
                emitted: BTreeSet::new(),
                floor: None,
            }),
        }
    }

    /// Offer a sample and report what became of it.
    pub fn offer(&self, sample: Sample) -> IngestOutcome {
        let mut state = self.lock();
        let ts = sample.timestamp_ms;

        if state.already_emitted(ts) {
            return IngestOutcome::Late;
        }

        let expected = state.expected;
        let entry = state.pending.entry(ts).or_default();
        if entry.readings.contains_key(&sample.device_id) {
            return IngestOutcome::Duplicate;
        }
        entry.readings.insert(sample.device_id, sample.payload);

        let reported = entry.readings.len();
        if reported < expected {
            return IngestOutcome::Pending { reported };
        }

        let readings = state
            .pending
            .remove(&ts)
            .map(|p| p.readings)
            .unwrap_or_default();
        state.mark_emitted(ts);
        IngestOutcome::Completed(Frame::from_readings(ts, readings))
    }

    /// Offer a sample; returns the frame if this sample completed one.
    pub fn ingest(&self, sample: Sample) -> Option<Frame> {
        self.offer(sample).into_frame()
    }

    /// Number of timestamps still waiting for devices.
    pub fn pending_timestamps(&self) -> usize {
        self.lock().pending.len()
    }

    /// Drop all incomplete timestamps, returning how many there were.
    pub fn discard_pending(&self) -> usize {
        let mut state = self.lock();
        let count = state.pending.len();
        state.pending.clear();
        count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
