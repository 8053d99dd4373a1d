//! Collection counters.
//!
//! Tracks what happened to every record the gateway received, so dropped
//! samples are visible instead of silently lost.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Why a record did not contribute to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Arrived while no session was collecting.
    NotCollecting,
    /// Could not be decoded.
    Malformed,
    /// Second report from the same device for an open timestamp.
    Duplicate,
    /// Its timestamp had already been emitted as a frame.
    Late,
}

/// Counters for the current process, optionally persisted as cumulative totals.
#[derive(Debug)]
pub struct CollectionStats {
    samples_received: AtomicU64,
    samples_ignored: AtomicU64,
    samples_malformed: AtomicU64,
    samples_duplicate: AtomicU64,
    samples_late: AtomicU64,
    frames_emitted: AtomicU64,
    incomplete_discarded: AtomicU64,
    classifications: AtomicU64,
    classification_failures: AtomicU64,
    sessions_completed: AtomicU64,
    started: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl CollectionStats {
    pub fn new() -> Self {
        Self {
            samples_received: AtomicU64::new(0),
            samples_ignored: AtomicU64::new(0),
            samples_malformed: AtomicU64::new(0),
            samples_duplicate: AtomicU64::new(0),
            samples_late: AtomicU64::new(0),
            frames_emitted: AtomicU64::new(0),
            incomplete_discarded: AtomicU64::new(0),
            classifications: AtomicU64::new(0),
            classification_failures: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            started: Utc::now(),
            persist_path: None,
        }
    }

    /// Counters that continue from the totals saved at `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.persist_path = Some(path);

        if let Err(e) = stats.load() {
            tracing::warn!("could not load previous collection stats: {e}");
        }

        stats
    }

    pub fn record_sample(&self) {
        self.samples_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::NotCollecting => &self.samples_ignored,
            DropReason::Malformed => &self.samples_malformed,
            DropReason::Duplicate => &self.samples_duplicate,
            DropReason::Late => &self.samples_late,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame(&self) {
        self.frames_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_incomplete(&self, count: u64) {
        self.incomplete_discarded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_classification(&self) {
        self.classifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_classification_failure(&self) {
        self.classification_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            samples_received: self.samples_received.load(Ordering::Relaxed),
            samples_ignored: self.samples_ignored.load(Ordering::Relaxed),
            samples_malformed: self.samples_malformed.load(Ordering::Relaxed),
            samples_duplicate: self.samples_duplicate.load(Ordering::Relaxed),
            samples_late: self.samples_late.load(Ordering::Relaxed),
            frames_emitted: self.frames_emitted.load(Ordering::Relaxed),
            incomplete_discarded: self.incomplete_discarded.load(Ordering::Relaxed),
            classifications: self.classifications.load(Ordering::Relaxed),
            classification_failures: self.classification_failures.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            since: self.started,
        }
    }

    pub fn summary(&self) -> String {
        let s = self.stats();
        format!(
            "Collection Statistics:\n\
             - Samples received: {}\n\
             - Ignored outside collection: {}\n\
             - Malformed: {}\n\
             - Duplicate: {}\n\
             - Late: {}\n\
             - Frames emitted: {}\n\
             - Incomplete timestamps discarded: {}\n\
             - Classifications: {} ({} failed)\n\
             - Sessions completed: {}",
            s.samples_received,
            s.samples_ignored,
            s.samples_malformed,
            s.samples_duplicate,
            s.samples_late,
            s.frames_emitted,
            s.incomplete_discarded,
            s.classifications,
            s.classification_failures,
            s.sessions_completed,
        )
    }

    /// Save totals to disk. No-op without a persistence path.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let persisted = PersistedStats {
                totals: self.stats(),
                last_updated: Utc::now(),
            };
            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    /// Read persisted totals without creating a live counter set.
    pub fn read_persisted(path: &std::path::Path) -> Result<StatsSnapshot, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        let persisted: PersistedStats =
            serde_json::from_str(&content).map_err(std::io::Error::other)?;
        Ok(persisted.totals)
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let t = Self::read_persisted(path)?;
                self.samples_received.store(t.samples_received, Ordering::Relaxed);
                self.samples_ignored.store(t.samples_ignored, Ordering::Relaxed);
                self.samples_malformed.store(t.samples_malformed, Ordering::Relaxed);
                self.samples_duplicate.store(t.samples_duplicate, Ordering::Relaxed);
                self.samples_late.store(t.samples_late, Ordering::Relaxed);
                self.frames_emitted.store(t.frames_emitted, Ordering::Relaxed);
                self.incomplete_discarded
                    .store(t.incomplete_discarded, Ordering::Relaxed);
                self.classifications.store(t.classifications, Ordering::Relaxed);
                self.classification_failures
                    .store(t.classification_failures, Ordering::Relaxed);
                self.sessions_completed
                    .store(t.sessions_completed, Ordering::Relaxed);
                self.started = t.since;
            }
        }
        Ok(())
    }
}

impl Default for CollectionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub samples_received: u64,
    pub samples_ignored: u64,
    pub samples_malformed: u64,
    pub samples_duplicate: u64,
    pub samples_late: u64,
    pub frames_emitted: u64,
    pub incomplete_discarded: u64,
    pub classifications: u64,
    pub classification_failures: u64,
    pub sessions_completed: u64,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    totals: StatsSnapshot,
    last_updated: DateTime<Utc>,
}

/// Counters shared between the controller, device tasks and drivers.
pub type SharedStats = Arc<CollectionStats>;

pub fn create_shared_stats() -> SharedStats {
    Arc::new(CollectionStats::new())
}

pub fn create_shared_stats_with_persistence(path: PathBuf) -> SharedStats {
    Arc::new(CollectionStats::with_persistence(path))
}
