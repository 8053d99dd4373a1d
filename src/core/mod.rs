//! Frame synchronization and inference.
//!
//! This module contains:
//! - The timestamp aggregator that joins per-device samples into frames
//! - Frames and the per-session frame log, with CSV/JSON export
//! - Routing of frames to single-frame or windowed classifiers

pub mod aggregator;
pub mod frame;
pub mod inference;

pub use aggregator::{IngestOutcome, TimestampAggregator};
pub use frame::{ExportFormat, Frame, FrameLog};
pub use inference::{
    Classification, ClassifierError, FrameClassifier, InferencePlan, InferenceRouter, Label,
    LatestResult, SensingMode, SequenceClassifier, Window,
};
