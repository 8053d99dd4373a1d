//! Routing completed frames to a classifier.
//!
//! The router owns the batching policy only. Models are opaque capabilities
//! behind [`FrameClassifier`] and [`SequenceClassifier`]; the embedding
//! application loads them and binds them into an [`InferencePlan`].

use crate::core::frame::Frame;
use crate::stats::SharedStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Class label produced by a classifier.
pub type Label = String;

/// How frames are fed to the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensingMode {
    /// Every frame is classified on its own.
    SingleFrame,
    /// Frames are collected into windows of `steps` rows.
    Windowed { steps: usize },
}

impl fmt::Display for SensingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensingMode::SingleFrame => write!(f, "single-frame"),
            SensingMode::Windowed { steps } => write!(f, "windowed({steps})"),
        }
    }
}

/// Classifier failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifierError {
    InvalidInput(String),
    Inference(String),
    EmptyWindow,
}

impl fmt::Display for ClassifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassifierError::InvalidInput(e) => write!(f, "invalid input: {e}"),
            ClassifierError::Inference(e) => write!(f, "inference failed: {e}"),
            ClassifierError::EmptyWindow => write!(f, "window size must be at least 1"),
        }
    }
}

impl std::error::Error for ClassifierError {}

/// Classifies one payload vector (all devices, timestamp stripped).
pub trait FrameClassifier: Send + Sync {
    fn predict(&self, vector: &[f32]) -> Result<Label, ClassifierError>;
}

/// Classifies a full window: `steps` rows of payload vectors, oldest first.
pub trait SequenceClassifier: Send + Sync {
    fn predict(&self, window: &[Vec<f32>]) -> Result<Label, ClassifierError>;
}

impl<F> FrameClassifier for F
where
    F: Fn(&[f32]) -> Result<Label, ClassifierError> + Send + Sync,
{
    fn predict(&self, vector: &[f32]) -> Result<Label, ClassifierError> {
        self(vector)
    }
}

impl<F> SequenceClassifier for F
where
    F: Fn(&[Vec<f32>]) -> Result<Label, ClassifierError> + Send + Sync,
{
    fn predict(&self, window: &[Vec<f32>]) -> Result<Label, ClassifierError> {
        self(window)
    }
}

/// A sensing mode bound to the classifier it feeds.
#[derive(Clone)]
pub enum InferencePlan {
    SingleFrame(Arc<dyn FrameClassifier>),
    Windowed {
        steps: usize,
        classifier: Arc<dyn SequenceClassifier>,
    },
}

impl InferencePlan {
    pub fn single_frame(classifier: impl FrameClassifier + 'static) -> Self {
        InferencePlan::SingleFrame(Arc::new(classifier))
    }

    pub fn windowed(
        steps: usize,
        classifier: impl SequenceClassifier + 'static,
    ) -> Result<Self, ClassifierError> {
        if steps == 0 {
            return Err(ClassifierError::EmptyWindow);
        }
        Ok(InferencePlan::Windowed {
            steps,
            classifier: Arc::new(classifier),
        })
    }

    pub fn mode(&self) -> SensingMode {
        match self {
            InferencePlan::SingleFrame(_) => SensingMode::SingleFrame,
            InferencePlan::Windowed { steps, .. } => SensingMode::Windowed { steps: *steps },
        }
    }
}

impl fmt::Debug for InferencePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InferencePlan").field(&self.mode()).finish()
    }
}

/// Fixed-capacity buffer of payload vectors for windowed classification.
#[derive(Debug, Clone)]
pub struct Window {
    capacity: usize,
    rows: Vec<Vec<f32>>,
}

impl Window {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            rows: Vec::with_capacity(capacity),
        }
    }

    /// Append a row. When this fills the window, the rows are handed back and
    /// the window starts empty again.
    pub fn push(&mut self, row: Vec<f32>) -> Option<Vec<Vec<f32>>> {
        self.rows.push(row);
        if self.rows.len() >= self.capacity {
            Some(std::mem::replace(
                &mut self.rows,
                Vec::with_capacity(self.capacity),
            ))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One classifier output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: Label,
    /// Timestamp of the frame that triggered the classification.
    pub timestamp_ms: u32,
    pub produced_at: DateTime<Utc>,
}

/// Most recent classification, readable at any time.
///
/// New results overwrite old ones. Pollers that read slower than results are
/// produced see only the latest.
#[derive(Debug, Clone)]
pub struct LatestResult {
    tx: Arc<watch::Sender<Option<Classification>>>,
}

impl LatestResult {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> Option<Classification> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Classification>> {
        self.tx.subscribe()
    }

    pub fn publish(&self, result: Classification) {
        self.tx.send_replace(Some(result));
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }
}

impl Default for LatestResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Feeds completed frames to the session's classifier.
pub struct InferenceRouter {
    plan: InferencePlan,
    window: Mutex<Window>,
    latest: LatestResult,
    stats: SharedStats,
}

impl InferenceRouter {
    pub fn new(plan: InferencePlan, latest: LatestResult, stats: SharedStats) -> Self {
        let capacity = match plan.mode() {
            SensingMode::Windowed { steps } => steps,
            SensingMode::SingleFrame => 0,
        };
        Self {
            plan,
            window: Mutex::new(Window::new(capacity)),
            latest,
            stats,
        }
    }

    /// Rows currently buffered in the window.
    pub fn window_len(&self) -> usize {
        self.lock_window().len()
    }

    /// Route one frame. Returns a classification when one was produced.
    ///
    /// The classifier runs outside every lock.
    pub fn route(&self, frame: &Frame) -> Option<Classification> {
        let result = match &self.plan {
            InferencePlan::SingleFrame(classifier) => classifier.predict(&frame.vector()),
            InferencePlan::Windowed { classifier, .. } => {
                let full = self.lock_window().push(frame.vector());
                match full {
                    Some(rows) => classifier.predict(&rows),
                    None => return None,
                }
            }
        };

        match result {
            Ok(label) => {
                tracing::info!(
                    "{:.2}s | {}",
                    f64::from(frame.timestamp_ms) / 1000.0,
                    label
                );
                let classification = Classification {
                    label,
                    timestamp_ms: frame.timestamp_ms,
                    produced_at: Utc::now(),
                };
                self.stats.record_classification();
                self.latest.publish(classification.clone());
                Some(classification)
            }
            Err(e) => {
                tracing::warn!(timestamp_ms = frame.timestamp_ms, "classification failed: {e}");
                self.stats.record_classification_failure();
                None
            }
        }
    }

    fn lock_window(&self) -> std::sync::MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }
}
