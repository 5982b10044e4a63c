//! FrameScorer - External Batch Classifier Contract
//!
//! ## Responsibilities
//!
//! - Define the seam between the scheduler and the neural scorer
//! - Per-item failure isolation: one bad frame never aborts a batch
//!
//! The real scorer (model runtime, GPU plumbing) lives outside this
//! crate. [`StubScorer`] is the in-crate backend for tests and the
//! demo runner.

use crate::error::Result;
use crate::model::Frame;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One scoring outcome: event label plus confidence in [0, 1]
#[derive(Debug, Clone)]
pub struct Score {
    pub label: String,
    pub confidence: f64,
}

/// Batch classifier. Called off the cooperative loop (blocking worker
/// pool); must return one result per input within bounded time. The
/// scheduler maps a per-item `Err` (or a missing trailing output) to
/// confidence 0.
pub trait FrameScorer: Send + Sync {
    fn score_batch(&self, batch: &[Frame]) -> Vec<Result<Score>>;
}

/// Scripted scorer: per-camera confidence schedules, consumed one
/// value per scored frame. Frames past the end of a schedule (or for
/// an unscripted camera) score the default confidence.
pub struct StubScorer {
    label: String,
    default_confidence: f64,
    schedules: Mutex<HashMap<String, VecDeque<f64>>>,
}

impl StubScorer {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            default_confidence: 0.0,
            schedules: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a confidence sequence for one camera
    pub fn schedule(self, camera_id: &str, confidences: impl IntoIterator<Item = f64>) -> Self {
        self.lock()
            .entry(camera_id.to_string())
            .or_default()
            .extend(confidences);
        self
    }

    pub fn with_default_confidence(mut self, confidence: f64) -> Self {
        self.default_confidence = confidence;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<f64>>> {
        self.schedules.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameScorer for StubScorer {
    fn score_batch(&self, batch: &[Frame]) -> Vec<Result<Score>> {
        let mut schedules = self.lock();
        batch
            .iter()
            .map(|frame| {
                let confidence = schedules
                    .get_mut(&frame.camera_id)
                    .and_then(|q| q.pop_front())
                    .unwrap_or(self.default_confidence);
                Ok(Score {
                    label: self.label.clone(),
                    confidence,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PixelBuffer;
    use std::sync::Arc;

    fn frame(camera_id: &str, idx: u64) -> Frame {
        Frame {
            camera_id: camera_id.to_string(),
            wall_clock_ts: chrono::Utc::now(),
            pixels: Arc::new(PixelBuffer::blank(4, 4)),
            frame_idx: idx,
            pts_in_video: idx as f64 / 10.0,
        }
    }

    #[test]
    fn test_schedule_consumed_in_order_per_camera() {
        let scorer = StubScorer::new("accident")
            .schedule("cam-1", [0.9, 0.1])
            .schedule("cam-2", [0.5]);
        let batch = vec![frame("cam-1", 0), frame("cam-2", 0), frame("cam-1", 1)];
        let scores: Vec<f64> = scorer
            .score_batch(&batch)
            .into_iter()
            .map(|r| r.unwrap().confidence)
            .collect();
        assert_eq!(scores, [0.9, 0.5, 0.1]);
    }

    #[test]
    fn test_exhausted_schedule_falls_back_to_default() {
        let scorer = StubScorer::new("accident").schedule("cam-1", [0.9]);
        let batch = vec![frame("cam-1", 0), frame("cam-1", 1)];
        let scores = scorer.score_batch(&batch);
        assert_eq!(scores[1].as_ref().unwrap().confidence, 0.0);
    }
}
