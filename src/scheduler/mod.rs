//! BatchScheduler - Multi-Camera Inference Batching
//!
//! ## Responsibilities
//!
//! - Fair round-robin assembly of fixed-size batches across cameras
//! - Per-camera bounded backing buffers (drop-oldest) so no camera
//!   can starve or bloat the batch loop
//! - Delegate scoring to the blocking worker pool so inference never
//!   blocks frame intake
//! - Republish per-camera detections paired to inputs by position
//!
//! One instance is shared by every session; the camera set changes as
//! sessions start and stop.

use crate::bus::{topic_for, topics, BusMessage, DeliveryMode, TopicBus};
use crate::config::SchedulerConfig;
use crate::model::{Detection, Frame};
use crate::scoring::FrameScorer;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Bounded single-producer/single-consumer frame buffer with
/// drop-oldest overflow
struct FrameBuffer {
    capacity: usize,
    frames: Mutex<VecDeque<Frame>>,
}

impl FrameBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            frames: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, frame: Frame) {
        let mut frames = self.lock();
        if frames.len() >= self.capacity {
            frames.pop_front();
        }
        frames.push_back(frame);
    }

    fn pop(&self) -> Option<Frame> {
        self.lock().pop_front()
    }
}

struct CameraEntry {
    camera_id: String,
    buffer: Arc<FrameBuffer>,
    forwarder: JoinHandle<()>,
}

struct CameraSet {
    entries: Vec<CameraEntry>,
    cursor: usize,
}

/// Shared multi-camera batch scheduler
pub struct BatchScheduler {
    bus: TopicBus,
    scorer: Arc<dyn FrameScorer>,
    config: SchedulerConfig,
    cameras: Mutex<CameraSet>,
}

impl BatchScheduler {
    pub fn new(bus: TopicBus, scorer: Arc<dyn FrameScorer>, config: SchedulerConfig) -> Self {
        Self {
            bus,
            scorer,
            config,
            cameras: Mutex::new(CameraSet {
                entries: Vec::new(),
                cursor: 0,
            }),
        }
    }

    fn lock_cameras(&self) -> MutexGuard<'_, CameraSet> {
        self.cameras.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a camera: spawns a forwarding task draining the
    /// camera's sampled-frame subscription into its backing buffer.
    /// Must run on the pipeline runtime. Re-adding is a no-op.
    pub fn add_camera(&self, camera_id: &str) {
        let mut set = self.lock_cameras();
        if set.entries.iter().any(|e| e.camera_id == camera_id) {
            return;
        }
        let buffer = Arc::new(FrameBuffer::new(self.config.buffer_capacity));
        let mut sub = self.bus.subscribe(
            &topic_for(topics::FRAMES, camera_id),
            DeliveryMode::Fifo,
            self.config.forward_capacity,
        );
        let forward_buffer = buffer.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                if let Some(frame) = sub.recv().await.into_frame() {
                    forward_buffer.push(frame);
                }
            }
        });
        set.entries.push(CameraEntry {
            camera_id: camera_id.to_string(),
            buffer,
            forwarder,
        });
        tracing::info!(camera_id = %camera_id, cameras = set.entries.len(), "scheduler camera added");
    }

    /// Detach a camera and stop its forwarding task
    pub fn remove_camera(&self, camera_id: &str) {
        let mut set = self.lock_cameras();
        let Some(pos) = set.entries.iter().position(|e| e.camera_id == camera_id) else {
            return;
        };
        let entry = set.entries.remove(pos);
        entry.forwarder.abort();
        if !set.entries.is_empty() {
            set.cursor %= set.entries.len();
        } else {
            set.cursor = 0;
        }
        tracing::info!(camera_id = %camera_id, cameras = set.entries.len(), "scheduler camera removed");
    }

    /// Number of attached cameras
    pub fn camera_count(&self) -> usize {
        self.lock_cameras().entries.len()
    }

    /// Batch loop. Runs until the task is cancelled.
    pub async fn run(self: Arc<Self>) {
        let poll = Duration::from_millis(self.config.poll_ms.max(1));
        loop {
            let batch = self.collect_batch();
            if batch.is_empty() {
                tokio::time::sleep(poll).await;
                continue;
            }

            let scorer = self.scorer.clone();
            let frames = batch.clone();
            let outputs =
                match tokio::task::spawn_blocking(move || scorer.score_batch(&frames)).await {
                    Ok(outputs) => outputs,
                    Err(e) => {
                        tracing::error!(error = %e, batch = batch.len(), "scoring call failed");
                        Vec::new()
                    }
                };
            self.publish_results(&batch, outputs);
        }
    }

    /// Round-robin collection: at most one frame per camera per
    /// visit, until `batch_size` or a full empty cycle.
    fn collect_batch(&self) -> Vec<Frame> {
        let mut set = self.lock_cameras();
        let camera_count = set.entries.len();
        if camera_count == 0 {
            return Vec::new();
        }
        let mut batch = Vec::with_capacity(self.config.batch_size);
        let mut empty_streak = 0;
        while batch.len() < self.config.batch_size && empty_streak < camera_count {
            let index = set.cursor % camera_count;
            set.cursor = (set.cursor + 1) % camera_count;
            match set.entries[index].buffer.pop() {
                Some(frame) => {
                    batch.push(frame);
                    empty_streak = 0;
                }
                None => empty_streak += 1,
            }
        }
        batch
    }

    /// Pair outputs to inputs by position and publish one detection
    /// per frame. A missing or failed output scores confidence 0.
    fn publish_results(&self, batch: &[Frame], outputs: Vec<crate::error::Result<crate::scoring::Score>>) {
        let mut outputs = outputs.into_iter();
        for frame in batch {
            let (label, confidence) = match outputs.next() {
                Some(Ok(score)) => (score.label, score.confidence),
                Some(Err(e)) => {
                    tracing::warn!(
                        camera_id = %frame.camera_id,
                        frame_idx = frame.frame_idx,
                        error = %e,
                        "per-item scoring failure, treating as negative"
                    );
                    (self.config.label.clone(), 0.0)
                }
                None => {
                    tracing::warn!(
                        camera_id = %frame.camera_id,
                        frame_idx = frame.frame_idx,
                        "scorer returned no output for item, treating as negative"
                    );
                    (self.config.label.clone(), 0.0)
                }
            };
            let happened = confidence >= self.config.decision_threshold;
            let detection = Detection::from_frame(frame, label, confidence, happened);
            self.bus.publish_partitioned(
                topics::DETECTION,
                &frame.camera_id,
                BusMessage::Detection(detection),
            );
        }
    }
}

impl Drop for BatchScheduler {
    fn drop(&mut self) {
        let set = self.lock_cameras();
        for entry in &set.entries {
            entry.forwarder.abort();
        }
    }
}
