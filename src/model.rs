//! Core data model
//!
//! Frames and detections are transient: created, carried across the
//! bus once and discarded. Incidents are owned by one camera's
//! aggregator until they are emitted as events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Decoded image payload, shared by reference across pipeline stages
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    /// Packed RGB bytes, `width * height * 3`
    pub data: Vec<u8>,
}

impl PixelBuffer {
    /// Zero-filled buffer, used by synthetic sources
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; (width * height * 3) as usize],
        }
    }
}

/// One decoded video frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub camera_id: String,
    pub wall_clock_ts: DateTime<Utc>,
    pub pixels: Arc<PixelBuffer>,
    /// 0-based, monotonic per camera
    pub frame_idx: u64,
    /// Position in video time, seconds, monotonic per camera
    pub pts_in_video: f64,
}

/// Per-frame scoring outcome for one camera
#[derive(Debug, Clone)]
pub struct Detection {
    pub label: String,
    pub camera_id: String,
    pub wall_clock_ts: DateTime<Utc>,
    pub happened: bool,
    pub confidence: f64,
    pub frame_idx: u64,
    pub pts_in_video: f64,
}

impl Detection {
    /// Build a detection from the frame it scored. Confidence is
    /// clamped into [0, 1] at construction.
    pub fn from_frame(frame: &Frame, label: String, confidence: f64, happened: bool) -> Self {
        Self {
            label,
            camera_id: frame.camera_id.clone(),
            wall_clock_ts: frame.wall_clock_ts,
            happened,
            confidence: confidence.clamp(0.0, 1.0),
            frame_idx: frame.frame_idx,
            pts_in_video: frame.pts_in_video,
        }
    }
}

/// A contiguous, possibly merged, span of positive detections.
///
/// Exclusively owned and mutated by its camera's aggregator until it
/// is emitted by value inside an [`IncidentEvent`].
#[derive(Debug, Clone, PartialEq)]
pub struct Incident {
    /// Unique per camera and session
    pub id: String,
    pub camera_id: String,
    /// Video-time span, seconds
    pub start_ts: f64,
    pub end_ts: f64,
    pub start_idx: u64,
    pub end_idx: u64,
    pub peak_confidence: f64,
    pub positive_frame_count: u64,
}

/// Why a close event was emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Merge window elapsed with no reopen
    MergeWindowExpired,
    /// Pending close published at stream end
    FlushPending,
    /// Still-open incident force-closed at stream end
    FlushOpen,
}

/// Incident lifecycle event delivered to bus consumers.
///
/// Consumers must tolerate a close whose incident_id they never saw an
/// open for; fresh subscriptions have no replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IncidentEvent {
    Open {
        camera_id: String,
        incident_id: String,
        frame_idx: u64,
        pts_in_video: f64,
        confidence: f64,
        positive_frame_count: u64,
    },
    Close {
        camera_id: String,
        incident_id: String,
        start_ts: f64,
        end_ts: f64,
        start_idx: u64,
        end_idx: u64,
        duration_sec: f64,
        peak_confidence: f64,
        positive_frame_count: u64,
        reason: CloseReason,
    },
}

impl IncidentEvent {
    /// Open event for a freshly opened incident
    pub fn open(incident: &Incident) -> Self {
        Self::Open {
            camera_id: incident.camera_id.clone(),
            incident_id: incident.id.clone(),
            frame_idx: incident.start_idx,
            pts_in_video: incident.start_ts,
            confidence: incident.peak_confidence.clamp(0.0, 1.0),
            positive_frame_count: incident.positive_frame_count,
        }
    }

    /// Close event for a finished incident
    pub fn close(incident: &Incident, reason: CloseReason) -> Self {
        Self::Close {
            camera_id: incident.camera_id.clone(),
            incident_id: incident.id.clone(),
            start_ts: incident.start_ts,
            end_ts: incident.end_ts,
            start_idx: incident.start_idx,
            end_idx: incident.end_idx,
            duration_sec: (incident.end_ts - incident.start_ts).max(0.0),
            peak_confidence: incident.peak_confidence.clamp(0.0, 1.0),
            positive_frame_count: incident.positive_frame_count,
            reason,
        }
    }

    pub fn camera_id(&self) -> &str {
        match self {
            Self::Open { camera_id, .. } | Self::Close { camera_id, .. } => camera_id,
        }
    }

    pub fn incident_id(&self) -> &str {
        match self {
            Self::Open { incident_id, .. } | Self::Close { incident_id, .. } => incident_id,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}
