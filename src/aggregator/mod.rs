//! IncidentAggregator - Detection Debounce State Machine
//!
//! ## Responsibilities
//!
//! - Turn one camera's noisy per-frame detections into stable,
//!   deduplicated incident open/close events
//! - EMA smoothing plus a strict consecutive-frame open gate
//! - Merge window: a reopen shortly after a close candidate continues
//!   the same incident, with no event pair for the gap
//! - Occlusion grace: a pts gap is a data hole, not incident end
//! - Flush at stream end so no incident is left unterminated
//!
//! All mutation is single-threaded inside the camera's aggregator
//! task; the state machine itself is pure and synchronous.

use crate::bus::{topic_for, topics, BusMessage, DeliveryMode, TopicBus};
use crate::config::AggregatorConfig;
use crate::model::{CloseReason, Detection, Incident, IncidentEvent};
use std::collections::VecDeque;
use tokio::sync::watch;

/// Aggregation state for one camera. At most one incident is active
/// or pending at any time.
#[derive(Debug)]
enum AggregatorState {
    Idle,
    Open(Incident),
    PendingClose {
        incident: Incident,
        /// Video time of the close candidate; the merge window is
        /// measured from here
        pending_ts: f64,
    },
}

/// Per-camera incident aggregator
pub struct IncidentAggregator {
    camera_id: String,
    session_id: String,
    config: AggregatorConfig,
    counter: u64,
    ema: f64,
    happened_streak: u32,
    neg_streak: u32,
    last_seen_pts: Option<f64>,
    /// Last `required_consecutive` detections, so an open can capture
    /// the first frame of the qualifying streak
    recent: VecDeque<(u64, f64)>,
    state: AggregatorState,
}

impl IncidentAggregator {
    pub fn new(camera_id: &str, session_id: &str, config: AggregatorConfig) -> Self {
        let ring_capacity = config.required_consecutive as usize + 1;
        Self {
            camera_id: camera_id.to_string(),
            session_id: session_id.to_string(),
            config,
            counter: 0,
            ema: 0.0,
            happened_streak: 0,
            neg_streak: 0,
            last_seen_pts: None,
            recent: VecDeque::with_capacity(ring_capacity),
            state: AggregatorState::Idle,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    fn next_incident_id(&mut self) -> String {
        self.counter += 1;
        format!("{}-{}-{:06}", self.session_id, self.camera_id, self.counter)
    }

    /// Feed one detection through the state machine; returns the
    /// events to publish (zero, one open, or one close).
    pub fn process(&mut self, det: &Detection) -> Vec<IncidentEvent> {
        let ts = det.pts_in_video;
        let conf = det.confidence;
        let mut out = Vec::new();

        // Expiry of a pending close is checked before anything else:
        // once this detection's pts is beyond the merge window the
        // candidate becomes final.
        if let AggregatorState::PendingClose { pending_ts, .. } = &self.state {
            if ts - pending_ts > self.config.merge_gap_sec {
                if let AggregatorState::PendingClose { incident, .. } =
                    std::mem::replace(&mut self.state, AggregatorState::Idle)
                {
                    tracing::info!(
                        camera_id = %self.camera_id,
                        incident_id = %incident.id,
                        "merge window expired, incident closed"
                    );
                    out.push(IncidentEvent::close(&incident, CloseReason::MergeWindowExpired));
                }
            }
        }

        // A pts gap beyond the grace window means we were blind, not
        // that the incident ended; negative evolution is frozen.
        let occlusion_ok = match self.last_seen_pts {
            Some(prev) => ts - prev <= self.config.occlusion_grace_sec,
            None => true,
        };
        self.last_seen_pts = Some(ts);

        self.ema = self.config.alpha * conf + (1.0 - self.config.alpha) * self.ema;

        if det.happened {
            self.happened_streak += 1;
        } else {
            self.happened_streak = 0;
        }
        if self.ema <= self.config.exit_threshold && occlusion_ok {
            self.neg_streak += 1;
        } else {
            self.neg_streak = 0;
        }

        self.recent.push_back((det.frame_idx, ts));
        if self.recent.len() > self.config.required_consecutive as usize {
            self.recent.pop_front();
        }

        // Open decision (also the reopen path out of PendingClose)
        if !matches!(self.state, AggregatorState::Open(_))
            && self.happened_streak >= self.config.required_consecutive
        {
            self.happened_streak = 0;
            match std::mem::replace(&mut self.state, AggregatorState::Idle) {
                AggregatorState::PendingClose { mut incident, .. } => {
                    // Reopen inside the merge window: same incident
                    // continues; nothing is published for the gap.
                    incident.end_ts = ts;
                    incident.end_idx = det.frame_idx;
                    incident.peak_confidence = incident.peak_confidence.max(conf);
                    incident.positive_frame_count += 1;
                    tracing::info!(
                        camera_id = %self.camera_id,
                        incident_id = %incident.id,
                        "reopen within merge window, incident continues"
                    );
                    self.state = AggregatorState::Open(incident);
                }
                _ => {
                    // The streak head is the oldest entry in the
                    // recent ring: the run's first frame.
                    let (start_idx, start_ts) =
                        self.recent.front().copied().unwrap_or((det.frame_idx, ts));
                    let incident = Incident {
                        id: self.next_incident_id(),
                        camera_id: self.camera_id.clone(),
                        start_ts,
                        end_ts: ts,
                        start_idx,
                        end_idx: det.frame_idx,
                        peak_confidence: conf,
                        positive_frame_count: 1,
                    };
                    tracing::info!(
                        camera_id = %self.camera_id,
                        incident_id = %incident.id,
                        start_ts = start_ts,
                        "incident opened"
                    );
                    out.push(IncidentEvent::open(&incident));
                    self.state = AggregatorState::Open(incident);
                }
            }
            return out;
        }

        // Ongoing incident update and close decision
        if let AggregatorState::Open(incident) = &mut self.state {
            incident.end_ts = ts;
            incident.end_idx = det.frame_idx;
            incident.peak_confidence = incident.peak_confidence.max(conf);
            if det.happened {
                incident.positive_frame_count += 1;
            }

            if self.ema <= self.config.exit_threshold
                && self.neg_streak >= self.config.min_end_neg_frames
            {
                if let AggregatorState::Open(incident) =
                    std::mem::replace(&mut self.state, AggregatorState::Idle)
                {
                    tracing::info!(
                        camera_id = %self.camera_id,
                        incident_id = %incident.id,
                        end_ts = incident.end_ts,
                        "close candidate, merge window opens"
                    );
                    let pending_ts = incident.end_ts;
                    self.state = AggregatorState::PendingClose {
                        incident,
                        pending_ts,
                    };
                }
                self.ema = 0.0;
                self.neg_streak = 0;
            }
        }

        out
    }

    /// Terminate at stream end: a pending close is published with no
    /// further grace, a still-open incident is force-closed. At most
    /// one close per active or pending incident.
    pub fn flush(&mut self) -> Vec<IncidentEvent> {
        match std::mem::replace(&mut self.state, AggregatorState::Idle) {
            AggregatorState::PendingClose { incident, .. } => {
                tracing::info!(
                    camera_id = %self.camera_id,
                    incident_id = %incident.id,
                    "flush: pending close published"
                );
                vec![IncidentEvent::close(&incident, CloseReason::FlushPending)]
            }
            AggregatorState::Open(incident) => {
                tracing::info!(
                    camera_id = %self.camera_id,
                    incident_id = %incident.id,
                    "flush: open incident force-closed"
                );
                vec![IncidentEvent::close(&incident, CloseReason::FlushOpen)]
            }
            AggregatorState::Idle => Vec::new(),
        }
    }
}

/// Aggregator task for one camera: consumes `detection:<cam>`,
/// publishes to `incident.open:<cam>` / `incident.close:<cam>`.
/// Exits after a flush is requested (or the flush sender is dropped).
pub async fn run_aggregator(
    bus: TopicBus,
    mut aggregator: IncidentAggregator,
    mut flush_rx: watch::Receiver<bool>,
) {
    let camera_id = aggregator.camera_id().to_string();
    let mut sub = bus.subscribe(
        &topic_for(topics::DETECTION, &camera_id),
        DeliveryMode::Fifo,
        128,
    );
    loop {
        tokio::select! {
            msg = sub.recv() => {
                if let Some(det) = msg.into_detection() {
                    for event in aggregator.process(&det) {
                        publish_incident_event(&bus, &camera_id, event);
                    }
                }
            }
            _ = flush_rx.changed() => {
                for event in aggregator.flush() {
                    publish_incident_event(&bus, &camera_id, event);
                }
                break;
            }
        }
    }
}

fn publish_incident_event(bus: &TopicBus, camera_id: &str, event: IncidentEvent) {
    let base = if event.is_open() {
        topics::INCIDENT_OPEN
    } else {
        topics::INCIDENT_CLOSE
    };
    bus.publish_partitioned(base, camera_id, BusMessage::Incident(event));
}
