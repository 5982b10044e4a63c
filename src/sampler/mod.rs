//! EqualTimeSampler - Fixed-Grid Frame Re-Timing
//!
//! ## Responsibilities
//!
//! - Re-time a variable-rate raw frame stream onto a fixed grid of
//!   step `1 / target_fps`, anchored to video time
//! - Repeat frames when the source is slower than the grid, skip
//!   frames when it is faster
//!
//! The output clock never drifts with wall-clock stalls because every
//! decision is made against `pts_in_video`.

use crate::bus::{topic_for, topics, BusMessage, DeliveryMode, TopicBus};
use crate::config::SamplerConfig;

/// Pure re-timing core. One instance per camera stream.
#[derive(Debug)]
pub struct EqualTimeSampler {
    step: f64,
    epsilon: f64,
    next_emit_pts: Option<f64>,
}

impl EqualTimeSampler {
    pub fn new(config: &SamplerConfig) -> Self {
        Self {
            step: 1.0 / config.target_fps.max(1e-3),
            epsilon: config.epsilon,
            next_emit_pts: None,
        }
    }

    /// Offer one frame's pts; returns how many times that frame
    /// satisfies the grid (0 = skip, >1 = repeat).
    ///
    /// The grid anchors on the first observed pts. The while-loop
    /// advance keeps the grid from drifting when a frame jumps over
    /// several grid points at once.
    pub fn offer(&mut self, pts: f64) -> u32 {
        let next = self.next_emit_pts.get_or_insert(pts);
        let mut emitted = 0;
        while pts + self.epsilon >= *next {
            *next += self.step;
            emitted += 1;
        }
        emitted
    }
}

/// Sampler task for one camera: `frames_raw:<cam>` -> `frames:<cam>`.
/// Runs until cancelled by the session supervisor.
pub async fn run_sampler(bus: TopicBus, camera_id: String, config: SamplerConfig) {
    let mut sub = bus.subscribe(
        &topic_for(topics::FRAMES_RAW, &camera_id),
        DeliveryMode::Fifo,
        64,
    );
    let topic_out = topic_for(topics::FRAMES, &camera_id);
    let mut sampler = EqualTimeSampler::new(&config);

    loop {
        let Some(frame) = sub.recv().await.into_frame() else {
            continue;
        };
        let repeats = sampler.offer(frame.pts_in_video);
        if repeats == 0 {
            continue;
        }
        for _ in 1..repeats {
            bus.publish(&topic_out, BusMessage::Frame(frame.clone()));
        }
        bus.publish(&topic_out, BusMessage::Frame(frame));
    }
}
