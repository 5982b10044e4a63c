//! FrameSource - Stream Decode Task
//!
//! ## Responsibilities
//!
//! - Drive one camera's decoder at native rate
//! - Tag frames with `frame_idx` and `pts_in_video`
//! - Publish every decoded frame (no dropping) to `frames_raw:<cam>`
//! - End-of-stream terminates the task; live read failures retry
//!
//! Decoding itself is an external collaborator behind [`VideoSource`];
//! this crate ships only a scripted implementation for tests and the
//! demo runner.

use crate::bus::{topics, BusMessage, TopicBus};
use crate::error::Result;
use crate::model::{Frame, PixelBuffer};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Longest idle wait between retries on a starved live source
const MAX_IDLE_WAIT_MS: u64 = 500;

/// Declared rates above this are container garbage, not real fps
const MAX_PLAUSIBLE_FPS: f64 = 1000.0;

/// Outcome of one decode attempt
pub enum SourceRead {
    /// A decoded frame
    Frame(PixelBuffer),
    /// Nothing available right now (live gap or transient failure);
    /// retry after a short wait
    Again,
    /// Bounded source exhausted
    Eof,
}

/// One camera's decoder. `read` must not block the cooperative loop
/// for longer than a single decode.
pub trait VideoSource: Send {
    fn read(&mut self) -> Result<SourceRead>;

    /// Declared source rate, if the container carries a reliable one
    fn declared_fps(&self) -> Option<f64> {
        None
    }

    /// Whether the source ends (file) or runs forever (live)
    fn bounded(&self) -> bool {
        true
    }
}

/// Opens a camera's stream. Registered once per camera so a session
/// can be restarted with a fresh decoder.
pub trait SourceFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn VideoSource>>;
}

impl<F> SourceFactory for F
where
    F: Fn() -> Result<Box<dyn VideoSource>> + Send + Sync,
{
    fn open(&self) -> Result<Box<dyn VideoSource>> {
        self()
    }
}

/// Decode loop for one camera. Returns when a bounded source reports
/// end-of-stream; this return is the session's shutdown trigger.
pub async fn run_frame_source(
    bus: TopicBus,
    camera_id: String,
    mut source: Box<dyn VideoSource>,
    idle_ms: u64,
) -> Result<()> {
    let topic = topic_name(&camera_id);
    let declared_fps = source
        .declared_fps()
        .filter(|fps| *fps > 0.0 && *fps < MAX_PLAUSIBLE_FPS);
    let started = tokio::time::Instant::now();
    let mut frame_idx: u64 = 0;
    let mut idle = Duration::from_millis(idle_ms.max(1));

    loop {
        match source.read()? {
            SourceRead::Frame(pixels) => {
                idle = Duration::from_millis(idle_ms.max(1));
                let pts_in_video = match declared_fps {
                    Some(fps) => frame_idx as f64 / fps,
                    None => started.elapsed().as_secs_f64(),
                };
                let frame = Frame {
                    camera_id: camera_id.clone(),
                    wall_clock_ts: chrono::Utc::now(),
                    pixels: Arc::new(pixels),
                    frame_idx,
                    pts_in_video,
                };
                bus.publish(&topic, BusMessage::Frame(frame));
                frame_idx += 1;
                // Yield so peers on the cooperative loop make progress
                tokio::task::yield_now().await;
            }
            SourceRead::Again => {
                tokio::time::sleep(idle).await;
                idle = (idle * 2).min(Duration::from_millis(MAX_IDLE_WAIT_MS));
            }
            SourceRead::Eof => break,
        }
    }

    tracing::info!(
        camera_id = %camera_id,
        frames = frame_idx,
        "frame source finished"
    );
    Ok(())
}

fn topic_name(camera_id: &str) -> String {
    crate::bus::topic_for(topics::FRAMES_RAW, camera_id)
}

/// Scripted source for tests and the demo runner: plays back a fixed
/// sequence of reads over synthetic pixels.
pub struct ScriptedSource {
    reads: VecDeque<SourceRead>,
    fps: Option<f64>,
    bounded: bool,
}

impl ScriptedSource {
    /// Bounded source producing `frame_count` blank frames at a
    /// declared rate
    pub fn file(fps: f64, frame_count: usize) -> Self {
        let reads = (0..frame_count)
            .map(|_| SourceRead::Frame(PixelBuffer::blank(8, 8)))
            .collect();
        Self {
            reads,
            fps: Some(fps),
            bounded: true,
        }
    }

    /// Fully scripted read sequence, for exercising retry paths
    pub fn with_reads(reads: Vec<SourceRead>, fps: Option<f64>, bounded: bool) -> Self {
        Self {
            reads: reads.into(),
            fps,
            bounded,
        }
    }
}

impl VideoSource for ScriptedSource {
    fn read(&mut self) -> Result<SourceRead> {
        match self.reads.pop_front() {
            Some(read) => Ok(read),
            None if self.bounded => Ok(SourceRead::Eof),
            None => Ok(SourceRead::Again),
        }
    }

    fn declared_fps(&self) -> Option<f64> {
        self.fps
    }

    fn bounded(&self) -> bool {
        self.bounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::DeliveryMode;

    #[tokio::test]
    async fn test_bounded_source_publishes_all_frames_then_ends() {
        let bus = TopicBus::new();
        let mut sub = bus.subscribe("frames_raw:cam-1", DeliveryMode::Fifo, 16);
        let source = Box::new(ScriptedSource::file(10.0, 5));
        run_frame_source(bus, "cam-1".into(), source, 1)
            .await
            .unwrap();

        for idx in 0..5u64 {
            let frame = sub.recv().await.into_frame().unwrap();
            assert_eq!(frame.frame_idx, idx);
            assert!((frame.pts_in_video - idx as f64 / 10.0).abs() < 1e-9);
        }
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_live_source_retries_through_gaps() {
        let bus = TopicBus::new();
        let mut sub = bus.subscribe("frames_raw:cam-1", DeliveryMode::Fifo, 16);
        let reads = vec![
            SourceRead::Frame(PixelBuffer::blank(8, 8)),
            SourceRead::Again,
            SourceRead::Again,
            SourceRead::Frame(PixelBuffer::blank(8, 8)),
            SourceRead::Eof,
        ];
        // Bounded so the scripted Eof terminates the loop
        let source = Box::new(ScriptedSource::with_reads(reads, Some(10.0), true));
        run_frame_source(bus, "cam-1".into(), source, 1)
            .await
            .unwrap();

        assert_eq!(sub.recv().await.into_frame().unwrap().frame_idx, 0);
        assert_eq!(sub.recv().await.into_frame().unwrap().frame_idx, 1);
    }

    #[tokio::test]
    async fn test_unreliable_declared_fps_falls_back_to_elapsed_time() {
        let bus = TopicBus::new();
        let mut sub = bus.subscribe("frames_raw:cam-1", DeliveryMode::Fifo, 16);
        let source = Box::new(ScriptedSource::with_reads(
            vec![SourceRead::Frame(PixelBuffer::blank(8, 8)), SourceRead::Eof],
            Some(90000.0),
            true,
        ));
        run_frame_source(bus, "cam-1".into(), source, 1)
            .await
            .unwrap();
        let frame = sub.recv().await.into_frame().unwrap();
        // Monotonic-elapsed pts, not idx / 90000
        assert!(frame.pts_in_video >= 0.0);
        assert!(frame.pts_in_video < 1.0);
    }
}
