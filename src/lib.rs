//! TrafficWatch Pipeline Library
//!
//! Multi-camera video incident detection pipeline
//!
//! ## Architecture (8 Components)
//!
//! 1. TopicBus - Partitioned in-process pub/sub
//! 2. FrameSource - Per-camera decode task
//! 3. EqualTimeSampler - Fixed-grid frame re-timing
//! 4. BatchScheduler - Fair cross-camera batch scoring
//! 5. FrameScorer - External classifier contract
//! 6. IncidentAggregator - Detection debounce state machine
//! 7. SessionOrchestrator - Camera lifecycle control
//! 8. PipelineRuntime - Dedicated single-thread executor
//!
//! ## Design Principles
//!
//! - Topics carry a camera partition suffix so streams never interfere
//! - Backpressure by dropping oldest, never by blocking a publisher
//! - All video-time decisions use `pts_in_video`, never wall clock

pub mod aggregator;
pub mod bus;
pub mod config;
pub mod error;
pub mod frame_source;
pub mod model;
pub mod runtime;
pub mod sampler;
pub mod scheduler;
pub mod scoring;
pub mod session;

pub use error::{Error, Result};
