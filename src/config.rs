//! Pipeline configuration
//!
//! One config struct per component, all with sensible defaults. The
//! aggregate `PipelineConfig` supports environment overrides for the
//! knobs operators actually tune.

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Equal-time sampler tuning
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Output grid rate, frames per video-second
    pub target_fps: f64,
    /// Jitter tolerance when comparing a frame pts against the grid
    pub epsilon: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            target_fps: 15.0,
            epsilon: 1e-4,
        }
    }
}

/// Batch scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum frames per inference batch
    pub batch_size: usize,
    /// Idle sleep when every camera buffer is empty
    pub poll_ms: u64,
    /// Per-camera backing buffer capacity (drop-oldest)
    pub buffer_capacity: usize,
    /// Capacity of each camera's sampled-frame subscription
    pub forward_capacity: usize,
    /// Confidence at or above which a detection counts as happened
    pub decision_threshold: f64,
    /// Event label stamped on detections when the scorer gives none
    pub label: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            poll_ms: 20,
            buffer_capacity: 128,
            forward_capacity: 64,
            decision_threshold: 0.7,
            label: "accident".to_string(),
        }
    }
}

/// Incident aggregator tuning
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// EMA smoothing coefficient
    pub alpha: f64,
    /// EMA must stay at or below this to allow closing
    pub exit_threshold: f64,
    /// Consecutive happened frames required to open
    pub required_consecutive: u32,
    /// Consecutive negative frames required to close
    pub min_end_neg_frames: u32,
    /// A pts gap above this is treated as occlusion, not evidence
    pub occlusion_grace_sec: f64,
    /// Reopen within this window (video time) merges into the
    /// previous incident instead of opening a new one
    pub merge_gap_sec: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            alpha: 0.25,
            exit_threshold: 0.40,
            required_consecutive: 3,
            min_end_neg_frames: 8,
            occlusion_grace_sec: 1.0,
            merge_gap_sec: 5.0,
        }
    }
}

/// Session lifecycle tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Wait after sampler teardown for in-flight frames to clear
    pub drain_ms: u64,
    /// Bound on how long a flush may run before the aggregator task
    /// is torn down anyway
    pub flush_timeout_ms: u64,
    /// Idle retry wait for a starved live source
    pub source_idle_ms: u64,
    /// Run the flush path on abrupt stop as well. Off by default:
    /// stop discards any open incident.
    pub flush_on_stop: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            drain_ms: 800,
            flush_timeout_ms: 2000,
            source_idle_ms: 10,
            flush_on_stop: false,
        }
    }
}

/// Aggregate pipeline configuration
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub sampler: SamplerConfig,
    pub scheduler: SchedulerConfig,
    pub aggregator: AggregatorConfig,
    pub session: SessionConfig,
}

impl PipelineConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.sampler.target_fps = env_parse("TW_TARGET_FPS", config.sampler.target_fps);
        config.scheduler.batch_size = env_parse("TW_BATCH_SIZE", config.scheduler.batch_size);
        config.scheduler.poll_ms = env_parse("TW_POLL_MS", config.scheduler.poll_ms);
        config.scheduler.decision_threshold =
            env_parse("TW_DECISION_THRESHOLD", config.scheduler.decision_threshold);
        config.aggregator.merge_gap_sec =
            env_parse("TW_MERGE_GAP_SEC", config.aggregator.merge_gap_sec);
        config.session.flush_on_stop = env_parse("TW_FLUSH_ON_STOP", config.session.flush_on_stop);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_decision_parameters() {
        let config = PipelineConfig::default();
        assert_eq!(config.aggregator.required_consecutive, 3);
        assert_eq!(config.aggregator.min_end_neg_frames, 8);
        assert!((config.aggregator.merge_gap_sec - 5.0).abs() < f64::EPSILON);
        assert_eq!(config.scheduler.batch_size, 4);
    }
}
