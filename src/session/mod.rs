//! SessionOrchestrator - Camera Lifecycle Control
//!
//! ## Responsibilities
//!
//! - Register a source factory per camera and start/stop the camera's
//!   task chain (source, sampler, aggregator) plus its scheduler
//!   membership
//! - Orderly shutdown when a bounded source ends: drain in-flight
//!   frames, then flush the aggregator so every incident closes
//! - Manual stop tears the chain down abruptly without a drain pass
//!   (opt-in flush for callers that want closes on stop)
//! - Idempotent start/stop; restart reopens the source fresh
//!
//! The orchestrator lives on the caller's thread; all spawned work
//! runs on the pipeline runtime.

use crate::aggregator::{run_aggregator, IncidentAggregator};
use crate::bus::TopicBus;
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::frame_source::{run_frame_source, SourceFactory};
use crate::runtime::{PipelineRuntime, TaskHandle};
use crate::sampler::run_sampler;
use crate::scheduler::BatchScheduler;
use crate::scoring::FrameScorer;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// Shared pipeline infrastructure: one bus and one scheduler serve
/// every camera session.
pub struct PipelineContext {
    bus: TopicBus,
    scheduler: Arc<BatchScheduler>,
    config: PipelineConfig,
    scheduler_task: TaskHandle,
}

impl PipelineContext {
    pub fn new(
        runtime: &PipelineRuntime,
        scorer: Arc<dyn FrameScorer>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        let bus = TopicBus::new();
        let scheduler = Arc::new(BatchScheduler::new(
            bus.clone(),
            scorer,
            config.scheduler.clone(),
        ));
        let scheduler_task = runtime.spawn(scheduler.clone().run());
        Arc::new(Self {
            bus,
            scheduler,
            config,
            scheduler_task,
        })
    }

    pub fn bus(&self) -> &TopicBus {
        &self.bus
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Stop the shared scheduler loop. Called once, after all camera
    /// sessions are down.
    pub fn stop_scheduler(&self) {
        self.scheduler_task.cancel();
    }
}

/// One running camera: its supervisor task plus a stop signal
struct CameraSession {
    stop_tx: Option<oneshot::Sender<()>>,
    supervisor: TaskHandle,
}

/// Owns the camera registry and drives per-camera session lifecycles
pub struct SessionOrchestrator {
    ctx: Arc<PipelineContext>,
    runtime_handle: tokio::runtime::Handle,
    session_id: String,
    factories: Mutex<HashMap<String, Arc<dyn SourceFactory>>>,
    sessions: Mutex<HashMap<String, CameraSession>>,
}

impl SessionOrchestrator {
    pub fn new(runtime: &PipelineRuntime, ctx: Arc<PipelineContext>) -> Self {
        Self {
            ctx,
            runtime_handle: runtime.handle().clone(),
            session_id: uuid::Uuid::new_v4().simple().to_string(),
            factories: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn lock_factories(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn SourceFactory>>> {
        self.factories.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, CameraSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or replace) the source factory for a camera. Takes
    /// effect on the next start.
    pub fn register(&self, camera_id: &str, factory: Arc<dyn SourceFactory>) {
        self.lock_factories().insert(camera_id.to_string(), factory);
    }

    /// Start a camera session. No-op while the camera is already
    /// running; a finished session is reaped and restarted with a
    /// freshly opened source.
    pub fn start(&self, camera_id: &str) -> Result<()> {
        let factory = self
            .lock_factories()
            .get(camera_id)
            .cloned()
            .ok_or_else(|| Error::Session(format!("camera not registered: {camera_id}")))?;

        let mut sessions = self.lock_sessions();
        if let Some(existing) = sessions.get(camera_id) {
            if !existing.supervisor.is_finished() {
                tracing::debug!(camera_id = %camera_id, "session already running");
                return Ok(());
            }
            sessions.remove(camera_id);
        }

        let source = factory.open()?;
        let (stop_tx, stop_rx) = oneshot::channel();
        let supervisor = self.spawn_supervisor(camera_id, source, stop_rx);
        sessions.insert(
            camera_id.to_string(),
            CameraSession {
                stop_tx: Some(stop_tx),
                supervisor,
            },
        );
        tracing::info!(camera_id = %camera_id, "camera session started");
        Ok(())
    }

    fn spawn_supervisor(
        &self,
        camera_id: &str,
        source: Box<dyn crate::frame_source::VideoSource>,
        stop_rx: oneshot::Receiver<()>,
    ) -> TaskHandle {
        let ctx = self.ctx.clone();
        let handle = self.runtime_handle.clone();
        let camera_id = camera_id.to_string();
        let session_id = self.session_id.clone();

        // Spawned via the runtime handle so source/sampler/aggregator
        // land on the pipeline thread alongside the scheduler.
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let join = handle.clone().spawn(async move {
            supervise_camera(ctx, handle, camera_id, session_id, source, stop_rx).await;
            let _ = done_tx.send(());
        });
        TaskHandle::from_parts(join, done_rx)
    }

    /// Stop a camera session without waiting for end-of-stream. Unless
    /// `flush_on_stop` is set, in-flight detections are discarded and
    /// open incidents stay unterminated (restart continues them as new
    /// incidents).
    pub fn stop(&self, camera_id: &str) -> Result<()> {
        let Some(mut session) = self.lock_sessions().remove(camera_id) else {
            tracing::debug!(camera_id = %camera_id, "stop for idle camera ignored");
            return Ok(());
        };
        if let Some(tx) = session.stop_tx.take() {
            let _ = tx.send(());
        }
        // Margin over the flush timeout so a flushing stop still joins
        let deadline = Duration::from_millis(self.ctx.config.session.flush_timeout_ms + 500);
        session.supervisor.await_done(deadline)?;
        tracing::info!(camera_id = %camera_id, "camera session stopped");
        Ok(())
    }

    /// Start every registered camera; the first failure aborts
    pub fn start_all(&self) -> Result<()> {
        let camera_ids: Vec<String> = self.lock_factories().keys().cloned().collect();
        for camera_id in camera_ids {
            self.start(&camera_id)?;
        }
        Ok(())
    }

    pub fn stop_all(&self) -> Result<()> {
        let camera_ids: Vec<String> = self.lock_sessions().keys().cloned().collect();
        for camera_id in camera_ids {
            self.stop(&camera_id)?;
        }
        Ok(())
    }

    /// Number of sessions whose supervisor is still running
    pub fn active_count(&self) -> usize {
        self.lock_sessions()
            .values()
            .filter(|s| !s.supervisor.is_finished())
            .count()
    }

    /// Block until every session supervisor has finished on its own
    /// (bounded sources reaching end-of-stream), or the deadline
    /// passes.
    pub fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        while self.active_count() > 0 {
            if std::time::Instant::now() >= deadline {
                return Err(Error::Session(
                    "sessions still active past deadline".into(),
                ));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }
}

/// Per-camera supervisor: runs the task chain and owns its teardown.
///
/// Natural end (bounded source Eof) drains and flushes; a stop signal
/// tears down abruptly, flushing first only when configured to.
async fn supervise_camera(
    ctx: Arc<PipelineContext>,
    handle: tokio::runtime::Handle,
    camera_id: String,
    session_id: String,
    source: Box<dyn crate::frame_source::VideoSource>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let cfg = &ctx.config;
    ctx.scheduler.add_camera(&camera_id);

    let mut source_task = handle.spawn(run_frame_source(
        ctx.bus.clone(),
        camera_id.clone(),
        source,
        cfg.session.source_idle_ms,
    ));
    let sampler_task = handle.spawn(run_sampler(
        ctx.bus.clone(),
        camera_id.clone(),
        cfg.sampler.clone(),
    ));
    let (flush_tx, flush_rx) = watch::channel(false);
    let aggregator = IncidentAggregator::new(&camera_id, &session_id, cfg.aggregator.clone());
    let aggregator_task = handle.spawn(run_aggregator(ctx.bus.clone(), aggregator, flush_rx));

    let flush_timeout = Duration::from_millis(cfg.session.flush_timeout_ms);
    tokio::select! {
        result = &mut source_task => {
            match result {
                Ok(Ok(())) => {
                    tracing::info!(camera_id = %camera_id, "source ended, draining");
                }
                Ok(Err(e)) => {
                    tracing::error!(camera_id = %camera_id, error = %e, "source failed, draining");
                }
                Err(e) if e.is_panic() => {
                    tracing::error!(camera_id = %camera_id, error = %e, "source task panicked, draining");
                }
                Err(e) => {
                    tracing::debug!(camera_id = %camera_id, error = %e, "source task cancelled");
                }
            }
            // Sampling stops first; the drain then covers only frames
            // already handed downstream.
            sampler_task.abort();
            reap_subtask(&camera_id, "sampler", sampler_task).await;
            tokio::time::sleep(Duration::from_millis(cfg.session.drain_ms)).await;
            flush_aggregator(&camera_id, &flush_tx, aggregator_task, flush_timeout).await;
        }
        _ = &mut stop_rx => {
            tracing::info!(camera_id = %camera_id, "stop requested");
            if cfg.session.flush_on_stop {
                flush_aggregator(&camera_id, &flush_tx, aggregator_task, flush_timeout).await;
            } else {
                aggregator_task.abort();
                reap_subtask(&camera_id, "aggregator", aggregator_task).await;
            }
            source_task.abort();
            reap_subtask(&camera_id, "source", source_task).await;
            sampler_task.abort();
            reap_subtask(&camera_id, "sampler", sampler_task).await;
        }
    }

    ctx.scheduler.remove_camera(&camera_id);
    tracing::info!(camera_id = %camera_id, "camera session finished");
}

/// Join a finished or aborted subtask so a panic is surfaced with
/// camera context instead of vanishing with the handle.
async fn reap_subtask<T>(camera_id: &str, task: &str, handle: tokio::task::JoinHandle<T>) {
    match handle.await {
        Ok(_) => {}
        Err(e) if e.is_cancelled() => {
            tracing::debug!(camera_id = %camera_id, task = task, "subtask cancelled");
        }
        Err(e) => {
            tracing::error!(camera_id = %camera_id, task = task, error = %e, "subtask panicked");
        }
    }
}

/// Signal the aggregator to flush and wait for it to exit, bounding
/// the wait. A panicked aggregator means the flush was lost; that is
/// logged, never mistaken for a clean flush.
async fn flush_aggregator(
    camera_id: &str,
    flush_tx: &watch::Sender<bool>,
    mut task: tokio::task::JoinHandle<()>,
    flush_timeout: Duration,
) {
    let _ = flush_tx.send(true);
    match tokio::time::timeout(flush_timeout, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_panic() => {
            tracing::error!(
                camera_id = %camera_id,
                error = %e,
                "aggregator panicked, flush lost"
            );
        }
        Ok(Err(e)) => {
            tracing::debug!(camera_id = %camera_id, error = %e, "aggregator cancelled before flush");
        }
        Err(_) => {
            tracing::warn!(camera_id = %camera_id, "aggregator flush timed out");
            task.abort();
            reap_subtask(camera_id, "aggregator", task).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::DeliveryMode;
    use crate::config::{AggregatorConfig, SchedulerConfig, SessionConfig};
    use crate::frame_source::ScriptedSource;
    use crate::scoring::StubScorer;

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            scheduler: SchedulerConfig {
                poll_ms: 2,
                ..SchedulerConfig::default()
            },
            aggregator: AggregatorConfig {
                merge_gap_sec: 0.2,
                ..AggregatorConfig::default()
            },
            session: SessionConfig {
                drain_ms: 100,
                flush_timeout_ms: 1000,
                source_idle_ms: 1,
                flush_on_stop: false,
            },
            ..PipelineConfig::default()
        }
    }

    fn file_factory(fps: f64, frames: usize) -> Arc<dyn SourceFactory> {
        Arc::new(move || {
            Ok(Box::new(ScriptedSource::file(fps, frames)) as Box<dyn crate::frame_source::VideoSource>)
        })
    }

    #[test]
    fn test_start_requires_registration() {
        let runtime = PipelineRuntime::new().unwrap();
        let scorer = Arc::new(StubScorer::new("accident"));
        let ctx = PipelineContext::new(&runtime, scorer, fast_config());
        let orch = SessionOrchestrator::new(&runtime, ctx);
        assert!(orch.start("cam-1").is_err());
    }

    #[test]
    fn test_bounded_source_runs_to_completion_and_flushes_open_incident() {
        let runtime = PipelineRuntime::new().unwrap();
        // Every frame scores as a confident positive, so an incident
        // opens and can only terminate through the end-of-stream flush.
        let scorer = Arc::new(StubScorer::new("accident").with_default_confidence(0.9));
        let ctx = PipelineContext::new(&runtime, scorer, fast_config());
        let mut close_sub =
            ctx.bus()
                .subscribe("incident.close:cam-1", DeliveryMode::Fifo, 8);
        let orch = SessionOrchestrator::new(&runtime, ctx.clone());

        orch.register("cam-1", file_factory(30.0, 20));
        orch.start("cam-1").unwrap();
        orch.wait_idle(Duration::from_secs(5)).unwrap();

        let close = close_sub.try_recv().and_then(|m| m.into_incident());
        let close = close.unwrap_or_else(|| panic!("expected a flush close event"));
        assert!(!close.is_open());
        assert_eq!(close.camera_id(), "cam-1");
        assert_eq!(ctx.scheduler.camera_count(), 0);
    }

    #[test]
    fn test_start_is_idempotent_while_running() {
        let runtime = PipelineRuntime::new().unwrap();
        let scorer = Arc::new(StubScorer::new("accident"));
        let ctx = PipelineContext::new(&runtime, scorer, fast_config());
        let orch = SessionOrchestrator::new(&runtime, ctx);

        // A live (unbounded) source keeps the session running
        orch.register(
            "cam-1",
            Arc::new(|| {
                Ok(Box::new(ScriptedSource::with_reads(Vec::new(), None, false))
                    as Box<dyn crate::frame_source::VideoSource>)
            }),
        );
        orch.start("cam-1").unwrap();
        orch.start("cam-1").unwrap();
        assert_eq!(orch.active_count(), 1);
        orch.stop("cam-1").unwrap();
        assert_eq!(orch.active_count(), 0);
    }

    #[test]
    fn test_stop_idle_camera_is_noop() {
        let runtime = PipelineRuntime::new().unwrap();
        let scorer = Arc::new(StubScorer::new("accident"));
        let ctx = PipelineContext::new(&runtime, scorer, fast_config());
        let orch = SessionOrchestrator::new(&runtime, ctx);
        orch.stop("cam-missing").unwrap();
    }

    struct PanickingSource;

    impl crate::frame_source::VideoSource for PanickingSource {
        fn read(&mut self) -> crate::error::Result<crate::frame_source::SourceRead> {
            panic!("decoder crashed");
        }
    }

    #[test]
    fn test_source_panic_is_contained_and_other_cameras_survive() {
        let runtime = PipelineRuntime::new().unwrap();
        let scorer = Arc::new(StubScorer::new("accident").with_default_confidence(0.9));
        let ctx = PipelineContext::new(&runtime, scorer, fast_config());
        let mut bad_sub = ctx
            .bus()
            .subscribe("incident.close:cam-bad", DeliveryMode::Fifo, 8);
        let mut ok_sub = ctx
            .bus()
            .subscribe("incident.close:cam-ok", DeliveryMode::Fifo, 8);
        let orch = SessionOrchestrator::new(&runtime, ctx.clone());

        orch.register(
            "cam-bad",
            Arc::new(|| {
                Ok(Box::new(PanickingSource) as Box<dyn crate::frame_source::VideoSource>)
            }),
        );
        orch.register("cam-ok", file_factory(30.0, 20));
        orch.start_all().unwrap();

        // Both supervisors must finish: the panicking source ends its
        // session through the normal teardown path
        orch.wait_idle(Duration::from_secs(5)).unwrap();
        assert_eq!(ctx.scheduler.camera_count(), 0);

        // The healthy camera still opened and flush-closed an incident
        let close = ok_sub.try_recv().and_then(|m| m.into_incident());
        assert!(close.is_some_and(|e| !e.is_open()));
        // The crashed camera produced no frames, so no events
        assert!(bad_sub.try_recv().is_none());
    }

    #[test]
    fn test_restart_after_completion_opens_source_fresh() {
        let runtime = PipelineRuntime::new().unwrap();
        let scorer = Arc::new(StubScorer::new("accident"));
        let ctx = PipelineContext::new(&runtime, scorer, fast_config());
        let orch = SessionOrchestrator::new(&runtime, ctx);

        orch.register("cam-1", file_factory(30.0, 3));
        orch.start("cam-1").unwrap();
        orch.wait_idle(Duration::from_secs(5)).unwrap();
        // Finished session is reaped and the factory reopens
        orch.start("cam-1").unwrap();
        assert_eq!(orch.active_count(), 1);
        orch.wait_idle(Duration::from_secs(5)).unwrap();
    }
}
