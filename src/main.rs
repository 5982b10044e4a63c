//! TrafficWatch - Multi-Camera Incident Detection Pipeline
//!
//! Demo entry point: runs the full pipeline over scripted sources and
//! a scripted scorer, logging incident events as they are published.

use std::sync::Arc;
use std::time::Duration;
use trafficwatch::{
    bus::{topic_for, topics, DeliveryMode},
    config::PipelineConfig,
    frame_source::{ScriptedSource, SourceFactory, VideoSource},
    runtime::PipelineRuntime,
    scoring::StubScorer,
    session::{PipelineContext, SessionOrchestrator},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEMO_CAMERAS: [&str; 2] = ["cam-north", "cam-south"];

fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trafficwatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting TrafficWatch v{}", env!("CARGO_PKG_VERSION"));

    let config = PipelineConfig::from_env();
    tracing::info!(
        target_fps = config.sampler.target_fps,
        batch_size = config.scheduler.batch_size,
        decision_threshold = config.scheduler.decision_threshold,
        "Configuration loaded"
    );

    // One incident on cam-north; cam-south stays quiet throughout
    let scorer = Arc::new(
        StubScorer::new(&config.scheduler.label)
            .with_default_confidence(0.05)
            .schedule("cam-north", [0.9, 0.92, 0.95, 0.9, 0.88]),
    );

    let runtime = PipelineRuntime::new()?;
    let ctx = PipelineContext::new(&runtime, scorer, config);
    let orchestrator = SessionOrchestrator::new(&runtime, ctx.clone());

    // Incident event logger, subscribed before any camera starts
    let incident_topics: Vec<String> = DEMO_CAMERAS
        .iter()
        .flat_map(|cam| {
            [
                topic_for(topics::INCIDENT_OPEN, cam),
                topic_for(topics::INCIDENT_CLOSE, cam),
            ]
        })
        .collect();
    let mut incident_sub = ctx.bus().subscribe_many(&incident_topics, DeliveryMode::Fifo, 64);
    let logger_task = runtime.spawn(async move {
        loop {
            let Some(event) = incident_sub.recv().await.into_incident() else {
                continue;
            };
            match serde_json::to_string(&event) {
                Ok(json) => tracing::info!(event = %json, "incident event"),
                Err(e) => tracing::error!(error = %e, "incident event serialization failed"),
            }
        }
    });

    for camera_id in DEMO_CAMERAS {
        orchestrator.register(camera_id, file_source(30.0, 60));
        tracing::info!(camera_id = %camera_id, "camera registered");
    }
    orchestrator.start_all()?;
    tracing::info!(active = orchestrator.active_count(), "all sessions started");

    // Bounded sources: wait for every session to drain and flush
    orchestrator.wait_idle(Duration::from_secs(30))?;
    tracing::info!("all sessions finished");

    // Let the logger print any tail events before teardown
    std::thread::sleep(Duration::from_millis(100));
    logger_task.cancel();
    ctx.stop_scheduler();

    Ok(())
}

/// Factory for a scripted bounded source, reopened fresh per start
fn file_source(fps: f64, frames: usize) -> Arc<dyn SourceFactory> {
    Arc::new(move || Ok(Box::new(ScriptedSource::file(fps, frames)) as Box<dyn VideoSource>))
}
