use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use maskflow::server;
use maskflow::{AnnotationEngine, FfmpegFrameSource, OrchestratorSettings, SimulatorSegmenter};

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MASKFLOW_CONFIG").ok())
        .map(PathBuf::from);
    let settings = OrchestratorSettings::load(config_path.as_deref())?;

    // The simulator keeps the whole service exercisable without an
    // accelerator; a real model plugs in through the Segmenter trait.
    let engine = AnnotationEngine::new(
        settings.clone(),
        Arc::new(FfmpegFrameSource::new()),
        Arc::new(SimulatorSegmenter::new()),
    );
    engine.spawn_maintenance();

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    info!(addr = %settings.bind_addr, "maskflow listening");

    axum::serve(listener, server::router(engine.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("draining jobs and closing sessions");
    let shutdown_engine = engine.clone();
    tokio::task::spawn_blocking(move || shutdown_engine.shutdown())
        .await
        .context("shutdown task failed")?;

    Ok(())
}
