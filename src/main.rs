mod config;
mod encoder;
mod error;
mod fetcher;
mod http;
mod orchestrator;
mod shutdown;
mod state;

use anyhow::Context;
use std::sync::Arc;
use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::encoder::FfmpegSupervisor;
use crate::fetcher::HttpFetcher;
use crate::http::{build_router, AppState};
use crate::orchestrator::Orchestrator;
use crate::state::SharedState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let version = env!("CARGO_PKG_VERSION").to_string();
    let cfg = Config::from_env()?;

    for dir in [&cfg.orchestrator.video_dir, &cfg.encoder.output_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    let addr = cfg.bind;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    let shutdown = CancellationToken::new();
    let relay = SharedState::new(cfg.reject_duplicates);
    let fetcher = Arc::new(HttpFetcher::new(cfg.fetch_timeout)?);
    let supervisor = Arc::new(FfmpegSupervisor::new(cfg.encoder.clone(), shutdown.clone()));

    info!(
        "encoder: {} (segments {}s, window {}, {})",
        cfg.encoder.ffmpeg,
        cfg.encoder.segment_secs,
        cfg.encoder.window,
        if supervisor.multi_variant() {
            format!("{} variants", cfg.encoder.ladder.len())
        } else {
            "single rendition".to_string()
        }
    );

    let orchestrator = Orchestrator::new(
        cfg.orchestrator.clone(),
        relay.clone(),
        fetcher,
        supervisor.clone(),
        shutdown.clone(),
    )
    .spawn();

    let app = build_router(AppState {
        version: version.clone(),
        relay,
        output_dir: cfg.encoder.output_dir.clone(),
        sys: Arc::new(tokio::sync::Mutex::new(System::new_all())),
    });

    info!("Relaycast {version} starting on http://{addr} (viewers: /stream/{})", supervisor.manifest_name());

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown::signal())
        .await;

    shutdown::drain(&shutdown, orchestrator, supervisor.as_ref(), cfg.shutdown_grace).await;
    served?;
    Ok(())
}
