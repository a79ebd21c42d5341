// Process shutdown: wait for SIGINT/SIGTERM, then bring the relay down in
// order. The orchestrator gets a bounded grace period to notice the token and
// stop its own encoder; the encoder is stopped again afterwards regardless,
// so a wedged loop can never leave an ffmpeg child behind.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::encoder::Encoder;

pub async fn signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("ctrl-c handler unavailable: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("SIGTERM handler unavailable: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}

/// Cancel `token`, give the orchestrator up to `grace` to finish, then make
/// sure no encoder process survives.
pub async fn drain(token: &CancellationToken, orchestrator: JoinHandle<()>, encoder: &dyn Encoder, grace: Duration) {
    token.cancel();

    match tokio::time::timeout(grace, orchestrator).await {
        Ok(Ok(())) => info!("orchestrator finished"),
        Ok(Err(e)) => error!("orchestrator task failed: {e}"),
        Err(_) => warn!("orchestrator did not finish within {grace:?}; forcing encoder stop"),
    }

    encoder.stop().await;
    info!("shutdown complete");
}
