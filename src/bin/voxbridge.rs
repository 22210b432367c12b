//! voxbridge binary.
//!
//! Reads voice events from the gateway sidecar on stdin and writes playback
//! requests to stdout. All diagnostics go to stderr.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use voxbridge::config::BridgeConfig;
use voxbridge::runtime::Supervisor;
use voxbridge::transport::AudioSink;
use voxbridge::transport::stdio::StdioSink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BridgeConfig::load().context("failed to load configuration")?;
    let _log_guard = voxbridge::logging::init(&config.logging)?;

    if let Err(e) = config.validate_required() {
        tracing::error!(error = %e, "cannot start");
        return Err(e.into());
    }

    let supervisor = Supervisor::new(config);
    spawn_signal_watcher(supervisor.cancel_token());

    let sink: Arc<dyn AudioSink> = Arc::new(StdioSink::stdout());
    let exit = supervisor
        .run(tokio::io::stdin(), sink)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "voxbridge exited with error");
            anyhow::anyhow!("voxbridge failed: {e}")
        })?;

    tracing::info!(reason = ?exit, "voxbridge shut down cleanly");
    Ok(())
}

fn spawn_signal_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "SIGTERM handler unavailable");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("shutdown signal received");
        cancel.cancel();
    });
}
