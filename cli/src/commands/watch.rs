//! `os-explode watch` command: the long-running controller.

use std::sync::Arc;

use clap::Args;
use explode_core::config::ExplodeConfig;
use explode_core::error::{ExplodeError, Result};
use explode_runtime::{ApiClient, ExplodeContext, ReconcileEngine, EVENT_CHANNEL_CAPACITY};
use tokio::sync::{mpsc, watch};

use crate::args::ControllerArgs;

#[derive(Args, Debug, Default)]
pub struct WatchArgs {
    /// Skip the startup image-read permission probe
    #[arg(long)]
    pub skip_permission_check: bool,
}

pub async fn execute(
    options: ControllerArgs,
    args: WatchArgs,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let config = options.into_config()?;
    run(config, !args.skip_permission_check).await?;
    Ok(())
}

/// Run the controller until a termination signal arrives or the watch ends.
///
/// Storage initialization and the permission probe are fatal; everything
/// after that is logged and retried by the feed or the engine.
pub async fn run(config: ExplodeConfig, check_permissions: bool) -> Result<()> {
    tracing::info!(
        version = explode_runtime::VERSION,
        config = %serde_json::to_string(&config)?,
        "Starting os-explode"
    );

    let api = ApiClient::new(&config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = ExplodeContext::from_config(&config, Arc::new(api.clone()), shutdown_rx.clone());

    ctx.init()?;
    if check_permissions {
        api.check_permissions().await?;
    }

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let feed = {
        let api = api.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { api.watch(tx, shutdown).await })
    };

    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutting down");
        let _ = shutdown_tx.send(true);
    });

    ReconcileEngine::new(&ctx).run(rx, shutdown_rx).await;

    match feed.await {
        Ok(result) => result,
        Err(e) => Err(ExplodeError::Other(format!("Watch task failed: {}", e))),
    }
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not install SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
