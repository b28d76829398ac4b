// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `stasisd daemon` command - Run the daemon core until signalled.

use stasis_core::{DaemonConfig, Server};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::metrics;

pub async fn execute(config: DaemonConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        state_dir = %config.daemon.state_dir.display(),
        gpu = config.gpu.controller_binary.is_some(),
        pool_size = config.gpu.pool_size,
        "Starting daemon"
    );

    // Restored process trees are re-parented to us when their restorer exits
    if let Err(e) = stasis_core::process::become_subreaper() {
        tracing::warn!(error = %e, "Failed to become child subreaper");
    }

    let lifetime = CancellationToken::new();
    if let Some(port) = config.daemon.metrics_port {
        metrics::start_metrics_server(port, lifetime.clone());
    }

    let server = Server::new(&config, lifetime.clone()).await?;
    tracing::info!(host = %server.host().id, "Daemon running");

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Received interrupt"),
        _ = terminate.recv() => tracing::info!("Received SIGTERM"),
    }

    server.shutdown().await;
    Ok(())
}
