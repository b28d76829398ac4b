// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Plain-text Prometheus endpoint.

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Start the metrics server in a background task.
pub fn start_metrics_server(port: u16, lifetime: CancellationToken) {
    tokio::spawn(async move {
        let addr = format!("0.0.0.0:{}", port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("Failed to bind metrics server: {}", e);
                return;
            }
        };
        tracing::info!("Metrics server starting on {}", addr);

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = lifetime.cancelled() => break,
            };
            if let Ok((mut socket, _)) = accepted {
                tokio::spawn(async move {
                    let body = stasis_core::metrics::gather();
                    let response = format!(
                        "HTTP/1.0 200 OK\r\nConnection: close\r\nContent-Length: {}\r\nContent-Type: text/plain; version=0.0.4\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.flush().await;
                });
            }
        }
        tracing::debug!("Metrics server stopped");
    });
}
