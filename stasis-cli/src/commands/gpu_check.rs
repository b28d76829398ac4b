// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `stasisd gpu-check` command - One-shot GPU controller health check.

use stasis_core::{DaemonConfig, Server};
use tokio_util::sync::CancellationToken;

pub async fn execute(mut config: DaemonConfig) -> Result<(), Box<dyn std::error::Error>> {
    // No warm pool for a one-shot check
    config.gpu.pool_size = 0;

    let server = Server::new(&config, CancellationToken::new()).await?;
    let result = server.gpu_health().await;
    server.shutdown().await;

    match result {
        Ok(report) => {
            println!("✓ GPU controller healthy");
            println!("  Driver:  {}", report.driver_version);
            println!("  Devices: {}", report.devices.len());
            for device in &report.devices {
                println!("    - {}", device);
            }
            for message in &report.messages {
                println!("  {}", message);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ GPU health check failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
