// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `stasisd validate` command - Validate configuration file.

use stasis_core::ConfigLoader;

pub async fn execute(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Daemon Settings:");
            println!(
                "  Host ID:            {}",
                config.daemon.host_id.as_deref().unwrap_or("(machine id)")
            );
            println!("  State Directory:    {}", config.daemon.state_dir.display());
            println!("  Checkpoint Dir:     {}", config.checkpoint.dir.display());
            println!("  Job Log Directory:  {}", config.jobs.log_dir.display());
            println!(
                "  Sync / Retry:       {}s / {}s",
                config.jobs.sync_interval.as_secs(),
                config.jobs.retry_interval.as_secs()
            );
            println!();
            println!("GPU Settings:");
            match &config.gpu.controller_binary {
                Some(binary) => {
                    println!("  Controller Binary:  {}", binary.display());
                    println!("  Pool Size:          {}", config.gpu.pool_size);
                    println!("  Shared Memory:      {}", config.gpu.shm_size);
                    println!("  Freeze Type:        {}", config.gpu.freeze_type);
                    println!(
                        "  Parallel Dump/Rst:  {} / {}",
                        config.gpu.parallel_dump, config.gpu.parallel_restore
                    );
                }
                None => println!("  Disabled (no controller binary)"),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
