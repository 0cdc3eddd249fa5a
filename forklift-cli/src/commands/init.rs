// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `forklift init` command - Create a worker root.

use std::path::Path;

use forklift_core::WorkerConfig;

pub async fn execute(root: &Path, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let path = super::config_path(root);
    if path.exists() && !force {
        println!("✓ {} already exists (use --force to overwrite)", path.display());
        return Ok(());
    }

    let config = WorkerConfig::defaults_for(root)?;
    std::fs::create_dir_all(&config.worker_dir)?;
    std::fs::create_dir_all(&config.registry)?;
    config.save(&path)?;

    tracing::info!(config = %path.display(), "Worker root initialized");
    println!("✓ Wrote {}", path.display());
    println!("  Registry:  {}", config.registry);
    println!("  Memory:    {} MB", config.mem_pool_mb);
    println!();
    println!("Start the worker with:");
    println!("  forklift --path {} up", root.display());
    Ok(())
}
