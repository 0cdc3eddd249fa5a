// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `forklift validate` command - Validate configuration file.

use std::path::Path;

use forklift_core::config::ImportCacheMode;
use forklift_core::ConfigLoader;

pub async fn execute(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file.display(), "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Worker Settings:");
            println!("  Worker Directory:  {}", config.worker_dir.display());
            println!("  Server:            {}", config.server_url());
            println!("  Sandbox:           {:?}", config.sandbox);
            println!("  Registry:          {}", config.registry);
            println!("  Memory Pool:       {} MB", config.mem_pool_mb);
            println!();
            println!("Limits:");
            println!(
                "  Per Sandbox:       {} MB, {}% CPU, {} procs",
                config.limits.mem_mb, config.limits.cpu_percent, config.limits.procs
            );
            println!("  Installer:         {} MB", config.limits.installer_mem_mb);
            println!("  Max Runtime:       {}s", config.limits.max_runtime_default);
            println!();
            let cache = match config.features.import_cache {
                ImportCacheMode::Disabled => "disabled",
                ImportCacheMode::Tree => "tree",
                ImportCacheMode::MultiTree => "multitree",
            };
            println!("Import Cache:        {}", cache);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
