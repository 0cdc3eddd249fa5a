// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `forklift status` command - Query a running worker.

use std::path::Path;

pub async fn execute(root: &Path, with_stats: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(root)?;
    let base = config.server_url();
    let client = reqwest::Client::new();

    let status = match client.get(format!("{}/status", base)).send().await {
        Ok(resp) => resp.text().await?,
        Err(e) => {
            eprintln!("✗ Worker at {} is not reachable: {}", base, e);
            std::process::exit(1);
        }
    };
    println!("✓ Worker at {}: {}", base, status.trim());

    if with_stats {
        let stats: serde_json::Value = client
            .get(format!("{}/stats", base))
            .send()
            .await?
            .json()
            .await?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    Ok(())
}
