// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `forklift down` command - Stop the worker.

use std::path::Path;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use super::CliError;

/// Sandbox teardown can take a while on a loaded worker.
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn execute(root: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(root)?;
    let pid_path = config.pid_path();

    let content = match std::fs::read_to_string(&pid_path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CliError::NotRunning { path: pid_path }.into())
        }
        Err(e) => return Err(e.into()),
    };
    let pid: i32 = content.trim().parse().map_err(|_| CliError::BadPidFile {
        path: pid_path.clone(),
        content: content.clone(),
    })?;

    tracing::info!(pid, "Stopping worker");
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            // the worker died without cleaning up
            tracing::warn!(pid, path = %pid_path.display(), "Worker not alive, removing stale pid file");
            std::fs::remove_file(&pid_path)?;
            println!("✓ Worker was not running");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    let start = Instant::now();
    while pid_path.exists() {
        if start.elapsed() > STOP_TIMEOUT {
            return Err(CliError::Timeout {
                what: "stop",
                secs: STOP_TIMEOUT.as_secs(),
            }
            .into());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    println!("✓ Worker stopped");
    Ok(())
}
