// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `forklift up` command - Run the worker.
//!
//! In the foreground the worker serves until SIGINT or SIGTERM and then
//! tears down every sandbox. With `--detach` it re-launches itself in the
//! background and returns once the new process answers `/status`.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use forklift_core::{LambdaManager, WorkerConfig};

use super::CliError;
use crate::{metrics, server};

/// How long a detached worker may take to come up.
const READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Removes the pid file when the worker exits, however it exits.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(path: PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            return Err(CliError::AlreadyRunning { path }.into());
        }
        std::fs::write(&path, std::process::id().to_string())?;
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Could not remove pid file");
        }
    }
}

pub async fn execute(
    root: &Path,
    detach: bool,
    verbose: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(root)?;
    std::fs::create_dir_all(&config.worker_dir)?;

    if detach {
        return launch_detached(root, &config, verbose).await;
    }

    tracing::info!(root = %root.display(), port = config.worker_port, "Starting worker");
    let _pid_file = PidFile::create(config.pid_path())?;

    let port = config.worker_port;
    let manager = Arc::new(LambdaManager::new(Arc::new(config)).await?);
    metrics::init();
    manager.add_sandbox_listener(metrics::sandbox_listener());

    let fatal: Arc<OnceLock<String>> = Arc::new(OnceLock::new());
    let stop = {
        let manager = manager.clone();
        let fatal = fatal.clone();
        async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                reason = manager.fatal() => {
                    tracing::error!(reason = %reason, "Stopping worker after fatal error");
                    let _ = fatal.set(reason);
                }
            }
        }
    };
    let result = server::serve(manager.clone(), port, stop).await;

    tracing::info!("Shutting down worker");
    manager.cleanup().await;
    result?;
    if let Some(reason) = fatal.get() {
        return Err(CliError::Fatal {
            reason: reason.clone(),
        }
        .into());
    }

    println!("Worker stopped.");
    Ok(())
}

async fn shutdown_signal() {
    let mut term =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::error!(error = %e, "Could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
        _ = term.recv() => tracing::info!("Received SIGTERM"),
    }
}

async fn launch_detached(
    root: &Path,
    config: &WorkerConfig,
    verbose: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if config.pid_path().exists() {
        return Err(CliError::AlreadyRunning {
            path: config.pid_path(),
        }
        .into());
    }

    let out_path = config.worker_dir.join("worker.out");
    let out = std::fs::File::create(&out_path)?;
    let mut cmd = Command::new(std::env::current_exe()?);
    cmd.arg("--path").arg(root);
    if verbose {
        cmd.arg("--verbose");
    }
    let child = cmd
        .arg("up")
        .stdin(Stdio::null())
        .stdout(out.try_clone()?)
        .stderr(out)
        .spawn()?;

    println!("▶ Worker starting (PID: {}, output: {})", child.id(), out_path.display());

    let url = format!("{}/status", config.server_url());
    let client = reqwest::Client::new();
    let start = Instant::now();
    while start.elapsed() < READY_TIMEOUT {
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                println!("✓ Worker ready on {}", config.server_url());
                return Ok(());
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    Err(CliError::Timeout {
        what: "become ready",
        secs: READY_TIMEOUT.as_secs(),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_guard() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("worker.pid");

        let guard = PidFile::create(path.clone()).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
        assert!(PidFile::create(path.clone()).is_err());

        drop(guard);
        assert!(!path.exists());
    }
}
