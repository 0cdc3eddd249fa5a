// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CLI command modules.

use std::path::{Path, PathBuf};

pub mod down;
pub mod init;
pub mod status;
pub mod up;
pub mod validate;

/// Failures of the worker lifecycle commands.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("worker already running or crashed: remove {path} if no worker is alive")]
    AlreadyRunning { path: PathBuf },

    #[error("no worker running: {path} does not exist")]
    NotRunning { path: PathBuf },

    #[error("invalid pid file {path}: {content:?}")]
    BadPidFile { path: PathBuf, content: String },

    #[error("worker did not {what} within {secs}s")]
    Timeout { what: &'static str, secs: u64 },

    #[error("worker stopped after a fatal error: {reason}")]
    Fatal { reason: String },
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join("config.json")
}

pub fn load_config(root: &Path) -> Result<forklift_core::WorkerConfig, Box<dyn std::error::Error>> {
    Ok(forklift_core::ConfigLoader::load_file(config_path(root))?)
}
