// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Custom error types for Forklift.
//!
//! Every subsystem gets its own enum; the worker-level [`ForkliftError`]
//! folds them together so callers can match on the failure that matters
//! (fork failures, dead sandboxes, missing handlers) and propagate the rest.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

use crate::types::SandboxId;

/// Top-level error type for the Forklift worker.
#[derive(Debug, Error)]
pub enum ForkliftError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Sandbox Errors
    // =========================================================================
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Cgroup error: {0}")]
    Cgroup(#[from] CgroupError),

    // =========================================================================
    // Code and Package Errors
    // =========================================================================
    #[error("Pull error: {0}")]
    Pull(#[from] PullError),

    #[error("Install error: {0}")]
    Install(#[from] InstallError),

    // =========================================================================
    // Zygote Errors
    // =========================================================================
    #[error("Import cache error: {0}")]
    Zygote(#[from] ZygoteError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("System call failed: {syscall} - {message}")]
    Syscall {
        syscall: &'static str,
        message: String,
    },
}

impl ForkliftError {
    /// Shorthand for wrapping an [`std::io::Error`] with a static context.
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        ForkliftError::Io { context, source }
    }

    /// True when a parent sandbox could not produce a child.
    pub fn is_fork_failed(&self) -> bool {
        matches!(self, ForkliftError::Sandbox(SandboxError::ForkFailed { .. }))
    }

    /// True when the error came from a sandbox that was already torn down.
    pub fn is_dead_sandbox(&self) -> bool {
        matches!(self, ForkliftError::Sandbox(SandboxError::Dead { .. }))
    }
}

/// Hard validation errors cause immediate process termination.
/// Used when configuration is invalid and the worker cannot safely start.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Memory pool too small: {pool_mb} MB, need at least {required_mb} MB")]
    MemoryPoolTooSmall { pool_mb: u64, required_mb: u64 },

    #[error("Path must be absolute: {field} = {path}")]
    RelativePath { field: &'static str, path: PathBuf },

    #[error("Schema validation failed: {message}")]
    SchemaValidation { message: String },
}

/// Failures from the cgroup v2 hierarchy.
#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("Failed to create cgroup {path}: {reason}")]
    Create { path: PathBuf, reason: String },

    #[error("Failed to write {resource} of cgroup {cgroup}: {reason}")]
    Write {
        cgroup: String,
        resource: &'static str,
        reason: String,
    },

    #[error("Failed to read {resource} of cgroup {cgroup}: {reason}")]
    Read {
        cgroup: String,
        resource: &'static str,
        reason: String,
    },

    #[error("Memory limit of cgroup {cgroup} is {actual_mb} MB, expected {expected_mb} MB")]
    LimitMismatch {
        cgroup: String,
        expected_mb: u64,
        actual_mb: u64,
    },

    #[error("cgroup {cgroup} stuck with cgroup.freeze = {observed}, wanted {wanted}")]
    FreezeTimeout {
        cgroup: String,
        wanted: u8,
        observed: String,
    },

    #[error("cgroup {cgroup} still has processes after release: {pids:?}")]
    StillPopulated { cgroup: String, pids: Vec<u32> },

    #[error("Failed to remove cgroup {path}: {reason}")]
    Remove { path: PathBuf, reason: String },

    #[error("cgroup pool {pool} is shut down")]
    PoolClosed { pool: String },
}

/// Sandbox lifecycle errors.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The parent Zygote could not produce a child; callers may retry with a
    /// freshly created parent.
    #[error("fork from parent sandbox failed: {reason}")]
    ForkFailed { reason: String },

    #[error("sandbox {id} is dead: {reason}")]
    Dead { id: SandboxId, reason: String },

    #[error("leaf sandboxes need a code directory")]
    LeafWithoutCode,

    #[error("socket path length cannot exceed 108 characters (was {len}): {path}")]
    SocketPathTooLong { path: PathBuf, len: usize },

    #[error("{backend} sandboxes do not support {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("failed to build root filesystem at {step}: {reason}")]
    RootFs { step: &'static str, reason: String },

    #[error("failed to launch sandbox runtime: {reason}")]
    Launch { reason: String },

    #[error("sandbox runtime not ready after {waited_ms} ms: {path}")]
    NotReady { path: PathBuf, waited_ms: u64 },

    #[error("request to sandbox failed: {reason}")]
    Request { reason: String },

    #[error("request to sandbox timed out after {secs} s")]
    Timeout { secs: u64 },

    #[error("requested {requested_mb} MB exceeds memory pool {pool} of {total_mb} MB")]
    MemoryRequestTooLarge {
        pool: String,
        requested_mb: u64,
        total_mb: u64,
    },

    #[error("docker error: {reason}")]
    Docker { reason: String },
}

/// Handler registry errors.
#[derive(Debug, Error)]
pub enum PullError {
    #[error("invalid function name: {name}")]
    InvalidName { name: String },

    #[error("function {name} not found in registry (tried {tried:?})")]
    NotFound { name: String, tried: Vec<String> },

    #[error("GET {url} returned {status}")]
    Http { url: String, status: u16 },

    #[error("GET {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("{dir} contains neither f.py nor f.bin")]
    UnknownRuntime { dir: PathBuf },

    #[error("failed to unpack {source_path}: {reason}")]
    Extract { source_path: String, reason: String },
}

/// Package installation errors.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("installer sandbox for {pkg} failed: {reason}")]
    Sandbox { pkg: String, reason: String },

    #[error("installing {pkg} returned {status}: {body}")]
    Status {
        pkg: String,
        status: u16,
        body: String,
    },

    #[error("installer returned malformed metadata for {pkg}: {reason}")]
    BadMeta { pkg: String, reason: String },
}

/// Import cache tree errors.
#[derive(Debug, Error)]
pub enum ZygoteError {
    #[error("root of the import cache tree must not declare packages (found {packages:?})")]
    RootHasPackages { packages: Vec<String> },

    #[error("could not parse import cache tree: {reason}")]
    TreeParse { reason: String },

    #[error("could not read import cache tree {path}: {reason}")]
    TreeRead { path: PathBuf, reason: String },
}

/// Result type alias using ForkliftError.
pub type ForkliftResult<T> = Result<T, ForkliftError>;

/// Latch for failures the worker cannot keep running after, such as a
/// cgroup that still holds processes once its sandbox is gone. The first
/// reason raised is kept.
#[derive(Debug, Clone)]
pub struct FatalSignal {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for FatalSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl FatalSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn raise(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(reason = %reason, "Fatal worker error");
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Resolves with the reason once the signal is raised.
    pub async fn raised(&self) -> String {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            // the sender lives as long as `self`
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
