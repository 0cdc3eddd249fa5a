// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Forklift Core Library
//!
//! Worker core for the Forklift serverless platform. Provides cgroup and
//! memory accounting, process and container sandboxes, package
//! installation, the Zygote import cache and the per-function scheduler
//! that ties them together.

pub mod cgroups;
pub mod config;
pub mod error;
pub mod lambda;
pub mod mem_pool;
pub mod packages;
pub mod sandbox;
pub mod stats;
pub mod storage;
pub mod types;
pub mod zygote;

// Re-export commonly used types
pub use config::{ConfigFormat, ConfigLoader, WorkerConfig};
pub use error::{
    ForkliftError, ForkliftResult, HardValidationError, PullError, SandboxError, ZygoteError,
};
pub use lambda::{LambdaFunc, LambdaManager};
pub use sandbox::{EventType, SandboxHandle, SandboxMeta, SandboxPool};
pub use stats::WorkerStats;
pub use types::{FunctionName, RuntimeKind, SandboxId};
