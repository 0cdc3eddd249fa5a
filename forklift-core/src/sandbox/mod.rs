// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Sandboxes and the pools that create them.
//!
//! A backend ([`sock`], [`docker`], [`mock`]) implements [`Sandbox`] for the
//! raw mechanics. Callers never see a raw sandbox: pools wrap each one in a
//! [`SafeSandbox`] that serializes operations, destroys the sandbox on the
//! first error and publishes lifecycle events to listeners.

pub mod client;
pub mod debugger;
pub mod docker;
pub mod evictor;
pub mod mock;
pub mod safe;
pub mod sock;
mod state;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

pub use client::{SandboxClient, Transport};
pub use debugger::Debugger;
pub use evictor::SockEvictor;
pub use safe::SafeSandbox;
pub use state::{SandboxState, SandboxStateMachine};

use crate::config::{LimitsConfig, SandboxBackend, WorkerConfig};
use crate::error::{FatalSignal, ForkliftResult};
use crate::mem_pool::MemPool;
use crate::types::{RuntimeKind, SandboxId};

static NEXT_SANDBOX_ID: AtomicU64 = AtomicU64::new(1);

/// Worker-wide unique sandbox id.
pub(crate) fn next_sandbox_id() -> SandboxId {
    SandboxId::new(NEXT_SANDBOX_ID.fetch_add(1, Ordering::Relaxed))
}

/// What a sandbox should have available when it starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxMeta {
    /// Packages whose `files/` trees go on the import path.
    pub installs: Vec<String>,
    /// Modules imported before serving (Zygotes) or inherited from the parent.
    pub imports: Vec<String>,
    /// Memory limit; 0 means the worker default.
    pub mem_mb: u64,
    /// CPU share in percent of one core; 0 means the worker default.
    pub cpu_percent: u64,
}

impl SandboxMeta {
    /// Replace zero limits with the configured defaults.
    pub fn with_defaults(mut self, limits: &LimitsConfig) -> Self {
        if self.mem_mb == 0 {
            self.mem_mb = limits.mem_mb;
        }
        if self.cpu_percent == 0 {
            self.cpu_percent = limits.cpu_percent;
        }
        self
    }
}

impl fmt::Display for SandboxMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "installs={:?} imports={:?} mem={}MB cpu={}%",
            self.installs, self.imports, self.mem_mb, self.cpu_percent
        )
    }
}

/// Everything a parent needs to fork into a freshly prepared child.
#[derive(Debug, Clone)]
pub struct ForkTarget {
    pub id: SandboxId,
    pub runtime: RuntimeKind,
    pub imports: Vec<String>,
    pub root_dir: PathBuf,
    pub scratch_dir: PathBuf,
    /// `cgroup.procs` of the child's cgroup.
    pub cgroup_procs: PathBuf,
}

/// Lifecycle events published by [`SafeSandbox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Create,
    Destroy,
    DestroyIgnored,
    Pause,
    Unpause,
    Fork,
    ChildExit,
}

impl EventType {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Destroy => "destroy",
            Self::DestroyIgnored => "destroy_ignored",
            Self::Pause => "pause",
            Self::Unpause => "unpause",
            Self::Fork => "fork",
            Self::ChildExit => "child_exit",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The only way callers hold a sandbox.
pub type SandboxHandle = Arc<SafeSandbox>;

/// Called synchronously inside the sandbox's critical section; must not block.
pub type EventListener = Arc<dyn Fn(EventType, &SandboxHandle) + Send + Sync>;

/// Backend mechanics of one sandbox. Not thread-safe on its own; always
/// accessed through a [`SafeSandbox`].
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> SandboxId;

    fn runtime(&self) -> RuntimeKind;

    fn meta(&self) -> &SandboxMeta;

    fn is_leaf(&self) -> bool;

    fn client(&self) -> SandboxClient;

    async fn pause(&mut self) -> ForkliftResult<()>;

    async fn unpause(&mut self) -> ForkliftResult<()>;

    /// Tear down. Never fails; problems are logged.
    async fn destroy(&mut self, reason: &str);

    /// Fork the runtime into the prepared child described by `dst`.
    async fn fork(&mut self, dst: &ForkTarget) -> ForkliftResult<()>;

    /// A forked child has been torn down.
    async fn child_exit(&mut self, child: SandboxId);

    fn debug_string(&self) -> String;

    /// Output the runtime wrote to its log, if the backend keeps one.
    fn runtime_log(&self) -> Option<String> {
        None
    }
}

/// Factory for sandboxes of one backend.
#[async_trait]
pub trait SandboxPool: Send + Sync {
    /// Create a sandbox, forked from `parent` when one is given.
    ///
    /// `code_dir` is required for leaves. `meta` defaults to the worker
    /// limits with nothing installed.
    async fn create(
        &self,
        parent: Option<SandboxHandle>,
        is_leaf: bool,
        code_dir: Option<&Path>,
        scratch_dir: &Path,
        meta: Option<SandboxMeta>,
        runtime: RuntimeKind,
    ) -> ForkliftResult<SandboxHandle>;

    /// Register a handler for events from every sandbox created afterwards.
    fn add_listener(&self, listener: EventListener);

    /// Destroy every live sandbox and release pool resources.
    async fn cleanup(&self);

    async fn debug_string(&self) -> String;

    /// Memory pool the sandboxes are charged against, if any.
    fn mem_pool(&self) -> Option<Arc<MemPool>> {
        None
    }

    /// Raised when the backend hits a failure the worker must not survive.
    fn fatal(&self) -> Option<FatalSignal> {
        None
    }
}

/// Listeners registered on a pool, copied into each new sandbox.
#[derive(Default)]
pub struct ListenerSet {
    listeners: parking_lot::RwLock<Vec<EventListener>>,
}

impl ListenerSet {
    pub fn add(&self, listener: EventListener) {
        self.listeners.write().push(listener);
    }

    pub fn snapshot(&self) -> Vec<EventListener> {
        self.listeners.read().clone()
    }
}

/// Build the pool selected by `conf.sandbox`, with its debugger and (for
/// sock sandboxes) the Zygote evictor attached.
pub async fn pool_from_config(
    conf: Arc<WorkerConfig>,
    name: &str,
) -> ForkliftResult<(Arc<dyn SandboxPool>, Debugger)> {
    let pool: Arc<dyn SandboxPool> = match conf.sandbox {
        SandboxBackend::Sock => {
            let mem = Arc::new(MemPool::new(name, conf.mem_pool_mb, conf.trace.memory));
            let pool = sock::SockPool::new(name, conf.clone(), mem.clone())?;
            let pool: Arc<dyn SandboxPool> = Arc::new(pool);
            SockEvictor::spawn(pool.as_ref(), mem, conf.limits.mem_mb, conf.trace.evictor);
            pool
        }
        SandboxBackend::Docker => Arc::new(docker::DockerPool::new(name, conf.clone())?),
    };

    let debugger = Debugger::attach(pool.as_ref());
    tracing::info!(pool = %name, backend = ?conf.sandbox, "Sandbox pool ready");
    Ok((pool, debugger))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_defaults() {
        let limits = LimitsConfig {
            procs: 10,
            mem_mb: 50,
            cpu_percent: 100,
            max_runtime_default: 30,
            swappiness: 0,
            installer_mem_mb: 250,
        };

        let meta = SandboxMeta::default().with_defaults(&limits);
        assert_eq!(meta.mem_mb, 50);
        assert_eq!(meta.cpu_percent, 100);

        let meta = SandboxMeta {
            mem_mb: 300,
            ..Default::default()
        }
        .with_defaults(&limits);
        assert_eq!(meta.mem_mb, 300);
        assert_eq!(meta.cpu_percent, 100);
    }

    #[test]
    fn test_sandbox_ids_unique() {
        let a = next_sandbox_id();
        let b = next_sandbox_id();
        assert!(b > a);
    }
}
