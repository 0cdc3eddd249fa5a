// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Local sandboxes: chroot + cgroup, forkable from Zygotes.
//!
//! A sock sandbox is charged its full memory limit for as long as it or
//! any descendant forked from it is alive, because children share its
//! pages while only it is charged. Each sandbox therefore keeps a ref
//! count (one for itself, one per child) and tears down its cgroup, root
//! and memory charge only when that count reaches zero.

mod fork;
mod launch;
mod rootfs;

pub(crate) use launch::{write_bootstrap, RUNTIME_LOG, SOCKET_NAME};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::process::Child;

use super::{
    next_sandbox_id, EventListener, ForkTarget, ListenerSet, SafeSandbox, Sandbox, SandboxClient,
    SandboxHandle, SandboxMeta, SandboxPool,
};
use crate::cgroups::{Cgroup, CgroupPool};
use crate::config::WorkerConfig;
use crate::error::{FatalSignal, ForkliftResult, SandboxError};
use crate::mem_pool::MemPool;
use crate::storage::DirMaker;
use crate::types::{RuntimeKind, SandboxId};

/// `sun_path` limit for Unix-domain sockets.
const MAX_SOCKET_PATH: usize = 108;

/// A Zygote with less headroom than this refuses to fork.
const MIN_FORK_SPARE_MB: u64 = 3;

/// Passes over the parent's PIDs while moving a new child's processes.
const MAX_MIGRATION_PASSES: usize = 100;

const CHILD_SOCKET_WAIT: Duration = Duration::from_secs(1);

/// Factory for sock sandboxes.
pub struct SockPool {
    name: String,
    conf: Arc<WorkerConfig>,
    mem: Arc<MemPool>,
    cgroups: CgroupPool,
    root_dirs: DirMaker,
    listeners: ListenerSet,
    handles: DashMap<SandboxId, Weak<SafeSandbox>>,
}

impl SockPool {
    /// Must be called from within a tokio runtime.
    pub fn new(name: &str, conf: Arc<WorkerConfig>, mem: Arc<MemPool>) -> ForkliftResult<Self> {
        let cgroups = CgroupPool::new(
            &conf.cgroup_root,
            name,
            &conf.limits,
            conf.features.reuse_cgroups,
            conf.trace.cgroups,
        )?;
        let root_dirs = DirMaker::new(
            &conf.worker_dir,
            &format!("root-{}", name),
            conf.storage.root.mode,
        )?;

        Ok(Self {
            name: name.to_string(),
            conf,
            mem,
            cgroups,
            root_dirs,
            listeners: ListenerSet::default(),
            handles: DashMap::new(),
        })
    }

    fn live_handles(&self) -> Vec<SandboxHandle> {
        self.handles
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }

    /// Everything after the memory charge and cgroup: a failure here is
    /// cleaned up by destroying the partially built sandbox.
    async fn finish(
        &self,
        sb: &mut SockSandbox,
        parent: Option<&SandboxHandle>,
    ) -> ForkliftResult<()> {
        if sb.runtime == RuntimeKind::Python {
            launch::write_bootstrap(&sb.scratch_dir, &sb.meta, sb.is_leaf)?;
        }

        let base = self.conf.sock_base_path.clone();
        let root = sb.root_dir.clone();
        let code = sb.code_dir.clone();
        let scratch = sb.scratch_dir.clone();
        tokio::task::spawn_blocking(move || rootfs::populate(&base, &root, code.as_deref(), &scratch))
            .await
            .map_err(|e| SandboxError::RootFs {
                step: "populate",
                reason: e.to_string(),
            })??;

        let procs = sb.cgroup()?.procs_path();
        match parent {
            Some(parent) => {
                let target = ForkTarget {
                    id: sb.id,
                    runtime: sb.runtime,
                    imports: sb.meta.imports.clone(),
                    root_dir: sb.root_dir.clone(),
                    scratch_dir: sb.scratch_dir.clone(),
                    cgroup_procs: procs,
                };
                parent.fork(&target).await.map_err(|e| {
                    if e.is_fork_failed() {
                        e
                    } else {
                        SandboxError::ForkFailed {
                            reason: e.to_string(),
                        }
                        .into()
                    }
                })?;
                sb.parent = Some(parent.clone());
            }
            None => {
                if sb.runtime == RuntimeKind::Native {
                    let proxy =
                        launch::start_container_proxy(&launch::container_proxy_path(), &sb.scratch_dir)
                            .await?;
                    sb.proxy = Some(proxy);
                }
                launch::fresh_proc(
                    sb.runtime,
                    &sb.root_dir,
                    &sb.scratch_dir,
                    &procs,
                    self.conf.features.enable_seccomp,
                )
                .await?;
                launch::wait_until_ready(&sb.scratch_dir).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxPool for SockPool {
    async fn create(
        &self,
        parent: Option<SandboxHandle>,
        is_leaf: bool,
        code_dir: Option<&Path>,
        scratch_dir: &Path,
        meta: Option<SandboxMeta>,
        runtime: RuntimeKind,
    ) -> ForkliftResult<SandboxHandle> {
        if is_leaf && code_dir.is_none() {
            return Err(SandboxError::LeafWithoutCode.into());
        }

        let sock_path = scratch_dir.join(launch::SOCKET_NAME);
        let len = sock_path.as_os_str().len();
        if len > MAX_SOCKET_PATH {
            return Err(SandboxError::SocketPathTooLong {
                path: sock_path,
                len,
            }
            .into());
        }

        let meta = meta.unwrap_or_default().with_defaults(&self.conf.limits);
        let id = next_sandbox_id();
        tracing::debug!(
            pool = %self.name,
            sandbox_id = %id,
            parent = ?parent.as_ref().map(|p| p.id()),
            is_leaf = is_leaf,
            meta = %meta,
            "Creating sock sandbox"
        );

        self.mem.require_mb(meta.mem_mb).await?;
        let cg = match self.cgroups.acquire(meta.mem_mb, meta.cpu_percent).await {
            Ok(cg) => cg,
            Err(e) => {
                self.mem.release_mb(meta.mem_mb);
                return Err(e);
            }
        };
        let root_dir = match self.root_dirs.make(&format!("SB-{}", id)) {
            Ok(dir) => dir,
            Err(e) => {
                if let Err(release_err) = release_cgroup(cg, &self.mem).await {
                    tracing::error!(sandbox_id = %id, error = %release_err, "Could not release cgroup, memory stays charged");
                }
                return Err(e);
            }
        };

        let client = SandboxClient::unix(
            sock_path,
            Duration::from_secs(self.conf.limits.max_runtime_default),
        );
        let mut sb = SockSandbox {
            id,
            runtime,
            is_leaf,
            meta,
            root_dir,
            code_dir: code_dir.map(Path::to_path_buf),
            scratch_dir: scratch_dir.to_path_buf(),
            cg: Some(cg),
            client,
            mem: self.mem.clone(),
            downsize_paused_mem: self.conf.features.downsize_paused_mem,
            refcount: 1,
            parent: None,
            children: HashSet::new(),
            proxy: None,
        };

        if let Err(e) = self.finish(&mut sb, parent.as_ref()).await {
            tracing::warn!(sandbox_id = %id, error = %e, "Sandbox setup failed");
            sb.destroy(&format!("error before create completed: {}", e))
                .await;
            return Err(e);
        }

        let safe = SafeSandbox::new(Box::new(sb));
        self.handles.retain(|_, weak| weak.strong_count() > 0);
        self.handles.insert(id, Arc::downgrade(&safe));
        safe.start_notifying_listeners(self.listeners.snapshot())
            .await;
        Ok(safe)
    }

    fn add_listener(&self, listener: EventListener) {
        self.listeners.add(listener);
    }

    async fn cleanup(&self) {
        // leaves first, so Zygotes are not kept alive by their children
        let mut handles = self.live_handles();
        handles.sort_by_key(|sb| !sb.is_leaf());
        for sb in handles {
            sb.destroy("pool cleanup").await;
        }
        self.handles.clear();

        let available = self.mem.available_mb();
        if available != self.mem.total_mb() as i64 {
            tracing::warn!(
                pool = %self.name,
                available_mb = available,
                total_mb = self.mem.total_mb(),
                "Memory still charged after cleanup"
            );
        }

        if let Err(e) = self.cgroups.destroy().await {
            tracing::error!(pool = %self.name, error = %e, "Could not remove cgroup pool");
        }
        if let Err(e) = self.root_dirs.cleanup() {
            tracing::error!(pool = %self.name, error = %e, "Could not remove sandbox roots");
        }
    }

    async fn debug_string(&self) -> String {
        let mut by_kind: HashMap<&'static str, usize> = HashMap::new();
        for sb in self.live_handles() {
            *by_kind
                .entry(if sb.is_leaf() { "leaf" } else { "zygote" })
                .or_default() += 1;
        }
        format!(
            "SOCK POOL {}: {} leaves, {} zygotes, {}/{} MB free\n",
            self.name,
            by_kind.get("leaf").copied().unwrap_or(0),
            by_kind.get("zygote").copied().unwrap_or(0),
            self.mem.available_mb(),
            self.mem.total_mb()
        )
    }

    fn mem_pool(&self) -> Option<Arc<MemPool>> {
        Some(self.mem.clone())
    }

    fn fatal(&self) -> Option<FatalSignal> {
        Some(self.cgroups.fatal().clone())
    }
}

struct SockSandbox {
    id: SandboxId,
    runtime: RuntimeKind,
    is_leaf: bool,
    meta: SandboxMeta,
    root_dir: PathBuf,
    code_dir: Option<PathBuf>,
    scratch_dir: PathBuf,
    /// Taken on final teardown.
    cg: Option<Cgroup>,
    client: SandboxClient,
    mem: Arc<MemPool>,
    downsize_paused_mem: bool,
    /// One for this sandbox, plus one per live child.
    refcount: i64,
    parent: Option<SandboxHandle>,
    children: HashSet<SandboxId>,
    proxy: Option<Child>,
}

impl SockSandbox {
    fn cgroup(&self) -> ForkliftResult<&Cgroup> {
        self.cg.as_ref().ok_or_else(|| {
            SandboxError::Dead {
                id: self.id,
                reason: "cgroup already released".to_string(),
            }
            .into()
        })
    }

    fn cgroup_mut(&mut self) -> ForkliftResult<&mut Cgroup> {
        let id = self.id;
        self.cg.as_mut().ok_or_else(|| {
            SandboxError::Dead {
                id,
                reason: "cgroup already released".to_string(),
            }
            .into()
        })
    }

    async fn dec_refcount(&mut self) {
        self.refcount -= 1;
        tracing::debug!(sandbox_id = %self.id, refcount = self.refcount, "Sandbox ref count decremented");
        if self.refcount < 0 {
            tracing::error!(sandbox_id = %self.id, "Sandbox ref count went negative");
            return;
        }
        if self.refcount > 0 {
            return;
        }

        if let Some(mut proxy) = self.proxy.take() {
            if let Err(e) = proxy.kill().await {
                tracing::warn!(sandbox_id = %self.id, error = %e, "Could not stop container proxy");
            }
        }

        if let Some(cg) = self.cg.take() {
            if let Err(e) = cg.kill_all() {
                tracing::warn!(sandbox_id = %self.id, error = %e, "cgroup.kill failed");
            }
            if let Err(e) = release_cgroup(cg, &self.mem).await {
                tracing::error!(sandbox_id = %self.id, error = %e, "Could not release cgroup, memory stays charged");
            }
        }

        let root = self.root_dir.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || rootfs::teardown(&root)).await {
            tracing::error!(sandbox_id = %self.id, error = %e, "Root teardown task failed");
        }

        if let Some(parent) = self.parent.take() {
            parent.child_exit(self.id).await;
        }
    }

    /// Move every process that appeared in our cgroup since `before` into
    /// the child's cgroup, until a pass finds nothing new.
    async fn migrate_new_pids(&self, before: &HashSet<u32>, cgroup_procs: &Path) -> ForkliftResult<()> {
        for _ in 0..MAX_MIGRATION_PASSES {
            let mut moved = 0;
            for pid in self.cgroup()?.pids()? {
                if before.contains(&pid) {
                    continue;
                }
                match std::fs::write(cgroup_procs, pid.to_string()) {
                    Ok(()) => moved += 1,
                    // already gone
                    Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {}
                    Err(e) => {
                        return Err(SandboxError::ForkFailed {
                            reason: format!("move pid {} to child cgroup: {}", pid, e),
                        }
                        .into())
                    }
                }
            }
            if moved == 0 {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
        Err(SandboxError::ForkFailed {
            reason: "new processes kept appearing in the parent cgroup".to_string(),
        }
        .into())
    }
}

#[async_trait]
impl Sandbox for SockSandbox {
    fn id(&self) -> SandboxId {
        self.id
    }

    fn runtime(&self) -> RuntimeKind {
        self.runtime
    }

    fn meta(&self) -> &SandboxMeta {
        &self.meta
    }

    fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    fn client(&self) -> SandboxClient {
        self.client.clone()
    }

    async fn pause(&mut self) -> ForkliftResult<()> {
        self.cgroup()?.pause().await?;

        if self.downsize_paused_mem {
            let cg = self.cgroup_mut()?;
            let old = cg.mem_limit_mb();
            let new = cg.mem_usage_mb()? + 1;
            if new < old {
                cg.set_mem_limit_mb(new)?;
                self.mem.release_mb(old - new);
            }
        }

        self.client.close_idle_connections();
        Ok(())
    }

    async fn unpause(&mut self) -> ForkliftResult<()> {
        if self.downsize_paused_mem {
            let wanted = self.meta.mem_mb;
            let old = self.cgroup()?.mem_limit_mb();
            if wanted > old {
                self.mem.require_mb(wanted - old).await?;
                if let Err(e) = self.cgroup_mut()?.set_mem_limit_mb(wanted) {
                    self.mem.release_mb(wanted - old);
                    return Err(e);
                }
            }
        }

        self.cgroup()?.unpause().await
    }

    async fn destroy(&mut self, reason: &str) {
        tracing::info!(sandbox_id = %self.id, reason = reason, "Destroying sock sandbox");
        if let Some(cg) = &self.cg {
            if let Err(e) = cg.pause().await {
                tracing::error!(sandbox_id = %self.id, error = %e, "Could not freeze sandbox before destroy");
            }
        }
        self.dec_refcount().await;
    }

    async fn fork(&mut self, dst: &ForkTarget) -> ForkliftResult<()> {
        let cg = self.cgroup()?;
        let spare = cg.mem_limit_mb().saturating_sub(cg.mem_usage_mb()?);
        if spare < MIN_FORK_SPARE_MB {
            return Err(SandboxError::ForkFailed {
                reason: format!(
                    "only {} MB of spare memory in parent (need at least {} MB)",
                    spare, MIN_FORK_SPARE_MB
                ),
            }
            .into());
        }

        self.children.insert(dst.id);
        self.refcount += 1;

        let result = async {
            let before: HashSet<u32> = self.cgroup()?.pids()?.into_iter().collect();
            let pid = fork::request(
                self.scratch_dir.join(launch::SOCKET_NAME),
                dst.root_dir.clone(),
                dst.cgroup_procs.clone(),
                dst.runtime,
                dst.imports.clone(),
                self.client.timeout(),
            )
            .await?;
            tracing::debug!(sandbox_id = %self.id, child = %dst.id, pid = pid, "Zygote forked");
            self.migrate_new_pids(&before, &dst.cgroup_procs).await
        }
        .await;

        if let Err(e) = result {
            // the child never existed as far as ref counting goes
            self.children.remove(&dst.id);
            self.refcount -= 1;
            return Err(e);
        }

        let child_sock = dst.scratch_dir.join(launch::SOCKET_NAME);
        if let Err(e) = launch::wait_for_socket(&child_sock, CHILD_SOCKET_WAIT).await {
            tracing::warn!(sandbox_id = %self.id, child = %dst.id, error = %e, "Forked child has no socket yet");
        }
        Ok(())
    }

    async fn child_exit(&mut self, child: SandboxId) {
        if !self.children.remove(&child) {
            tracing::warn!(sandbox_id = %self.id, child = %child, "Unknown child exited");
            return;
        }
        self.dec_refcount().await;
    }

    fn debug_string(&self) -> String {
        let mut s = format!(
            "SOCK {}\nROOT DIR: {}\nHOST DIR: {}\nREFCOUNT: {}\nCHILDREN: {}\n",
            self.id,
            self.root_dir.display(),
            self.scratch_dir.display(),
            self.refcount,
            self.children.len()
        );
        match &self.cg {
            Some(cg) => s.push_str(&cg.debug_string()),
            None => s.push_str("CGROUP: released\n"),
        }
        s
    }

    fn runtime_log(&self) -> Option<String> {
        std::fs::read_to_string(self.scratch_dir.join(launch::RUNTIME_LOG)).ok()
    }
}

/// Hand back a dead sandbox's cgroup, then its memory charge. A cgroup that
/// could not be released may still hold processes, so its charge stays.
async fn release_cgroup(cg: Cgroup, mem: &MemPool) -> ForkliftResult<()> {
    let limit = cg.mem_limit_mb();
    cg.release().await?;
    mem.release_mb(limit);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;

    fn cgroup_pool(root: &Path) -> CgroupPool {
        let limits = LimitsConfig {
            procs: 10,
            mem_mb: 50,
            cpu_percent: 100,
            max_runtime_default: 30,
            swappiness: 0,
            installer_mem_mb: 250,
        };
        CgroupPool::new(root, "sock-test", &limits, false, false).unwrap()
    }

    #[tokio::test]
    async fn test_release_cgroup_returns_memory() {
        let root = tempfile::TempDir::new().unwrap();
        let cgroups = cgroup_pool(root.path());
        let mem = MemPool::new("sock-test", 100, false);

        mem.require_mb(10).await.unwrap();
        let cg = cgroups.acquire(10, 100).await.unwrap();
        std::fs::write(cg.procs_path(), "").unwrap();

        release_cgroup(cg, &mem).await.unwrap();
        assert_eq!(mem.available_mb(), 100);
        assert!(cgroups.fatal().reason().is_none());
    }

    #[tokio::test]
    async fn test_populated_cgroup_keeps_memory_charged() {
        let root = tempfile::TempDir::new().unwrap();
        let cgroups = cgroup_pool(root.path());
        let mem = MemPool::new("sock-test", 100, false);

        mem.require_mb(10).await.unwrap();
        let cg = cgroups.acquire(10, 100).await.unwrap();
        std::fs::write(cg.procs_path(), "4242\n").unwrap();

        assert!(release_cgroup(cg, &mem).await.is_err());
        assert_eq!(mem.available_mb(), 90);
        assert!(cgroups.fatal().reason().is_some());
    }
}
