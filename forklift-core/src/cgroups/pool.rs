// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Background-filled queue of ready cgroups.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use super::cgroup::{Cgroup, PoolHandle};
use crate::config::LimitsConfig;
use crate::error::{CgroupError, FatalSignal, ForkliftResult};

/// Number of cgroups kept prepared ahead of demand. The recycle queue has
/// the same capacity, so at most twice this many sit idle.
pub const CGROUP_RESERVE: usize = 16;

const REMOVE_ATTEMPTS: usize = 100;
const REMOVE_INTERVAL: Duration = Duration::from_millis(5);

/// Per-sandbox cgroups under `<cgroup_root>/<name>`.
pub struct CgroupPool {
    handle: Arc<PoolHandle>,
    ready: Mutex<mpsc::Receiver<Cgroup>>,
    quit: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl CgroupPool {
    /// Create the pool's parent group and start filling the ready queue.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        cgroup_root: &Path,
        name: &str,
        limits: &LimitsConfig,
        reuse: bool,
        trace: bool,
    ) -> ForkliftResult<Self> {
        let path = cgroup_root.join(name);
        std::fs::create_dir_all(&path).map_err(|e| CgroupError::Create {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let controllers = "+pids +io +memory +cpu";
        std::fs::write(path.join("cgroup.subtree_control"), controllers).map_err(|e| {
            CgroupError::Write {
                cgroup: name.to_string(),
                resource: "cgroup.subtree_control",
                reason: e.to_string(),
            }
        })?;

        let (recycled_tx, recycled_rx) = mpsc::channel(CGROUP_RESERVE);
        let (ready_tx, ready_rx) = mpsc::channel(CGROUP_RESERVE);
        let (quit_tx, quit_rx) = oneshot::channel();

        let handle = Arc::new(PoolHandle {
            name: name.to_string(),
            path: path.clone(),
            recycled: recycled_tx,
            reuse,
            trace,
            fatal: FatalSignal::new(),
        });

        let task = tokio::spawn(fill_ready_queue(
            handle.clone(),
            limits.procs,
            limits.swappiness,
            recycled_rx,
            ready_tx,
            quit_rx,
        ));

        tracing::info!(pool = %name, path = %path.display(), reuse = reuse, "cgroup pool started");

        Ok(Self {
            handle,
            ready: Mutex::new(ready_rx),
            quit: parking_lot::Mutex::new(Some(quit_tx)),
            task: parking_lot::Mutex::new(Some(task)),
        })
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    /// Raised when a cgroup cannot be released.
    pub fn fatal(&self) -> &FatalSignal {
        &self.handle.fatal
    }

    pub fn group_path(&self) -> &PathBuf {
        &self.handle.path
    }

    /// Take a cgroup and apply the sandbox's memory and CPU limits.
    pub async fn acquire(&self, mem_mb: u64, cpu_percent: u64) -> ForkliftResult<Cgroup> {
        let cg = {
            let mut ready = self.ready.lock().await;
            ready.recv().await
        };
        let mut cg = cg.ok_or_else(|| CgroupError::PoolClosed {
            pool: self.handle.name.clone(),
        })?;

        let limited = cg
            .set_mem_limit_mb(mem_mb)
            .and_then(|()| cg.set_cpu_percent(cpu_percent));
        if let Err(e) = limited {
            if let Err(destroy_err) = cg.destroy().await {
                tracing::warn!(cgroup = %cg.name(), error = %destroy_err, "Could not remove misconfigured cgroup");
            }
            return Err(e);
        }

        if self.handle.trace {
            tracing::debug!(cgroup = %cg.name(), mem_mb = mem_mb, cpu_percent = cpu_percent, "cgroup acquired");
        }
        Ok(cg)
    }

    /// Stop the background task, remove every idle cgroup and the parent group.
    pub async fn destroy(&self) -> ForkliftResult<()> {
        if let Some(quit) = self.quit.lock().take() {
            let _ = quit.send(());
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(pool = %self.handle.name, error = %e, "cgroup pool task panicked");
            }
        }

        {
            let mut ready = self.ready.lock().await;
            ready.close();
            while let Ok(cg) = ready.try_recv() {
                if let Err(e) = cg.destroy().await {
                    tracing::warn!(cgroup = %cg.name(), error = %e, "Could not remove idle cgroup");
                }
            }
        }

        let mut last_err = None;
        for _ in 0..REMOVE_ATTEMPTS {
            match std::fs::remove_dir(&self.handle.path) {
                Ok(()) => {
                    tracing::info!(pool = %self.handle.name, "cgroup pool destroyed");
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => last_err = Some(e),
            }
            tokio::time::sleep(REMOVE_INTERVAL).await;
        }

        Err(CgroupError::Remove {
            path: self.handle.path.clone(),
            reason: last_err.map(|e| e.to_string()).unwrap_or_default(),
        }
        .into())
    }
}

/// Keep the ready queue full, preferring recycled cgroups over new ones.
async fn fill_ready_queue(
    handle: Arc<PoolHandle>,
    procs: u64,
    swappiness: u64,
    mut recycled: mpsc::Receiver<Cgroup>,
    ready: mpsc::Sender<Cgroup>,
    mut quit: oneshot::Receiver<()>,
) {
    let mut next_id: u64 = 1;

    loop {
        let cg = match recycled.try_recv() {
            Ok(cg) => {
                // released sandboxes leave their group frozen
                if let Err(e) = cg.unpause().await {
                    tracing::warn!(cgroup = %cg.name(), error = %e, "Dropping recycled cgroup");
                    if let Err(e) = cg.destroy().await {
                        tracing::warn!(cgroup = %cg.name(), error = %e, "Could not remove recycled cgroup");
                    }
                    continue;
                }
                cg
            }
            Err(_) => {
                let fresh = Cgroup::create(handle.clone(), format!("cg-{}", next_id)).and_then(
                    |cg| {
                        cg.write_int("pids.max", procs as i64)?;
                        cg.write_int("memory.swap.max", swappiness as i64)?;
                        Ok(cg)
                    },
                );
                next_id += 1;
                match fresh {
                    Ok(cg) => cg,
                    Err(e) => {
                        tracing::error!(pool = %handle.name, error = %e, "Could not create cgroup, closing pool");
                        break;
                    }
                }
            }
        };

        tokio::select! {
            permit = ready.reserve() => match permit {
                Ok(permit) => permit.send(cg),
                Err(_) => {
                    let _ = cg.destroy().await;
                    break;
                }
            },
            _ = &mut quit => {
                if let Err(e) = cg.destroy().await {
                    tracing::warn!(cgroup = %cg.name(), error = %e, "Could not remove cgroup");
                }
                break;
            }
        }
    }

    recycled.close();
    while let Ok(cg) = recycled.try_recv() {
        if let Err(e) = cg.destroy().await {
            tracing::warn!(cgroup = %cg.name(), error = %e, "Could not remove recycled cgroup");
        }
    }
    tracing::debug!(pool = %handle.name, "cgroup pool task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn limits() -> LimitsConfig {
        LimitsConfig {
            procs: 10,
            mem_mb: 50,
            cpu_percent: 100,
            max_runtime_default: 30,
            swappiness: 0,
            installer_mem_mb: 250,
        }
    }

    #[tokio::test]
    async fn test_acquire_applies_limits() {
        let root = TempDir::new().unwrap();
        let pool = CgroupPool::new(root.path(), "forklift-test", &limits(), false, false).unwrap();

        let subtree =
            std::fs::read_to_string(root.path().join("forklift-test/cgroup.subtree_control"))
                .unwrap();
        assert_eq!(subtree, "+pids +io +memory +cpu");

        let cg = pool.acquire(64, 50).await.unwrap();
        assert_eq!(cg.mem_limit_mb(), 64);
        assert_eq!(cg.read_int("memory.max").unwrap(), 64 * 1024 * 1024);
        assert_eq!(cg.read_string("cpu.max").unwrap(), "50000 100000");
        assert_eq!(cg.read_int("pids.max").unwrap(), 10);
        assert!(cg.path().starts_with(root.path().join("forklift-test")));
    }

    #[tokio::test]
    async fn test_acquire_distinct_cgroups() {
        let root = TempDir::new().unwrap();
        let pool = CgroupPool::new(root.path(), "p", &limits(), false, false).unwrap();

        let a = pool.acquire(10, 100).await.unwrap();
        let b = pool.acquire(10, 100).await.unwrap();
        assert_ne!(a.name(), b.name());
    }

    #[tokio::test]
    async fn test_freeze_and_thaw() {
        let root = TempDir::new().unwrap();
        let pool = CgroupPool::new(root.path(), "p", &limits(), false, false).unwrap();
        let cg = pool.acquire(10, 100).await.unwrap();

        cg.pause().await.unwrap();
        assert_eq!(cg.read_string("cgroup.freeze").unwrap(), "1");
        cg.unpause().await.unwrap();
        assert_eq!(cg.read_string("cgroup.freeze").unwrap(), "0");
    }

    #[tokio::test]
    async fn test_pids_and_usage() {
        let root = TempDir::new().unwrap();
        let pool = CgroupPool::new(root.path(), "p", &limits(), false, false).unwrap();
        let cg = pool.acquire(10, 100).await.unwrap();

        std::fs::write(cg.procs_path(), "12\n34\n").unwrap();
        assert_eq!(cg.pids().unwrap(), vec![12, 34]);

        std::fs::write(cg.resource_path("memory.current"), "1048577").unwrap();
        assert_eq!(cg.mem_usage_mb().unwrap(), 2);

        std::fs::write(cg.resource_path("memory.events"), "low 0\noom 1\noom_kill 3\n").unwrap();
        assert_eq!(cg.read_keyed("memory.events", "oom_kill").unwrap(), 3);
        assert!(cg.debug_string().contains("OOM_KILL: 3"));
    }

    #[tokio::test]
    async fn test_release_recycles_empty_cgroup() {
        let root = TempDir::new().unwrap();
        let pool = CgroupPool::new(root.path(), "p", &limits(), true, false).unwrap();
        let cg = pool.acquire(10, 100).await.unwrap();
        let path = cg.path().to_path_buf();

        std::fs::write(cg.procs_path(), "").unwrap();
        cg.release().await.unwrap();
        // recycled cgroups keep their directory
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_release_refuses_populated_cgroup() {
        let root = TempDir::new().unwrap();
        let pool = CgroupPool::new(root.path(), "p", &limits(), true, false).unwrap();
        let cg = pool.acquire(10, 100).await.unwrap();

        std::fs::write(cg.procs_path(), "4242\n").unwrap();
        assert!(pool.fatal().reason().is_none());
        let err = cg.release().await.unwrap_err();
        assert!(err.to_string().contains("still has processes"));
        assert!(pool.fatal().reason().unwrap().contains("still has processes"));
    }

    #[tokio::test]
    async fn test_mem_limit_readback_mismatch() {
        let root = TempDir::new().unwrap();
        let pool = CgroupPool::new(root.path(), "p", &limits(), false, false).unwrap();
        let mut cg = pool.acquire(10, 100).await.unwrap();

        // a directory in place of memory.max makes the write fail
        let max = cg.resource_path("memory.max");
        std::fs::remove_file(&max).unwrap();
        std::fs::create_dir(&max).unwrap();
        assert!(cg.set_mem_limit_mb(20).is_err());
        assert_eq!(cg.mem_limit_mb(), 10);
    }
}
