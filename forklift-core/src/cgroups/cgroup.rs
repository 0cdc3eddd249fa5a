// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! A single sandbox cgroup.

use std::fmt::Write as _;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::{CgroupError, FatalSignal, ForkliftResult};

const MB: i64 = 1024 * 1024;

/// How long a freeze/thaw may take to show up in `cgroup.freeze`.
const FREEZE_TIMEOUT: Duration = Duration::from_secs(5);
const FREEZE_POLL: Duration = Duration::from_millis(1);

/// Release and removal retry budget: 100 attempts, 5 ms apart.
const RETRY_ATTEMPTS: usize = 100;
const RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// CPU bandwidth period written to `cpu.max`, in microseconds.
const CPU_PERIOD_US: u64 = 100_000;

/// State a cgroup shares with the pool that created it.
#[derive(Debug)]
pub(super) struct PoolHandle {
    pub name: String,
    pub path: PathBuf,
    pub recycled: mpsc::Sender<Cgroup>,
    pub reuse: bool,
    pub trace: bool,
    pub fatal: FatalSignal,
}

/// One child cgroup of a [`super::CgroupPool`].
#[derive(Debug)]
pub struct Cgroup {
    name: String,
    path: PathBuf,
    mem_limit_mb: u64,
    pool: Arc<PoolHandle>,
}

impl Cgroup {
    /// Create `<pool>/<name>` in the cgroup file system.
    pub(super) fn create(pool: Arc<PoolHandle>, name: String) -> ForkliftResult<Self> {
        let path = pool.path.join(&name);
        std::fs::DirBuilder::new()
            .mode(0o700)
            .create(&path)
            .map_err(|e| CgroupError::Create {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if pool.trace {
            tracing::debug!(cgroup = %name, "cgroup created");
        }

        Ok(Self {
            name,
            path,
            mem_limit_mb: 0,
            pool,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn resource_path(&self, resource: &str) -> PathBuf {
        self.path.join(resource)
    }

    /// `cgroup.procs`; writing a PID here moves the process into the group.
    pub fn procs_path(&self) -> PathBuf {
        self.resource_path("cgroup.procs")
    }

    pub fn write_str(&self, resource: &'static str, value: &str) -> ForkliftResult<()> {
        std::fs::write(self.resource_path(resource), value).map_err(|e| {
            CgroupError::Write {
                cgroup: self.name.clone(),
                resource,
                reason: e.to_string(),
            }
            .into()
        })
    }

    pub fn write_int(&self, resource: &'static str, value: i64) -> ForkliftResult<()> {
        self.write_str(resource, &value.to_string())
    }

    pub fn read_string(&self, resource: &'static str) -> ForkliftResult<String> {
        std::fs::read_to_string(self.resource_path(resource))
            .map(|s| s.trim().to_string())
            .map_err(|e| {
                CgroupError::Read {
                    cgroup: self.name.clone(),
                    resource,
                    reason: e.to_string(),
                }
                .into()
            })
    }

    /// Read a single integer; `max` reads as `i64::MAX`.
    pub fn read_int(&self, resource: &'static str) -> ForkliftResult<i64> {
        let raw = self.read_string(resource)?;
        if raw == "max" {
            return Ok(i64::MAX);
        }
        raw.parse::<i64>().map_err(|e| {
            CgroupError::Read {
                cgroup: self.name.clone(),
                resource,
                reason: format!("{:?} is not an integer: {}", raw, e),
            }
            .into()
        })
    }

    /// Read one `key value` line from a flat-keyed file such as `memory.events`.
    pub fn read_keyed(&self, resource: &'static str, key: &str) -> ForkliftResult<i64> {
        let raw = self.read_string(resource)?;
        for line in raw.lines() {
            let mut parts = line.split_whitespace();
            if parts.next() == Some(key) {
                if let Some(Ok(value)) = parts.next().map(str::parse::<i64>) {
                    return Ok(value);
                }
            }
        }
        Err(CgroupError::Read {
            cgroup: self.name.clone(),
            resource,
            reason: format!("no integer value for key {}", key),
        }
        .into())
    }

    /// Set `memory.max` and verify the kernel accepted it.
    pub fn set_mem_limit_mb(&mut self, mb: u64) -> ForkliftResult<()> {
        if mb == self.mem_limit_mb {
            return Ok(());
        }

        let wanted = mb as i64 * MB;
        self.write_int("memory.max", wanted)?;

        // the kernel rounds to pages, so allow a little slack
        let actual = self.read_int("memory.max")?;
        if (actual - wanted).abs() > MB {
            return Err(CgroupError::LimitMismatch {
                cgroup: self.name.clone(),
                expected_mb: mb,
                actual_mb: (actual / MB) as u64,
            }
            .into());
        }

        if self.pool.trace {
            tracing::debug!(cgroup = %self.name, old_mb = self.mem_limit_mb, new_mb = mb, "memory.max updated");
        }
        self.mem_limit_mb = mb;
        Ok(())
    }

    pub fn mem_limit_mb(&self) -> u64 {
        self.mem_limit_mb
    }

    /// Current memory usage, rounded up to whole MB.
    pub fn mem_usage_mb(&self) -> ForkliftResult<u64> {
        let bytes = self.read_int("memory.current")?.max(0) as u64;
        Ok(bytes.div_ceil(MB as u64))
    }

    /// Limit CPU to `percent` of one core.
    pub fn set_cpu_percent(&self, percent: u64) -> ForkliftResult<()> {
        let quota = percent * CPU_PERIOD_US / 100;
        self.write_str("cpu.max", &format!("{} {}", quota, CPU_PERIOD_US))
    }

    /// PIDs currently in the group.
    pub fn pids(&self) -> ForkliftResult<Vec<u32>> {
        let raw = self.read_string("cgroup.procs")?;
        Ok(raw
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect())
    }

    /// Move a process into this cgroup.
    pub fn add_pid(&self, pid: u32) -> ForkliftResult<()> {
        self.write_str("cgroup.procs", &pid.to_string())
    }

    pub async fn pause(&self) -> ForkliftResult<()> {
        self.set_freeze(1).await
    }

    pub async fn unpause(&self) -> ForkliftResult<()> {
        self.set_freeze(0).await
    }

    async fn set_freeze(&self, state: u8) -> ForkliftResult<()> {
        self.write_int("cgroup.freeze", state as i64)?;

        let wanted = state.to_string();
        let deadline = tokio::time::Instant::now() + FREEZE_TIMEOUT;
        loop {
            let observed = self.read_string("cgroup.freeze")?;
            if observed == wanted {
                if self.pool.trace {
                    tracing::debug!(cgroup = %self.name, freeze = state, "freeze state reached");
                }
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CgroupError::FreezeTimeout {
                    cgroup: self.name.clone(),
                    wanted: state,
                    observed,
                }
                .into());
            }
            tokio::time::sleep(FREEZE_POLL).await;
        }
    }

    /// Kill every process in the group (`cgroup.kill`).
    pub fn kill_all(&self) -> ForkliftResult<()> {
        self.write_int("cgroup.kill", 1)
    }

    /// Hand the cgroup back once its processes are gone.
    ///
    /// With cgroup reuse enabled the group goes back to the pool (if the
    /// recycle queue has room); otherwise it is removed. Any failure raises
    /// the pool's fatal signal.
    pub async fn release(self) -> ForkliftResult<()> {
        let pool = self.pool.clone();
        let result = self.release_or_recycle().await;
        if let Err(e) = &result {
            pool.fatal.raise(format!("releasing cgroup in pool {}: {}", pool.name, e));
        }
        result
    }

    async fn release_or_recycle(self) -> ForkliftResult<()> {
        let mut pids = self.pids()?;
        for _ in 0..RETRY_ATTEMPTS {
            if pids.is_empty() {
                break;
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
            pids = self.pids()?;
        }
        if !pids.is_empty() {
            return Err(CgroupError::StillPopulated {
                cgroup: self.name.clone(),
                pids,
            }
            .into());
        }

        if self.pool.reuse {
            let pool = self.pool.clone();
            match pool.recycled.try_send(self) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(cg))
                | Err(mpsc::error::TrySendError::Closed(cg)) => return cg.destroy().await,
            }
        }

        self.destroy().await
    }

    /// Remove the cgroup directory.
    pub(super) async fn destroy(&self) -> ForkliftResult<()> {
        let mut last_err = None;
        for _ in 0..RETRY_ATTEMPTS {
            match std::fs::remove_dir(&self.path) {
                Ok(()) => {
                    if self.pool.trace {
                        tracing::debug!(cgroup = %self.name, "cgroup removed");
                    }
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => last_err = Some(e),
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }

        Err(CgroupError::Remove {
            path: self.path.clone(),
            reason: last_err.map(|e| e.to_string()).unwrap_or_default(),
        }
        .into())
    }

    pub fn debug_string(&self) -> String {
        let mut s = format!("CGROUP {}\n", self.path.display());
        let _ = writeln!(s, "MEMORY LIMIT: {} MB", self.mem_limit_mb);
        match self.mem_usage_mb() {
            Ok(mb) => {
                let _ = writeln!(s, "MEMORY USED: {} MB", mb);
            }
            Err(e) => {
                let _ = writeln!(s, "MEMORY USED: {}", e);
            }
        }
        for key in ["oom", "oom_kill"] {
            if let Ok(count) = self.read_keyed("memory.events", key) {
                let _ = writeln!(s, "MEMORY EVENT {}: {}", key.to_uppercase(), count);
            }
        }
        s
    }
}
