// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! In-process sandbox backend.
//!
//! Behaves like the sock backend as far as callers can tell (ref counts,
//! fork, memory charging, child-exit chains) but runs no processes. Requests
//! are answered by a pluggable responder. Used by the test suites and handy
//! for exercising the scheduler on machines without cgroup v2.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use http::{Request, Response};

use super::{
    next_sandbox_id, EventListener, ForkTarget, ListenerSet, SafeSandbox, Sandbox, SandboxClient,
    SandboxHandle, SandboxMeta, SandboxPool, Transport,
};
use crate::config::LimitsConfig;
use crate::error::{CgroupError, ForkliftResult, SandboxError};
use crate::mem_pool::MemPool;
use crate::types::{RuntimeKind, SandboxId};

/// What a responder knows about the sandbox answering the request.
#[derive(Debug, Clone)]
pub struct MockContext {
    pub sandbox_id: SandboxId,
    pub code_dir: Option<PathBuf>,
    pub scratch_dir: PathBuf,
    pub meta: SandboxMeta,
}

pub type MockResponder = Arc<dyn Fn(&MockContext, &Request<Bytes>) -> Response<Bytes> + Send + Sync>;

/// Echo the request body with 200.
pub fn echo_responder() -> MockResponder {
    Arc::new(|_: &MockContext, req: &Request<Bytes>| {
        Response::new(req.body().clone())
    })
}

struct MockShared {
    responder: parking_lot::RwLock<MockResponder>,
    delay: parking_lot::RwLock<Duration>,
    fail_forks: AtomicUsize,
    fail_pauses: AtomicUsize,
    fail_requests: AtomicUsize,
    created: AtomicU64,
    forks: AtomicU64,
    alive: AtomicUsize,
}

/// Pool of mock sandboxes charged against a real [`MemPool`].
pub struct MockPool {
    mem: Arc<MemPool>,
    limits: LimitsConfig,
    listeners: ListenerSet,
    shared: Arc<MockShared>,
    handles: DashMap<SandboxId, Weak<SafeSandbox>>,
}

impl MockPool {
    pub fn new(total_mb: u64) -> Self {
        Self {
            mem: Arc::new(MemPool::new("mock", total_mb, false)),
            limits: LimitsConfig {
                procs: 10,
                mem_mb: 50,
                cpu_percent: 100,
                max_runtime_default: 30,
                swappiness: 0,
                installer_mem_mb: 250,
            },
            listeners: ListenerSet::default(),
            shared: Arc::new(MockShared {
                responder: parking_lot::RwLock::new(echo_responder()),
                delay: parking_lot::RwLock::new(Duration::ZERO),
                fail_forks: AtomicUsize::new(0),
                fail_pauses: AtomicUsize::new(0),
                fail_requests: AtomicUsize::new(0),
                created: AtomicU64::new(0),
                forks: AtomicU64::new(0),
                alive: AtomicUsize::new(0),
            }),
            handles: DashMap::new(),
        }
    }

    pub fn with_limits(mut self, limits: LimitsConfig) -> Self {
        self.limits = limits;
        self
    }

    pub fn mem(&self) -> &Arc<MemPool> {
        &self.mem
    }

    pub fn set_responder(&self, responder: MockResponder) {
        *self.shared.responder.write() = responder;
    }

    /// Make every request take at least `delay`.
    pub fn set_exec_delay(&self, delay: Duration) {
        *self.shared.delay.write() = delay;
    }

    /// The next `n` forks fail with [`SandboxError::ForkFailed`].
    pub fn fail_next_forks(&self, n: usize) {
        self.shared.fail_forks.store(n, Ordering::SeqCst);
    }

    /// The next `n` requests fail like a crashed runtime, after the delay.
    pub fn fail_next_requests(&self, n: usize) {
        self.shared.fail_requests.store(n, Ordering::SeqCst);
    }

    /// The next `n` pauses fail like a stuck freezer.
    pub fn fail_next_pauses(&self, n: usize) {
        self.shared.fail_pauses.store(n, Ordering::SeqCst);
    }

    /// Sandboxes whose resources have not been released yet.
    pub fn live_count(&self) -> usize {
        self.shared.alive.load(Ordering::SeqCst)
    }

    pub fn created_count(&self) -> u64 {
        self.shared.created.load(Ordering::SeqCst)
    }

    pub fn fork_count(&self) -> u64 {
        self.shared.forks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxPool for MockPool {
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

        let meta = meta.unwrap_or_default().with_defaults(&self.limits);
        self.mem.require_mb(meta.mem_mb).await?;

        let id = next_sandbox_id();
        let ctx = MockContext {
            sandbox_id: id,
            code_dir: code_dir.map(Path::to_path_buf),
            scratch_dir: scratch_dir.to_path_buf(),
            meta: meta.clone(),
        };
        let client = SandboxClient::from_transport(
            Arc::new(MockTransport {
                ctx,
                shared: self.shared.clone(),
            }),
            Duration::from_secs(self.limits.max_runtime_default),
        );

        self.shared.alive.fetch_add(1, Ordering::SeqCst);
        let mut sb = MockSandbox {
            id,
            runtime,
            is_leaf,
            meta,
            scratch_dir: scratch_dir.to_path_buf(),
            client,
            parent: None,
            children: HashSet::new(),
            refcount: 1,
            mem: self.mem.clone(),
            shared: self.shared.clone(),
        };

        if let Some(parent) = parent {
            let target = ForkTarget {
                id,
                runtime,
                imports: sb.meta.imports.clone(),
                root_dir: PathBuf::from("/"),
                scratch_dir: scratch_dir.to_path_buf(),
                cgroup_procs: PathBuf::new(),
            };
            if let Err(e) = parent.fork(&target).await {
                sb.destroy("fork from parent failed").await;
                if e.is_fork_failed() {
                    return Err(e);
                }
                return Err(SandboxError::ForkFailed {
                    reason: e.to_string(),
                }
                .into());
            }
            sb.parent = Some(parent);
        }

        self.shared.created.fetch_add(1, Ordering::SeqCst);
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
        let handles: Vec<SandboxHandle> = self
            .handles
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        for sb in handles {
            sb.destroy("pool cleanup").await;
        }
        self.handles.clear();
    }

    async fn debug_string(&self) -> String {
        format!(
            "MOCK POOL: {} live, {} created, {} forks, {} MB free\n",
            self.live_count(),
            self.created_count(),
            self.fork_count(),
            self.mem.available_mb()
        )
    }

    fn mem_pool(&self) -> Option<Arc<MemPool>> {
        Some(self.mem.clone())
    }
}

struct MockSandbox {
    id: SandboxId,
    runtime: RuntimeKind,
    is_leaf: bool,
    meta: SandboxMeta,
    scratch_dir: PathBuf,
    client: SandboxClient,
    parent: Option<SandboxHandle>,
    children: HashSet<SandboxId>,
    refcount: i64,
    mem: Arc<MemPool>,
    shared: Arc<MockShared>,
}

impl MockSandbox {
    async fn dec_refcount(&mut self) {
        self.refcount -= 1;
        if self.refcount < 0 {
            tracing::error!(sandbox_id = %self.id, "Mock sandbox ref count went negative");
            return;
        }
        if self.refcount > 0 {
            return;
        }

        self.mem.release_mb(self.meta.mem_mb);
        self.shared.alive.fetch_sub(1, Ordering::SeqCst);
        if let Some(parent) = self.parent.take() {
            parent.child_exit(self.id).await;
        }
    }
}

fn take_injected(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Sandbox for MockSandbox {
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
        if take_injected(&self.shared.fail_pauses) {
            return Err(CgroupError::FreezeTimeout {
                cgroup: format!("mock-{}", self.id),
                wanted: 1,
                observed: "0".to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn unpause(&mut self) -> ForkliftResult<()> {
        Ok(())
    }

    async fn destroy(&mut self, reason: &str) {
        tracing::debug!(sandbox_id = %self.id, reason = reason, "Mock sandbox destroyed");
        self.dec_refcount().await;
    }

    async fn fork(&mut self, dst: &ForkTarget) -> ForkliftResult<()> {
        if take_injected(&self.shared.fail_forks) {
            return Err(SandboxError::ForkFailed {
                reason: "injected fork failure".to_string(),
            }
            .into());
        }
        self.children.insert(dst.id);
        self.refcount += 1;
        self.shared.forks.fetch_add(1, Ordering::SeqCst);
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
        format!(
            "MOCK {}\nSCRATCH: {}\nREFCOUNT: {}\nCHILDREN: {}\n",
            self.id,
            self.scratch_dir.display(),
            self.refcount,
            self.children.len()
        )
    }
}

struct MockTransport {
    ctx: MockContext,
    shared: Arc<MockShared>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, req: Request<Bytes>) -> ForkliftResult<Response<Bytes>> {
        let delay = *self.shared.delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if take_injected(&self.shared.fail_requests) {
            return Err(SandboxError::Request {
                reason: "injected request failure".to_string(),
            }
            .into());
        }
        let responder = self.shared.responder.read().clone();
        Ok(responder(&self.ctx, &req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refcount_chain_releases_memory_once() {
        let pool = MockPool::new(500);
        let dir = tempfile::TempDir::new().unwrap();

        let root = pool
            .create(None, false, None, dir.path(), None, RuntimeKind::Python)
            .await
            .unwrap();
        let mid = pool
            .create(Some(root.clone()), false, None, dir.path(), None, RuntimeKind::Python)
            .await
            .unwrap();
        let leaf = pool
            .create(
                Some(mid.clone()),
                true,
                Some(dir.path()),
                dir.path(),
                None,
                RuntimeKind::Python,
            )
            .await
            .unwrap();
        assert_eq!(pool.mem().available_mb(), 350);

        root.destroy("test").await;
        mid.destroy("test").await;
        assert_eq!(pool.live_count(), 3);

        leaf.destroy("test").await;
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.mem().available_mb(), 500);
    }

    #[tokio::test]
    async fn test_injected_fork_failure() {
        let pool = MockPool::new(500);
        let dir = tempfile::TempDir::new().unwrap();
        let parent = pool
            .create(None, false, None, dir.path(), None, RuntimeKind::Python)
            .await
            .unwrap();

        pool.fail_next_forks(1);
        let err = pool
            .create(
                Some(parent.clone()),
                true,
                Some(dir.path()),
                dir.path(),
                None,
                RuntimeKind::Python,
            )
            .await
            .unwrap_err();
        assert!(err.is_fork_failed());
        // the failed child gave its memory back; the parent died with the fork
        assert!(parent.is_dead().await);
        assert_eq!(pool.mem().available_mb(), 500);
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test]
    async fn test_responder_and_cleanup() {
        let pool = MockPool::new(500);
        pool.set_responder(Arc::new(|ctx: &MockContext, _req: &Request<Bytes>| {
            Response::new(Bytes::from(format!("sandbox {}", ctx.sandbox_id)))
        }));
        let dir = tempfile::TempDir::new().unwrap();
        let sb = pool
            .create(None, true, Some(dir.path()), dir.path(), None, RuntimeKind::Python)
            .await
            .unwrap();

        let resp = sb.client().post("/run/x", "{}").await.unwrap();
        assert_eq!(resp.body().as_ref(), format!("sandbox {}", sb.id()).as_bytes());

        pool.cleanup().await;
        assert!(sb.is_dead().await);
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test]
    async fn test_leaf_requires_code_dir() {
        let pool = MockPool::new(500);
        let dir = tempfile::TempDir::new().unwrap();
        let err = pool
            .create(None, true, None, dir.path(), None, RuntimeKind::Python)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::ForkliftError::Sandbox(SandboxError::LeafWithoutCode)
        ));
        assert_eq!(pool.mem().available_mb(), 500);
    }
}
