// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Static tree of Zygotes.
//!
//! Topology is fixed at construction and read without locks. Each node
//! guards its own runtime state (the Zygote it currently holds, how many
//! callers are using it, its lazily built code directory) with a mutex.
//! Locks are only ever taken from a node towards the root, never the
//! other way, so nested reservations cannot deadlock.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use tokio::sync::Mutex;

use super::{NodeStats, TreeSpec, ZygoteProvider};
use crate::error::{ForkliftError, ForkliftResult, ZygoteError};
use crate::packages::PackagePuller;
use crate::sandbox::{SandboxHandle, SandboxMeta, SandboxPool};
use crate::storage::DirMaker;
use crate::types::RuntimeKind;

/// Nodes warmed up at the same time.
const WARMUP_CONCURRENCY: usize = 6;

type NodeId = usize;

#[derive(Default)]
struct NodeState {
    sb: Option<SandboxHandle>,
    /// Callers currently holding `sb`; it is unpaused iff this is > 0.
    refcount: usize,
    code_dir: Option<PathBuf>,
    meta: Option<SandboxMeta>,
}

struct ZygoteNode {
    packages: Vec<String>,
    /// Union of every ancestor's packages.
    indirect: Vec<String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    depth: usize,
    state: Mutex<NodeState>,
    hits: AtomicU64,
    leaf_children: AtomicU64,
    nonleaf_children: AtomicU64,
}

impl ZygoteNode {
    fn all_packages(&self) -> Vec<String> {
        let mut all = self.indirect.clone();
        all.extend(self.packages.iter().cloned());
        all
    }

    fn label(&self) -> String {
        let mut s = if self.packages.is_empty() {
            "ROOT".to_string()
        } else {
            self.packages.join(",")
        };
        if !self.indirect.is_empty() {
            let _ = write!(s, " [indirect: {}]", self.indirect.join(","));
        }
        s
    }
}

/// One import cache tree.
pub struct ImportCache {
    nodes: Vec<ZygoteNode>,
    pool: Arc<dyn SandboxPool>,
    puller: Arc<PackagePuller>,
    code_dirs: Arc<DirMaker>,
    scratch_dirs: Arc<DirMaker>,
}

impl ImportCache {
    pub fn new(
        spec: &TreeSpec,
        pool: Arc<dyn SandboxPool>,
        puller: Arc<PackagePuller>,
        code_dirs: Arc<DirMaker>,
        scratch_dirs: Arc<DirMaker>,
    ) -> ForkliftResult<Self> {
        if !spec.packages.is_empty() {
            return Err(ZygoteError::RootHasPackages {
                packages: spec.packages.clone(),
            }
            .into());
        }

        let mut nodes = Vec::new();
        Self::flatten(spec, None, Vec::new(), 0, &mut nodes)?;
        Ok(Self {
            nodes,
            pool,
            puller,
            code_dirs,
            scratch_dirs,
        })
    }

    /// Append `spec` and its descendants in pre-order; returns the new node's id.
    fn flatten(
        spec: &TreeSpec,
        parent: Option<NodeId>,
        indirect: Vec<String>,
        depth: usize,
        nodes: &mut Vec<ZygoteNode>,
    ) -> ForkliftResult<NodeId> {
        let packages: Vec<String> = spec
            .packages
            .iter()
            .map(|p| crate::packages::normalize_pkg(p))
            .collect();
        if parent.is_some() && packages.iter().all(|p| indirect.contains(p)) {
            return Err(ZygoteError::TreeParse {
                reason: format!(
                    "node {:?} adds no packages to its ancestors {:?}",
                    packages, indirect
                ),
            }
            .into());
        }

        let id = nodes.len();
        nodes.push(ZygoteNode {
            packages,
            indirect,
            parent,
            children: Vec::new(),
            depth,
            state: Mutex::new(NodeState::default()),
            hits: AtomicU64::new(0),
            leaf_children: AtomicU64::new(0),
            nonleaf_children: AtomicU64::new(0),
        });

        let child_indirect = nodes[id].all_packages();
        for child in &spec.children {
            let child_id = Self::flatten(child, Some(id), child_indirect.clone(), depth + 1, nodes)?;
            nodes[id].children.push(child_id);
        }
        Ok(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Deepest node whose packages (own and inherited) are all in `required`.
    fn lookup(&self, required: &[String]) -> NodeId {
        let mut node = 0;
        'descend: loop {
            for &child in &self.nodes[node].children {
                if self.nodes[child]
                    .packages
                    .iter()
                    .all(|p| required.contains(p))
                {
                    node = child;
                    continue 'descend;
                }
            }
            return node;
        }
    }

    /// Fork a new sandbox from the Zygote at `node`, replacing a stale
    /// Zygote once if the fork fails.
    async fn create_child_from_node(
        &self,
        child_pool: &dyn SandboxPool,
        node: NodeId,
        is_leaf: bool,
        code_dir: Option<&Path>,
        scratch_dir: &Path,
        meta: &SandboxMeta,
        runtime: RuntimeKind,
    ) -> ForkliftResult<SandboxHandle> {
        let mut force_new = false;
        loop {
            let (zygote, is_new) = self.get_sandbox_in_node(node, force_new).await?;
            let result = child_pool
                .create(
                    Some(zygote.clone()),
                    is_leaf,
                    code_dir,
                    scratch_dir,
                    Some(meta.clone()),
                    runtime,
                )
                .await;

            if result.is_ok() {
                let counter = if is_leaf {
                    &self.nodes[node].leaf_children
                } else {
                    &self.nodes[node].nonleaf_children
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
            self.put_sandbox_in_node(node, &zygote).await;

            match result {
                // a fresh Zygote is never retried, so this loops at most twice
                Err(e) if e.is_fork_failed() && !is_new => {
                    tracing::warn!(
                        zygote = %self.nodes[node].label(),
                        error = %e,
                        "Fork from cached Zygote failed, recreating it"
                    );
                    force_new = true;
                }
                other => return other,
            }
        }
    }

    /// Reserve the node's Zygote, creating the chain of Zygotes from the
    /// root down when needed. The returned sandbox is unpaused; release it
    /// with [`ImportCache::put_sandbox_in_node`].
    fn get_sandbox_in_node(
        &self,
        node: NodeId,
        force_new: bool,
    ) -> BoxFuture<'_, ForkliftResult<(SandboxHandle, bool)>> {
        Box::pin(async move {
            let n = &self.nodes[node];
            let mut state = n.state.lock().await;
            n.hits.fetch_add(1, Ordering::Relaxed);

            if force_new {
                if let Some(old) = state.sb.take() {
                    state.refcount = 0;
                    tokio::spawn(async move { old.destroy("replaced by a new Zygote").await });
                }
            }

            if let Some(sb) = state.sb.clone() {
                if state.refcount > 0 {
                    state.refcount += 1;
                    return Ok((sb, false));
                }
                match sb.unpause().await {
                    Ok(()) => {
                        state.refcount = 1;
                        return Ok((sb, false));
                    }
                    Err(e) => {
                        tracing::debug!(zygote = %n.label(), error = %e, "Cached Zygote unusable");
                        state.sb = None;
                    }
                }
            }

            let sb = self.create_sandbox_in_node(node, &mut state).await?;
            state.sb = Some(sb.clone());
            state.refcount = 1;
            Ok((sb, true))
        })
    }

    /// Drop one reservation; the last one pauses the Zygote.
    async fn put_sandbox_in_node(&self, node: NodeId, sb: &SandboxHandle) {
        let mut state = self.nodes[node].state.lock().await;
        match &state.sb {
            Some(current) if Arc::ptr_eq(current, sb) => {}
            // replaced while we held it; the old one is already being destroyed
            _ => return,
        }

        state.refcount = state.refcount.saturating_sub(1);
        if state.refcount == 0 {
            if let Err(e) = sb.pause().await {
                tracing::debug!(sandbox_id = %sb.id(), error = %e, "Zygote pause failed, dropping it");
                state.sb = None;
            }
        }
    }

    async fn create_sandbox_in_node(
        &self,
        node: NodeId,
        state: &mut NodeState,
    ) -> ForkliftResult<SandboxHandle> {
        let n = &self.nodes[node];
        let (code_dir, meta) = match (&state.code_dir, &state.meta) {
            (Some(dir), Some(meta)) => (dir.clone(), meta.clone()),
            _ => {
                let (dir, meta) = self.build_node_code(n).await?;
                state.code_dir = Some(dir.clone());
                state.meta = Some(meta.clone());
                (dir, meta)
            }
        };

        let scratch_dir = self.scratch_dirs.make("import-cache")?;
        let sb = match n.parent {
            Some(parent) => {
                self.create_child_from_node(
                    self.pool.as_ref(),
                    parent,
                    false,
                    Some(&code_dir),
                    &scratch_dir,
                    &meta,
                    RuntimeKind::Python,
                )
                .await?
            }
            None => {
                self.pool
                    .create(
                        None,
                        false,
                        Some(&code_dir),
                        &scratch_dir,
                        Some(meta),
                        RuntimeKind::Python,
                    )
                    .await?
            }
        };

        tracing::info!(zygote = %n.label(), sandbox_id = %sb.id(), "Zygote created");
        Ok(sb)
    }

    /// Install the node's packages, link them into a fresh code directory
    /// and decide what the Zygote pre-imports.
    async fn build_node_code(&self, n: &ZygoteNode) -> ForkliftResult<(PathBuf, SandboxMeta)> {
        let installs = self.puller.install_recursive(&n.all_packages()).await?;

        let code_dir = self.code_dirs.make("import-cache")?;
        let links = code_dir.join("packages");
        std::fs::create_dir(&links).map_err(|e| ForkliftError::io("creating package links", e))?;
        for pkg in &installs {
            let target = self.puller.pkgs_dir().join(pkg).join("files");
            std::os::unix::fs::symlink(&target, links.join(pkg))
                .map_err(|e| ForkliftError::io("linking package", e))?;
        }

        let mut imports = Vec::new();
        for pkg in &n.packages {
            if let Some(meta) = self.puller.installed_meta(pkg) {
                imports.extend(meta.top_level);
            }
        }

        Ok((
            code_dir,
            SandboxMeta {
                installs,
                imports,
                ..Default::default()
            },
        ))
    }

    fn dump_node(&self, node: NodeId, out: &mut String) {
        let n = &self.nodes[node];
        let creates = n.leaf_children.load(Ordering::Relaxed)
            + n.nonleaf_children.load(Ordering::Relaxed);
        let _ = writeln!(
            out,
            "{:>4} {}{} (hits={})",
            creates,
            "  ".repeat(n.depth),
            n.label(),
            n.hits.load(Ordering::Relaxed)
        );
        for &child in &n.children {
            self.dump_node(child, out);
        }
    }

    /// Nodes without children; the Zygotes warmup creates.
    fn bottom_nodes(&self) -> Vec<NodeId> {
        (0..self.nodes.len())
            .filter(|&id| self.nodes[id].children.is_empty())
            .collect()
    }

    async fn warmup_node(&self, node: NodeId) -> ForkliftResult<()> {
        let (sb, _) = self.get_sandbox_in_node(node, false).await?;
        self.put_sandbox_in_node(node, &sb).await;
        Ok(())
    }
}

#[async_trait]
impl ZygoteProvider for ImportCache {
    async fn create(
        &self,
        child_pool: &dyn SandboxPool,
        is_leaf: bool,
        code_dir: Option<&Path>,
        scratch_dir: &Path,
        meta: SandboxMeta,
        runtime: RuntimeKind,
    ) -> ForkliftResult<SandboxHandle> {
        let node = self.lookup(&meta.installs);
        tracing::debug!(zygote = %self.nodes[node].label(), "Using Zygote");
        self.create_child_from_node(
            child_pool,
            node,
            is_leaf,
            code_dir,
            scratch_dir,
            &meta,
            runtime,
        )
        .await
    }

    async fn warmup(&self) -> ForkliftResult<()> {
        let results: Vec<ForkliftResult<()>> = stream::iter(self.bottom_nodes())
            .map(|node| self.warmup_node(node))
            .buffer_unordered(WARMUP_CONCURRENCY)
            .collect()
            .await;
        results.into_iter().collect()
    }

    async fn cleanup(&self) {
        tracing::info!(tree = %self.dump(), "Import cache at shutdown");
        // pre-order ids: walking backwards reaches every child before its parent
        for node in self.nodes.iter().rev() {
            let mut state = node.state.lock().await;
            if let Some(sb) = state.sb.take() {
                sb.destroy("import cache cleanup").await;
            }
            state.refcount = 0;
        }
    }

    fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_node(0, &mut out);
        out
    }

    fn stats(&self) -> Vec<NodeStats> {
        self.nodes
            .iter()
            .map(|n| NodeStats {
                packages: n.all_packages(),
                hits: n.hits.load(Ordering::Relaxed),
                leaf_children: n.leaf_children.load(Ordering::Relaxed),
                nonleaf_children: n.nonleaf_children.load(Ordering::Relaxed),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigFormat, ConfigLoader, WorkerConfig};
    use crate::sandbox::mock::{MockContext, MockPool};
    use crate::storage::StoreMode;
    use bytes::Bytes;
    use http::{Request, Response};

    struct Fixture {
        _dir: tempfile::TempDir,
        pool: Arc<MockPool>,
        cache: ImportCache,
    }

    fn fixture(tree: &str) -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let json = serde_json::json!({
            "worker_dir": dir.path().join("worker"),
            "sock_base_path": dir.path().join("base"),
            "mem_pool_mb": 2048,
        });
        let conf: WorkerConfig =
            ConfigLoader::load_string(&json.to_string(), ConfigFormat::Json).unwrap();

        let pool = Arc::new(MockPool::new(2048));
        pool.set_responder(Arc::new(|_: &MockContext, req: &Request<Bytes>| {
            let event: serde_json::Value = serde_json::from_slice(req.body()).unwrap();
            let pkg = event["pkg"].as_str().unwrap_or_default().to_string();
            Response::new(Bytes::from(
                serde_json::json!({"Deps": [], "TopLevel": [pkg]}).to_string(),
            ))
        }));
        let puller = Arc::new(PackagePuller::new(pool.clone(), None, &conf).unwrap());
        let code_dirs =
            Arc::new(DirMaker::new(&conf.worker_dir, "code", StoreMode::Regular).unwrap());
        let scratch_dirs =
            Arc::new(DirMaker::new(&conf.worker_dir, "scratch", StoreMode::Regular).unwrap());
        let spec = TreeSpec::parse(tree).unwrap();
        let cache = ImportCache::new(&spec, pool.clone(), puller, code_dirs, scratch_dirs).unwrap();

        Fixture {
            _dir: dir,
            pool,
            cache,
        }
    }

    const TREE: &str = r#"{"packages": [], "children": [
        {"packages": ["numpy"], "children": [
            {"packages": ["pandas"], "children": []}
        ]},
        {"packages": ["requests"], "children": []}
    ]}"#;

    fn pkgs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_lookup_picks_deepest_match() {
        let f = fixture(TREE);
        assert_eq!(f.cache.node_count(), 4);

        let label = |id: NodeId| f.cache.nodes[id].label();
        assert_eq!(label(f.cache.lookup(&[])), "ROOT");
        assert_eq!(label(f.cache.lookup(&pkgs(&["numpy"]))), "numpy");
        assert_eq!(
            label(f.cache.lookup(&pkgs(&["pandas", "numpy", "six"]))),
            "pandas [indirect: numpy]"
        );
        // pandas alone is not enough: its node inherits numpy
        assert_eq!(label(f.cache.lookup(&pkgs(&["pandas"]))), "ROOT");
        assert_eq!(label(f.cache.lookup(&pkgs(&["requests"]))), "requests");
    }

    #[test]
    fn test_rejects_bad_trees() {
        let spec = TreeSpec::parse(r#"{"packages": ["numpy"], "children": []}"#).unwrap();
        let f = fixture(TREE);
        let err = ImportCache::new(
            &spec,
            f.pool.clone(),
            f.cache.puller.clone(),
            f.cache.code_dirs.clone(),
            f.cache.scratch_dirs.clone(),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            ForkliftError::Zygote(ZygoteError::RootHasPackages { .. })
        ));

        let spec = TreeSpec::parse(
            r#"{"packages": [], "children": [{"packages": ["a"], "children": [{"packages": ["a"]}]}]}"#,
        )
        .unwrap();
        assert!(ImportCache::new(
            &spec,
            f.pool.clone(),
            f.cache.puller.clone(),
            f.cache.code_dirs.clone(),
            f.cache.scratch_dirs.clone(),
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_create_builds_chain_and_pauses_zygotes() {
        let f = fixture(TREE);
        let scratch = tempfile::TempDir::new().unwrap();
        let meta = SandboxMeta {
            installs: pkgs(&["numpy", "pandas"]),
            ..Default::default()
        };

        let leaf = f
            .cache
            .create(
                f.pool.as_ref(),
                true,
                Some(scratch.path()),
                scratch.path(),
                meta.clone(),
                RuntimeKind::Python,
            )
            .await
            .unwrap();
        // root, numpy and pandas Zygotes plus the leaf
        assert_eq!(f.pool.live_count(), 4);

        for id in 0..3 {
            let state = f.cache.nodes[id].state.lock().await;
            let sb = state.sb.as_ref().unwrap();
            assert_eq!(state.refcount, 0);
            assert!(sb.is_paused().await);
        }

        // second create reuses the pandas Zygote
        let created = f.pool.created_count();
        let leaf2 = f
            .cache
            .create(
                f.pool.as_ref(),
                true,
                Some(scratch.path()),
                scratch.path(),
                meta,
                RuntimeKind::Python,
            )
            .await
            .unwrap();
        assert_eq!(f.pool.created_count(), created + 1);

        let stats = f.cache.stats();
        assert_eq!(stats[2].packages, pkgs(&["numpy", "pandas"]));
        assert_eq!(stats[2].hits, 2);
        assert_eq!(stats[2].leaf_children, 2);
        assert_eq!(stats[1].nonleaf_children, 1);

        // the pandas Zygote links every install into its code dir
        let state = f.cache.nodes[2].state.lock().await;
        let code_dir = state.code_dir.clone().unwrap();
        assert_eq!(state.meta.as_ref().unwrap().imports, pkgs(&["pandas"]));
        drop(state);
        assert!(std::fs::symlink_metadata(code_dir.join("packages").join("numpy")).is_ok());

        leaf.destroy("test").await;
        leaf2.destroy("test").await;
        f.cache.cleanup().await;
        assert_eq!(f.pool.live_count(), 0);
        assert_eq!(f.pool.mem().available_mb(), 2048);
    }

    #[tokio::test]
    async fn test_stale_zygote_is_replaced_once() {
        let f = fixture(TREE);
        let scratch = tempfile::TempDir::new().unwrap();
        let meta = SandboxMeta {
            installs: pkgs(&["requests"]),
            ..Default::default()
        };
        let create = || {
            f.cache.create(
                f.pool.as_ref(),
                true,
                Some(scratch.path()),
                scratch.path(),
                meta.clone(),
                RuntimeKind::Python,
            )
        };

        let first = create().await.unwrap();
        let old = f.cache.nodes[3].state.lock().await.sb.clone().unwrap();

        f.pool.fail_next_forks(1);
        let second = create().await.unwrap();

        let new = f.cache.nodes[3].state.lock().await.sb.clone().unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(old.is_dead().await);
        assert!(!second.is_dead().await);

        first.destroy("test").await;
        second.destroy("test").await;
        f.cache.cleanup().await;
        assert_eq!(f.pool.live_count(), 0);
    }

    #[tokio::test]
    async fn test_evicted_zygote_is_recreated() {
        let f = fixture(TREE);
        let scratch = tempfile::TempDir::new().unwrap();
        let meta = SandboxMeta {
            installs: pkgs(&["requests"]),
            ..Default::default()
        };

        let leaf = f
            .cache
            .create(f.pool.as_ref(), true, Some(scratch.path()), scratch.path(), meta.clone(), RuntimeKind::Python)
            .await
            .unwrap();
        let zygote = f.cache.nodes[3].state.lock().await.sb.clone().unwrap();
        zygote.destroy_if_paused("evicted").await;
        assert!(zygote.is_dead().await);

        let leaf2 = f
            .cache
            .create(f.pool.as_ref(), true, Some(scratch.path()), scratch.path(), meta, RuntimeKind::Python)
            .await
            .unwrap();
        let replacement = f.cache.nodes[3].state.lock().await.sb.clone().unwrap();
        assert!(!Arc::ptr_eq(&zygote, &replacement));

        leaf.destroy("test").await;
        leaf2.destroy("test").await;
        f.cache.cleanup().await;
    }

    #[tokio::test]
    async fn test_warmup_creates_bottom_zygotes() {
        let f = fixture(TREE);
        f.cache.warmup().await.unwrap();

        for id in 0..f.cache.node_count() {
            let state = f.cache.nodes[id].state.lock().await;
            let sb = state.sb.as_ref().unwrap();
            assert!(sb.is_paused().await);
        }
        assert!(f.cache.dump().contains("pandas [indirect: numpy]"));

        f.cache.cleanup().await;
        assert_eq!(f.pool.live_count(), 0);
    }
}
