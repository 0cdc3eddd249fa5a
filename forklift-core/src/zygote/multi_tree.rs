// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Several independent copies of the import cache tree.
//!
//! Spreading creates over copies keeps a hot Zygote from serializing every
//! fork behind its node lock.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;

use super::{ImportCache, NodeStats, TreeSpec, ZygoteProvider};
use crate::error::ForkliftResult;
use crate::packages::PackagePuller;
use crate::sandbox::{SandboxHandle, SandboxMeta, SandboxPool};
use crate::storage::DirMaker;
use crate::types::RuntimeKind;

pub struct MultiTree {
    trees: Vec<ImportCache>,
}

impl MultiTree {
    pub fn new(
        spec: &TreeSpec,
        count: usize,
        pool: Arc<dyn SandboxPool>,
        puller: Arc<PackagePuller>,
        code_dirs: Arc<DirMaker>,
        scratch_dirs: Arc<DirMaker>,
    ) -> ForkliftResult<Self> {
        let trees = (0..count.max(1))
            .map(|_| {
                ImportCache::new(
                    spec,
                    pool.clone(),
                    puller.clone(),
                    code_dirs.clone(),
                    scratch_dirs.clone(),
                )
            })
            .collect::<ForkliftResult<Vec<_>>>()?;

        tracing::info!(trees = trees.len(), "Multi-tree import cache ready");
        Ok(Self { trees })
    }

    /// 6 on small hosts, 16 on large ones, two per CPU in between.
    pub fn default_tree_count() -> usize {
        tree_count_for(num_cpus::get())
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }
}

fn tree_count_for(cpus: usize) -> usize {
    match cpus {
        0..=2 => 6,
        n if n > 10 => 16,
        n => 2 * n,
    }
}

#[async_trait]
impl ZygoteProvider for MultiTree {
    async fn create(
        &self,
        child_pool: &dyn SandboxPool,
        is_leaf: bool,
        code_dir: Option<&Path>,
        scratch_dir: &Path,
        meta: SandboxMeta,
        runtime: RuntimeKind,
    ) -> ForkliftResult<SandboxHandle> {
        let idx = rand::rng().random_range(0..self.trees.len());
        self.trees[idx]
            .create(child_pool, is_leaf, code_dir, scratch_dir, meta, runtime)
            .await
    }

    async fn warmup(&self) -> ForkliftResult<()> {
        for tree in &self.trees {
            tree.warmup().await?;
        }
        Ok(())
    }

    async fn cleanup(&self) {
        for tree in &self.trees {
            tree.cleanup().await;
        }
    }

    fn dump(&self) -> String {
        self.trees
            .iter()
            .enumerate()
            .map(|(i, tree)| format!("TREE {}\n{}", i, tree.dump()))
            .collect()
    }

    /// Counters summed over all copies.
    fn stats(&self) -> Vec<NodeStats> {
        let mut totals = match self.trees.first() {
            Some(tree) => tree.stats(),
            None => return Vec::new(),
        };
        for tree in &self.trees[1..] {
            for (total, node) in totals.iter_mut().zip(tree.stats()) {
                total.hits += node.hits;
                total.leaf_children += node.leaf_children;
                total.nonleaf_children += node.nonleaf_children;
            }
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigFormat, ConfigLoader};
    use crate::sandbox::mock::MockPool;
    use crate::storage::StoreMode;

    #[test]
    fn test_tree_count_by_cpus() {
        assert_eq!(tree_count_for(1), 6);
        assert_eq!(tree_count_for(2), 6);
        assert_eq!(tree_count_for(3), 6);
        assert_eq!(tree_count_for(8), 16);
        assert_eq!(tree_count_for(10), 20);
        assert_eq!(tree_count_for(11), 16);
        assert_eq!(tree_count_for(64), 16);
    }

    #[tokio::test]
    async fn test_creates_spread_and_stats_sum() {
        let dir = tempfile::TempDir::new().unwrap();
        let json = serde_json::json!({
            "worker_dir": dir.path().join("worker"),
            "sock_base_path": dir.path().join("base"),
            "mem_pool_mb": 4096,
        });
        let conf = ConfigLoader::load_string(&json.to_string(), ConfigFormat::Json).unwrap();
        let pool = Arc::new(MockPool::new(4096));
        let puller = Arc::new(PackagePuller::new(pool.clone(), None, &conf).unwrap());
        let code_dirs =
            Arc::new(DirMaker::new(&conf.worker_dir, "code", StoreMode::Regular).unwrap());
        let scratch_dirs =
            Arc::new(DirMaker::new(&conf.worker_dir, "scratch", StoreMode::Regular).unwrap());

        let multi = MultiTree::new(
            &TreeSpec::default(),
            3,
            pool.clone(),
            puller,
            code_dirs,
            scratch_dirs,
        )
        .unwrap();
        assert_eq!(multi.tree_count(), 3);

        let scratch = tempfile::TempDir::new().unwrap();
        let mut leaves = Vec::new();
        for _ in 0..5 {
            let leaf = multi
                .create(
                    pool.as_ref(),
                    true,
                    Some(scratch.path()),
                    scratch.path(),
                    SandboxMeta::default(),
                    RuntimeKind::Python,
                )
                .await
                .unwrap();
            leaves.push(leaf);
        }

        let stats = multi.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].hits, 5);
        assert_eq!(stats[0].leaf_children, 5);
        assert_eq!(multi.dump().matches("ROOT").count(), 3);

        for leaf in leaves {
            leaf.destroy("test").await;
        }
        multi.cleanup().await;
        assert_eq!(pool.live_count(), 0);
    }
}
