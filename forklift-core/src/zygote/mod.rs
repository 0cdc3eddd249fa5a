// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Zygote import cache.
//!
//! A Zygote is a paused sandbox that has already imported a set of
//! packages. Leaves are forked from the deepest Zygote whose packages the
//! function needs, skipping the imports on cold start.

mod multi_tree;
mod tree;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use multi_tree::MultiTree;
pub use tree::ImportCache;

use crate::config::{ImportCacheMode, WorkerConfig};
use crate::error::{ForkliftResult, ZygoteError};
use crate::packages::PackagePuller;
use crate::sandbox::{SandboxHandle, SandboxMeta, SandboxPool};
use crate::storage::DirMaker;
use crate::types::RuntimeKind;

/// Creates sandboxes by forking cached Zygotes.
#[async_trait]
pub trait ZygoteProvider: Send + Sync {
    /// Fork a new sandbox in `child_pool` from the best Zygote for
    /// `meta.installs`.
    async fn create(
        &self,
        child_pool: &dyn SandboxPool,
        is_leaf: bool,
        code_dir: Option<&Path>,
        scratch_dir: &Path,
        meta: SandboxMeta,
        runtime: RuntimeKind,
    ) -> ForkliftResult<SandboxHandle>;

    /// Install every node's packages and start the bottom Zygotes.
    async fn warmup(&self) -> ForkliftResult<()>;

    /// Destroy every Zygote, children before parents.
    async fn cleanup(&self);

    /// Tree rendered with per-node fork counts.
    fn dump(&self) -> String;

    /// Per-node counters in pre-order.
    fn stats(&self) -> Vec<NodeStats>;
}

/// Counters of one tree node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    /// Own and inherited packages.
    pub packages: Vec<String>,
    /// Reservations of this node's Zygote.
    pub hits: u64,
    pub leaf_children: u64,
    pub nonleaf_children: u64,
}

/// `import_cache_tree` as written in the configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TreeSpec {
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub children: Vec<TreeSpec>,
}

impl TreeSpec {
    pub fn parse(json: &str) -> ForkliftResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            ZygoteError::TreeParse {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Inline JSON when the setting looks like an object, otherwise a path.
    /// No setting gives a tree with only the root.
    pub fn from_setting(setting: Option<&str>) -> ForkliftResult<Self> {
        let Some(setting) = setting.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(Self::default());
        };
        if setting.starts_with('{') && setting.ends_with('}') {
            return Self::parse(setting);
        }

        let content = std::fs::read_to_string(setting).map_err(|e| ZygoteError::TreeRead {
            path: setting.into(),
            reason: e.to_string(),
        })?;
        Self::parse(&content)
    }
}

/// Build the provider selected by `features.import_cache`, if any.
pub fn provider_from_config(
    conf: &WorkerConfig,
    pool: Arc<dyn SandboxPool>,
    puller: Arc<PackagePuller>,
    code_dirs: Arc<DirMaker>,
    scratch_dirs: Arc<DirMaker>,
) -> ForkliftResult<Option<Arc<dyn ZygoteProvider>>> {
    let provider: Arc<dyn ZygoteProvider> = match conf.features.import_cache {
        ImportCacheMode::Disabled => return Ok(None),
        ImportCacheMode::Tree => {
            let spec = TreeSpec::from_setting(conf.import_cache_tree.as_deref())?;
            let cache = ImportCache::new(&spec, pool, puller, code_dirs, scratch_dirs)?;
            tracing::info!(nodes = cache.node_count(), tree = %cache.dump(), "Import cache ready");
            Arc::new(cache)
        }
        ImportCacheMode::MultiTree => {
            let spec = TreeSpec::from_setting(conf.import_cache_tree.as_deref())?;
            Arc::new(MultiTree::new(
                &spec,
                MultiTree::default_tree_count(),
                pool,
                puller,
                code_dirs,
                scratch_dirs,
            )?)
        }
    };
    Ok(Some(provider))
}
