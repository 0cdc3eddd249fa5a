// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Installs packages once per worker, inside throwaway sandboxes.
//!
//! Each package lands in `<pkgs_dir>/<name>/files`. The installer sandbox
//! sees that directory as `/host`, runs the pip-install helper and answers
//! with the package's dependencies and top-level modules.

use std::collections::HashSet;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::DepTracer;
use crate::config::WorkerConfig;
use crate::error::{ForkliftError, ForkliftResult, InstallError};
use crate::sandbox::{SandboxMeta, SandboxPool};
use crate::types::RuntimeKind;

const INSTALLER_CODE: &str = include_str!("../../assets/pip_install.py");

/// What the installer reports about a package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMeta {
    #[serde(rename = "Deps", default)]
    pub deps: Vec<String>,
    #[serde(rename = "TopLevel", default)]
    pub top_level: Vec<String>,
}

/// A package known to this worker. Installed at most once.
#[derive(Debug)]
pub struct Package {
    name: String,
    meta: OnceLock<PackageMeta>,
    install_lock: tokio::sync::Mutex<()>,
}

impl Package {
    fn new(name: String) -> Self {
        Self {
            name,
            meta: OnceLock::new(),
            install_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_installed(&self) -> bool {
        self.meta.get().is_some()
    }

    /// Installer metadata; empty until installed.
    pub fn meta(&self) -> PackageMeta {
        self.meta.get().cloned().unwrap_or_default()
    }
}

/// Lowercase and treat `_` like `-`; distribution names compare that way.
pub fn normalize_pkg(pkg: &str) -> String {
    pkg.trim().to_lowercase().replace('_', "-")
}

/// `name==1.2` -> `name`.
fn base_name(pkg: &str) -> &str {
    pkg.split("==").next().unwrap_or(pkg).trim()
}

pub struct PackagePuller {
    pool: Arc<dyn SandboxPool>,
    tracer: Option<Arc<DepTracer>>,
    pkgs_dir: PathBuf,
    installer_dir: PathBuf,
    installer_mem_mb: u64,
    trace: bool,
    packages: DashMap<String, Arc<Package>>,
}

impl PackagePuller {
    /// Write the installer helper and make sure the packages directory exists.
    pub fn new(
        pool: Arc<dyn SandboxPool>,
        tracer: Option<Arc<DepTracer>>,
        conf: &WorkerConfig,
    ) -> ForkliftResult<Self> {
        let installer_dir = conf.pip_install_dir();
        std::fs::create_dir_all(&installer_dir)
            .map_err(|e| ForkliftError::io("creating installer directory", e))?;
        std::fs::write(installer_dir.join("f.py"), INSTALLER_CODE)
            .map_err(|e| ForkliftError::io("writing installer code", e))?;
        std::fs::create_dir_all(&conf.pkgs_dir)
            .map_err(|e| ForkliftError::io("creating packages directory", e))?;

        Ok(Self {
            pool,
            tracer,
            pkgs_dir: conf.pkgs_dir.clone(),
            installer_dir,
            installer_mem_mb: conf.limits.installer_mem_mb,
            trace: conf.trace.package,
            packages: DashMap::new(),
        })
    }

    pub fn pkgs_dir(&self) -> &Path {
        &self.pkgs_dir
    }

    /// Install `pkgs` and everything they depend on.
    ///
    /// Returns the requested packages followed by newly discovered
    /// dependencies, in discovery order.
    pub async fn install_recursive(&self, pkgs: &[String]) -> ForkliftResult<Vec<String>> {
        let mut installs: Vec<String> = pkgs.iter().map(|p| normalize_pkg(p)).collect();
        let mut seen: HashSet<String> = installs.iter().map(|p| base_name(p).to_string()).collect();

        let mut i = 0;
        while i < installs.len() {
            let pkg = self.get_pkg(&installs[i]).await?;
            let meta = pkg.meta();
            if self.trace {
                tracing::debug!(
                    package = %pkg.name(),
                    deps = ?meta.deps,
                    top_level = ?meta.top_level,
                    "Package resolved"
                );
            }

            for dep in meta.deps {
                let dep = normalize_pkg(&dep);
                if seen.insert(base_name(&dep).to_string()) {
                    installs.push(dep);
                }
            }
            i += 1;
        }

        Ok(installs)
    }

    /// The package record for `pkg`, installing it first if needed.
    pub async fn get_pkg(&self, pkg: &str) -> ForkliftResult<Arc<Package>> {
        let name = normalize_pkg(pkg);
        let pkg = self
            .packages
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Package::new(name)))
            .clone();

        if pkg.is_installed() {
            return Ok(pkg);
        }

        {
            let _guard = pkg.install_lock.lock().await;
            if !pkg.is_installed() {
                let meta = self.sandbox_install(&pkg.name).await?;
                if let Some(tracer) = &self.tracer {
                    tracer.trace_package(&pkg.name, &meta.deps, &meta.top_level);
                }
                let _ = pkg.meta.set(meta);
            }
        }
        Ok(pkg)
    }

    /// Metadata of an installed package, if any.
    pub fn installed_meta(&self, pkg: &str) -> Option<PackageMeta> {
        self.packages
            .get(&normalize_pkg(pkg))
            .and_then(|p| p.meta.get().cloned())
    }

    async fn sandbox_install(&self, name: &str) -> ForkliftResult<PackageMeta> {
        let scratch_dir = self.pkgs_dir.join(name);
        let already_installed = scratch_dir.exists();
        if already_installed {
            tracing::info!(package = %name, "Package directory exists, reusing previous install");
        } else {
            tracing::info!(package = %name, dir = %scratch_dir.display(), "Installing package");
            std::fs::DirBuilder::new()
                .mode(0o700)
                .create(&scratch_dir)
                .map_err(|e| ForkliftError::io("creating package directory", e))?;
        }

        let result = self.run_installer(name, &scratch_dir, already_installed).await;
        if let Err(e) = &result {
            tracing::warn!(package = %name, error = %e, "Package install failed");
            if let Err(e) = std::fs::remove_dir_all(&scratch_dir) {
                tracing::warn!(dir = %scratch_dir.display(), error = %e, "Could not remove failed install");
            }
        }
        result
    }

    async fn run_installer(
        &self,
        name: &str,
        scratch_dir: &Path,
        already_installed: bool,
    ) -> ForkliftResult<PackageMeta> {
        let sandbox_err = |e: ForkliftError| InstallError::Sandbox {
            pkg: name.to_string(),
            reason: e.to_string(),
        };

        let meta = SandboxMeta {
            mem_mb: self.installer_mem_mb,
            ..Default::default()
        };
        let sb = self
            .pool
            .create(
                None,
                true,
                Some(&self.installer_dir),
                scratch_dir,
                Some(meta),
                RuntimeKind::Python,
            )
            .await
            .map_err(sandbox_err)?;

        let body = serde_json::json!({
            "pkg": name,
            "alreadyInstalled": already_installed,
        });
        let resp = sb.client().post("/run/pip-install", body.to_string()).await;
        sb.destroy("package installation complete").await;
        let resp = resp.map_err(sandbox_err)?;

        if resp.status() != http::StatusCode::OK {
            return Err(InstallError::Status {
                pkg: name.to_string(),
                status: resp.status().as_u16(),
                body: String::from_utf8_lossy(resp.body()).into_owned(),
            }
            .into());
        }

        let mut meta: PackageMeta =
            serde_json::from_slice(resp.body()).map_err(|e| InstallError::BadMeta {
                pkg: name.to_string(),
                reason: e.to_string(),
            })?;
        meta.deps = meta.deps.iter().map(|d| normalize_pkg(d)).collect();
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigFormat, ConfigLoader};
    use crate::sandbox::mock::{MockContext, MockPool};
    use bytes::Bytes;
    use http::{Request, Response};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(dir: &Path) -> WorkerConfig {
        let json = serde_json::json!({
            "worker_dir": dir.join("worker"),
            "sock_base_path": dir.join("base"),
            "mem_pool_mb": 2048,
        });
        ConfigLoader::load_string(&json.to_string(), ConfigFormat::Json).unwrap()
    }

    /// Installer that knows a tiny dependency graph.
    fn fake_pip(calls: Arc<AtomicUsize>) -> crate::sandbox::mock::MockResponder {
        Arc::new(move |_ctx: &MockContext, req: &Request<Bytes>| {
            calls.fetch_add(1, Ordering::SeqCst);
            let event: serde_json::Value = serde_json::from_slice(req.body()).unwrap();
            let meta = match event["pkg"].as_str().unwrap() {
                "requests" => serde_json::json!({"Deps": ["idna", "Charset_Normalizer"], "TopLevel": ["requests"]}),
                "idna" => serde_json::json!({"Deps": [], "TopLevel": ["idna"]}),
                "charset-normalizer" => {
                    serde_json::json!({"Deps": ["idna"], "TopLevel": ["charset_normalizer"]})
                }
                _ => return Response::builder().status(500).body(Bytes::from("no such package")).unwrap(),
            };
            Response::new(Bytes::from(meta.to_string()))
        })
    }

    #[test]
    fn test_normalize_pkg() {
        assert_eq!(normalize_pkg("Charset_Normalizer"), "charset-normalizer");
        assert_eq!(normalize_pkg(" NumPy==1.26 "), "numpy==1.26");
        assert_eq!(base_name("numpy==1.26"), "numpy");
        assert_eq!(base_name("numpy"), "numpy");
    }

    #[tokio::test]
    async fn test_install_recursive_follows_deps_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let conf = config(dir.path());
        let pool = Arc::new(MockPool::new(2048));
        let calls = Arc::new(AtomicUsize::new(0));
        pool.set_responder(fake_pip(calls.clone()));

        let puller = PackagePuller::new(pool.clone(), None, &conf).unwrap();
        assert!(conf.pip_install_dir().join("f.py").exists());

        let installs = puller
            .install_recursive(&["Requests".to_string()])
            .await
            .unwrap();
        assert_eq!(installs, vec!["requests", "idna", "charset-normalizer"]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(conf.pkgs_dir.join("requests").is_dir());

        // everything is cached now
        puller.install_recursive(&["requests".to_string()]).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            puller.installed_meta("requests").unwrap().top_level,
            vec!["requests"]
        );

        // installer sandboxes are gone and their memory is back
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.mem().available_mb(), 2048);
    }

    #[tokio::test]
    async fn test_failed_install_is_retried() {
        let dir = tempfile::TempDir::new().unwrap();
        let conf = config(dir.path());
        let pool = Arc::new(MockPool::new(2048));
        let calls = Arc::new(AtomicUsize::new(0));
        pool.set_responder(fake_pip(calls.clone()));
        let puller = PackagePuller::new(pool.clone(), None, &conf).unwrap();

        let err = puller.get_pkg("left-pad").await.unwrap_err();
        assert!(matches!(
            err,
            ForkliftError::Install(InstallError::Status { status: 500, .. })
        ));
        assert!(!conf.pkgs_dir.join("left-pad").exists());

        puller.get_pkg("left-pad").await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_existing_dir_is_reported_installed() {
        let dir = tempfile::TempDir::new().unwrap();
        let conf = config(dir.path());
        let pool = Arc::new(MockPool::new(2048));
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let sink = seen.clone();
        pool.set_responder(Arc::new(move |ctx: &MockContext, req: &Request<Bytes>| {
            let event: serde_json::Value = serde_json::from_slice(req.body()).unwrap();
            *sink.lock() = Some((event["alreadyInstalled"].as_bool(), ctx.meta.mem_mb));
            Response::new(Bytes::from(r#"{"Deps": [], "TopLevel": ["idna"]}"#))
        }));
        let puller = PackagePuller::new(pool, None, &conf).unwrap();

        std::fs::create_dir_all(conf.pkgs_dir.join("idna")).unwrap();
        let pkg = puller.get_pkg("idna").await.unwrap();
        assert!(pkg.is_installed());
        assert_eq!(
            *seen.lock(),
            Some((Some(true), conf.limits.installer_mem_mb))
        );
    }
}
