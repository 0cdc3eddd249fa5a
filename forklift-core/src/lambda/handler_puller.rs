// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Resolves function names to local code directories.
//!
//! The registry is either a local directory or an http(s) URL. Candidates
//! are tried in order: `<name>.tar.gz`, `<name>.py`, `<name>.bin` and, for
//! local registries only, a bare `<name>/` directory. Each pull that finds
//! newer code materializes it into a fresh directory; unchanged code
//! returns the directory of the previous pull.

use std::io::Cursor;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use dashmap::DashMap;
use flate2::read::GzDecoder;
use walkdir::WalkDir;

use crate::error::{ForkliftError, ForkliftResult, PullError};
use crate::storage::DirMaker;
use crate::types::{FunctionName, RuntimeKind};

/// Registry artifact kinds, in lookup order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Artifact {
    Archive,
    Python,
    Binary,
    Directory,
}

impl Artifact {
    const REMOTE: [Artifact; 3] = [Artifact::Archive, Artifact::Python, Artifact::Binary];
    const LOCAL: [Artifact; 4] = [
        Artifact::Archive,
        Artifact::Python,
        Artifact::Binary,
        Artifact::Directory,
    ];

    fn suffix(&self) -> &'static str {
        match self {
            Artifact::Archive => ".tar.gz",
            Artifact::Python => ".py",
            Artifact::Binary => ".bin",
            Artifact::Directory => "",
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    /// Modification time (local) or `Last-Modified` (remote).
    version: String,
    runtime: RuntimeKind,
    path: PathBuf,
}

pub struct HandlerPuller {
    prefix: String,
    remote: bool,
    code_dirs: Arc<DirMaker>,
    cache: DashMap<String, CacheEntry>,
    http: reqwest::Client,
}

impl HandlerPuller {
    pub fn new(registry: &str, code_dirs: Arc<DirMaker>) -> Self {
        let remote = registry.starts_with("http://") || registry.starts_with("https://");
        Self {
            prefix: registry.trim_end_matches('/').to_string(),
            remote,
            code_dirs,
            cache: DashMap::new(),
            http: reqwest::Client::new(),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Resolve `name` to its runtime and materialized code directory.
    pub async fn pull(&self, name: &str) -> ForkliftResult<(RuntimeKind, PathBuf)> {
        let name = FunctionName::new(name).map_err(|_| PullError::InvalidName {
            name: name.to_string(),
        })?;

        let mut tried = Vec::new();
        if self.remote {
            for artifact in Artifact::REMOTE {
                let url = format!("{}/{}{}", self.prefix, name, artifact.suffix());
                if let Some(found) = self.pull_remote(&url, &name, artifact).await? {
                    return Ok(found);
                }
                tried.push(url);
            }
        } else {
            for artifact in Artifact::LOCAL {
                let path = PathBuf::from(format!("{}/{}{}", self.prefix, name, artifact.suffix()));
                let matches = match artifact {
                    Artifact::Directory => path.is_dir(),
                    _ => path.is_file(),
                };
                if matches {
                    return self.pull_local(path, &name, artifact).await;
                }
                tried.push(path.display().to_string());
            }
        }

        Err(PullError::NotFound {
            name: name.to_string(),
            tried,
        }
        .into())
    }

    /// Forget the cached directory so the next pull materializes afresh.
    pub fn reset(&self, name: &str) {
        self.cache.remove(name);
    }

    fn cached(&self, name: &FunctionName, version: &str) -> Option<(RuntimeKind, PathBuf)> {
        self.cache
            .get(name.as_str())
            .filter(|entry| entry.version == version)
            .map(|entry| (entry.runtime, entry.path.clone()))
    }

    async fn pull_local(
        &self,
        src: PathBuf,
        name: &FunctionName,
        artifact: Artifact,
    ) -> ForkliftResult<(RuntimeKind, PathBuf)> {
        let version = {
            let src = src.clone();
            tokio::task::spawn_blocking(move || local_version(&src, artifact))
                .await
                .map_err(|e| PullError::Extract {
                    source_path: name.to_string(),
                    reason: e.to_string(),
                })??
        };
        if let Some(hit) = self.cached(name, &version) {
            return Ok(hit);
        }

        let target = self.code_dirs.get(name.as_str());
        tracing::info!(function = %name, src = %src.display(), target = %target.display(), "Pulling handler");
        let runtime = {
            let dst = target.clone();
            tokio::task::spawn_blocking(move || materialize_local(&src, artifact, &dst))
                .await
                .map_err(|e| PullError::Extract {
                    source_path: name.to_string(),
                    reason: e.to_string(),
                })??
        };

        self.cache.insert(
            name.to_string(),
            CacheEntry {
                version,
                runtime,
                path: target.clone(),
            },
        );
        Ok((runtime, target))
    }

    /// `Ok(None)` on 404 so the caller moves on to the next candidate.
    async fn pull_remote(
        &self,
        url: &str,
        name: &FunctionName,
        artifact: Artifact,
    ) -> ForkliftResult<Option<(RuntimeKind, PathBuf)>> {
        let transport = |e: reqwest::Error| PullError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        };

        let cached = self.cache.get(name.as_str()).map(|e| e.value().clone());
        let mut req = self.http.get(url);
        if let Some(entry) = &cached {
            req = req.header(reqwest::header::IF_MODIFIED_SINCE, entry.version.as_str());
        }
        let resp = req.send().await.map_err(transport)?;

        match resp.status() {
            reqwest::StatusCode::NOT_FOUND => return Ok(None),
            reqwest::StatusCode::NOT_MODIFIED => {
                if let Some(entry) = cached {
                    return Ok(Some((entry.runtime, entry.path)));
                }
            }
            status if !status.is_success() => {
                return Err(PullError::Http {
                    url: url.to_string(),
                    status: status.as_u16(),
                }
                .into())
            }
            _ => {}
        }

        let last_modified = resp
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await.map_err(transport)?;

        let target = self.code_dirs.get(name.as_str());
        tracing::info!(function = %name, url = %url, target = %target.display(), "Pulling handler");
        let runtime = {
            let target = target.clone();
            let url = url.to_string();
            tokio::task::spawn_blocking(move || materialize_bytes(&body, artifact, &target, &url))
                .await
                .map_err(|e| PullError::Extract {
                    source_path: name.to_string(),
                    reason: e.to_string(),
                })??
        };

        if let Some(version) = last_modified {
            self.cache.insert(
                name.to_string(),
                CacheEntry {
                    version,
                    runtime,
                    path: target.clone(),
                },
            );
        }
        Ok(Some((runtime, target)))
    }
}

fn mtime_nanos(meta: &std::fs::Metadata) -> u128 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// Newest modification time of the artifact; for directories, of anything
/// inside them.
fn local_version(src: &Path, artifact: Artifact) -> ForkliftResult<String> {
    let newest = match artifact {
        Artifact::Directory => {
            let mut newest = 0u128;
            for entry in WalkDir::new(src) {
                let entry = entry.map_err(|e| PullError::Extract {
                    source_path: src.display().to_string(),
                    reason: e.to_string(),
                })?;
                if let Ok(meta) = entry.metadata() {
                    newest = newest.max(mtime_nanos(&meta));
                }
            }
            newest
        }
        _ => {
            let meta = std::fs::metadata(src)
                .map_err(|e| ForkliftError::io("reading handler metadata", e))?;
            mtime_nanos(&meta)
        }
    };
    Ok(newest.to_string())
}

fn materialize_local(src: &Path, artifact: Artifact, target: &Path) -> ForkliftResult<RuntimeKind> {
    let result = (|| {
        std::fs::create_dir(target)
            .map_err(|e| ForkliftError::io("creating handler directory", e))?;
        match artifact {
            Artifact::Archive => {
                let file = std::fs::File::open(src)
                    .map_err(|e| ForkliftError::io("opening handler archive", e))?;
                unpack(file, target, &src.display().to_string())?;
            }
            Artifact::Python | Artifact::Binary => {
                let code = std::fs::read(src).map_err(|e| ForkliftError::io("reading handler", e))?;
                write_single(&code, artifact, target)?;
            }
            Artifact::Directory => copy_tree(src, target)?,
        }
        detect_runtime(target)
    })();
    if result.is_err() {
        let _ = std::fs::remove_dir_all(target);
    }
    result
}

fn materialize_bytes(
    body: &[u8],
    artifact: Artifact,
    target: &Path,
    url: &str,
) -> ForkliftResult<RuntimeKind> {
    let result = (|| {
        std::fs::create_dir(target)
            .map_err(|e| ForkliftError::io("creating handler directory", e))?;
        match artifact {
            Artifact::Archive => unpack(Cursor::new(body), target, url)?,
            _ => write_single(body, artifact, target)?,
        }
        detect_runtime(target)
    })();
    if result.is_err() {
        let _ = std::fs::remove_dir_all(target);
    }
    result
}

fn unpack(reader: impl std::io::Read, target: &Path, source: &str) -> ForkliftResult<()> {
    tar::Archive::new(GzDecoder::new(reader))
        .unpack(target)
        .map_err(|e| {
            PullError::Extract {
                source_path: source.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
}

fn write_single(code: &[u8], artifact: Artifact, target: &Path) -> ForkliftResult<()> {
    let (file, mode) = match artifact {
        Artifact::Binary => ("f.bin", 0o755),
        _ => ("f.py", 0o644),
    };
    let path = target.join(file);
    std::fs::write(&path, code).map_err(|e| ForkliftError::io("writing handler", e))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| ForkliftError::io("setting handler permissions", e))
}

fn copy_tree(src: &Path, target: &Path) -> ForkliftResult<()> {
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| PullError::Extract {
            source_path: src.display().to_string(),
            reason: e.to_string(),
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| PullError::Extract {
                source_path: src.display().to_string(),
                reason: e.to_string(),
            })?;
        let dst = target.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dst).map_err(|e| ForkliftError::io("copying handler", e))?;
        } else {
            std::fs::copy(entry.path(), &dst).map_err(|e| ForkliftError::io("copying handler", e))?;
        }
    }
    Ok(())
}

fn detect_runtime(dir: &Path) -> ForkliftResult<RuntimeKind> {
    if dir.join("f.py").is_file() {
        Ok(RuntimeKind::Python)
    } else if dir.join("f.bin").is_file() {
        Ok(RuntimeKind::Native)
    } else {
        Err(PullError::UnknownRuntime {
            dir: dir.to_path_buf(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreMode;
    use flate2::write::GzEncoder;
    use std::time::SystemTime;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn bump_mtime(path: &Path, secs_ahead: i64) {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
        filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(now + secs_ahead, 0))
            .unwrap();
    }

    fn puller(registry: &str, worker: &Path) -> HandlerPuller {
        let code_dirs = Arc::new(DirMaker::new(worker, "code", StoreMode::Regular).unwrap());
        HandlerPuller::new(registry, code_dirs)
    }

    fn tar_gz(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), flate2::Compression::fast()));
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, content.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[tokio::test]
    async fn test_pull_py_file_caches_by_mtime() {
        let registry = tempfile::TempDir::new().unwrap();
        let worker = tempfile::TempDir::new().unwrap();
        let src = registry.path().join("echo.py");
        std::fs::write(&src, "def f(event):\n    return event\n").unwrap();

        let puller = puller(registry.path().to_str().unwrap(), worker.path());
        let (runtime, dir) = puller.pull("echo").await.unwrap();
        assert_eq!(runtime, RuntimeKind::Python);
        assert!(dir.join("f.py").is_file());

        let (_, again) = puller.pull("echo").await.unwrap();
        assert_eq!(dir, again);

        std::fs::write(&src, "def f(event):\n    return 'v2'\n").unwrap();
        bump_mtime(&src, 10);
        let (_, updated) = puller.pull("echo").await.unwrap();
        assert_ne!(dir, updated);
        assert!(std::fs::read_to_string(updated.join("f.py")).unwrap().contains("v2"));

        puller.reset("echo");
        let (_, fresh) = puller.pull("echo").await.unwrap();
        assert_ne!(fresh, updated);
    }

    #[tokio::test]
    async fn test_pull_archive_before_py() {
        let registry = tempfile::TempDir::new().unwrap();
        let worker = tempfile::TempDir::new().unwrap();
        std::fs::write(
            registry.path().join("hello.tar.gz"),
            tar_gz(&[("f.py", "def f(e): return 'tar'"), ("requirements.txt", "six\n")]),
        )
        .unwrap();
        std::fs::write(registry.path().join("hello.py"), "def f(e): return 'py'").unwrap();

        let puller = puller(registry.path().to_str().unwrap(), worker.path());
        let (runtime, dir) = puller.pull("hello").await.unwrap();
        assert_eq!(runtime, RuntimeKind::Python);
        assert!(dir.join("requirements.txt").is_file());
        assert!(std::fs::read_to_string(dir.join("f.py")).unwrap().contains("tar"));
    }

    #[tokio::test]
    async fn test_pull_bin_and_directory() {
        let registry = tempfile::TempDir::new().unwrap();
        let worker = tempfile::TempDir::new().unwrap();
        std::fs::write(registry.path().join("native.bin"), b"\x7fELF").unwrap();
        let dir_src = registry.path().join("tree");
        std::fs::create_dir_all(dir_src.join("lib")).unwrap();
        std::fs::write(dir_src.join("f.py"), "def f(e): return 1").unwrap();
        std::fs::write(dir_src.join("lib").join("util.py"), "X = 1").unwrap();

        let puller = puller(registry.path().to_str().unwrap(), worker.path());
        let (runtime, dir) = puller.pull("native").await.unwrap();
        assert_eq!(runtime, RuntimeKind::Native);
        let mode = std::fs::metadata(dir.join("f.bin")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);

        let (runtime, dir) = puller.pull("tree").await.unwrap();
        assert_eq!(runtime, RuntimeKind::Python);
        assert!(dir.join("lib").join("util.py").is_file());

        // a change deep inside the directory is a new version
        bump_mtime(&dir_src.join("lib").join("util.py"), 10);
        let (_, changed) = puller.pull("tree").await.unwrap();
        assert_ne!(dir, changed);
    }

    #[tokio::test]
    async fn test_pull_errors() {
        let registry = tempfile::TempDir::new().unwrap();
        let worker = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(registry.path().join("empty")).unwrap();
        std::fs::write(
            registry.path().join("bad.tar.gz"),
            tar_gz(&[("README", "no handler here")]),
        )
        .unwrap();
        let puller = puller(registry.path().to_str().unwrap(), worker.path());

        let err = puller.pull("../etc").await.unwrap_err();
        assert!(matches!(err, ForkliftError::Pull(PullError::InvalidName { .. })));

        let err = puller.pull("missing").await.unwrap_err();
        match err {
            ForkliftError::Pull(PullError::NotFound { tried, .. }) => assert_eq!(tried.len(), 4),
            other => panic!("unexpected error: {other}"),
        }

        let err = puller.pull("empty").await.unwrap_err();
        assert!(matches!(err, ForkliftError::Pull(PullError::UnknownRuntime { .. })));

        let err = puller.pull("bad").await.unwrap_err();
        assert!(matches!(err, ForkliftError::Pull(PullError::UnknownRuntime { .. })));
    }

    /// Serves `/hello.py` with a fixed Last-Modified, 304 when asked
    /// conditionally; everything else is 404 except `/broken.tar.gz` (500).
    async fn fake_registry() -> (String, Arc<std::sync::atomic::AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let conditional = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = conditional.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    return;
                };
                let seen = seen.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let n = conn.read(&mut buf).await.unwrap_or(0);
                    let head = String::from_utf8_lossy(&buf[..n]).to_lowercase();
                    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();

                    let (status, body) = match path.as_str() {
                        "/hello.py" if head.contains("if-modified-since") => {
                            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            ("304 Not Modified", "")
                        }
                        "/hello.py" => ("200 OK", "def f(e): return 'remote'"),
                        "/broken.tar.gz" => ("500 Internal Server Error", "boom"),
                        _ => ("404 Not Found", ""),
                    };
                    let resp = format!(
                        "HTTP/1.1 {}\r\nLast-Modified: Wed, 21 Oct 2015 07:28:00 GMT\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = conn.write_all(resp.as_bytes()).await;
                });
            }
        });

        (format!("http://{}", addr), conditional)
    }

    #[tokio::test]
    async fn test_pull_remote() {
        let (url, conditional) = fake_registry().await;
        let worker = tempfile::TempDir::new().unwrap();
        let puller = puller(&url, worker.path());
        assert!(puller.is_remote());

        let (runtime, dir) = puller.pull("hello").await.unwrap();
        assert_eq!(runtime, RuntimeKind::Python);
        assert!(std::fs::read_to_string(dir.join("f.py")).unwrap().contains("remote"));

        let (_, again) = puller.pull("hello").await.unwrap();
        assert_eq!(dir, again);
        assert_eq!(conditional.load(std::sync::atomic::Ordering::SeqCst), 1);

        let err = puller.pull("broken").await.unwrap_err();
        assert!(matches!(
            err,
            ForkliftError::Pull(PullError::Http { status: 500, .. })
        ));

        let err = puller.pull("nothing").await.unwrap_err();
        match err {
            ForkliftError::Pull(PullError::NotFound { tried, .. }) => assert_eq!(tried.len(), 3),
            other => panic!("unexpected error: {other}"),
        }
    }
}
