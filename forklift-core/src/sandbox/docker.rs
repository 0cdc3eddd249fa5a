// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Docker-backed leaf sandboxes.
//!
//! One container per sandbox, started on an idle entrypoint; the runtime
//! is then launched with `exec` and reports readiness through the
//! `<scratch>/server_pipe` FIFO. No Zygotes: forking is rejected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bollard::exec::{CreateExecOptions, StartExecOptions};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::Docker;
use dashmap::DashMap;
use nix::sys::stat::Mode;
use tokio::io::AsyncReadExt;

use super::sock::{write_bootstrap, RUNTIME_LOG, SOCKET_NAME};
use super::{
    next_sandbox_id, EventListener, ForkTarget, ListenerSet, SafeSandbox, Sandbox, SandboxClient,
    SandboxHandle, SandboxMeta, SandboxPool,
};
use crate::config::WorkerConfig;
use crate::error::{ForkliftResult, SandboxError};
use crate::types::{RuntimeKind, SandboxId};

const READY_TIMEOUT: Duration = Duration::from_secs(20);
const SERVER_PIPE: &str = "server_pipe";
const POOL_LABEL: &str = "forklift.pool";

fn docker_err(e: impl std::fmt::Display) -> SandboxError {
    SandboxError::Docker {
        reason: e.to_string(),
    }
}

/// Factory for Docker leaves.
pub struct DockerPool {
    name: String,
    conf: Arc<WorkerConfig>,
    docker: Docker,
    listeners: ListenerSet,
    handles: DashMap<SandboxId, Weak<SafeSandbox>>,
}

impl DockerPool {
    pub fn new(name: &str, conf: Arc<WorkerConfig>) -> ForkliftResult<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(docker_err)?;
        tracing::info!(pool = %name, image = %conf.docker.base_image, "Connected to Docker daemon");
        Ok(Self {
            name: name.to_string(),
            conf,
            docker,
            listeners: ListenerSet::default(),
            handles: DashMap::new(),
        })
    }

    fn container_config(
        &self,
        code_dir: &Path,
        scratch_dir: &Path,
        meta: &SandboxMeta,
    ) -> ContainerCreateBody {
        let binds = vec![
            format!("{}:/host", scratch_dir.display()),
            format!("{}:/packages:ro", self.conf.pkgs_dir.display()),
            format!("{}:/handler:ro", code_dir.display()),
        ];
        let python_path: Vec<String> = meta
            .installs
            .iter()
            .map(|pkg| format!("/packages/{}/files", pkg))
            .collect();

        let runtime = if self.conf.docker.runtime.is_empty() {
            None
        } else {
            Some(self.conf.docker.runtime.clone())
        };
        let host_config = HostConfig {
            binds: Some(binds),
            memory: Some(meta.mem_mb as i64 * 1024 * 1024),
            memory_swappiness: Some(self.conf.limits.swappiness as i64),
            pids_limit: Some(self.conf.limits.procs as i64),
            nano_cpus: Some(meta.cpu_percent as i64 * 10_000_000),
            runtime,
            ..Default::default()
        };

        ContainerCreateBody {
            image: Some(self.conf.docker.base_image.clone()),
            cmd: Some(vec!["/spin".to_string()]),
            env: Some(vec![format!("PYTHONPATH={}", python_path.join(":"))]),
            labels: Some(HashMap::from([(POOL_LABEL.to_string(), self.name.clone())])),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn start_runtime(&self, sb: &DockerSandbox) -> ForkliftResult<()> {
        self.docker
            .start_container(&sb.container, None::<StartContainerOptions>)
            .await
            .map_err(docker_err)?;

        let server = match sb.runtime {
            RuntimeKind::Python => "python3 -u /runtimes/python/server.py /host/bootstrap.py 1",
            RuntimeKind::Native => "/runtimes/native/server 1",
        };
        let cmd = format!(
            "exec {} {} >> /host/{} 2>&1",
            server, self.conf.features.enable_seccomp, RUNTIME_LOG
        );
        let exec = self
            .docker
            .create_exec(
                &sb.container,
                CreateExecOptions {
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), cmd]),
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(docker_err)?;
        self.docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(docker_err)?;

        wait_for_ready(&sb.scratch_dir).await
    }
}

/// Create `<scratch>/server_pipe`, replacing a stale one.
fn make_server_pipe(scratch_dir: &Path) -> ForkliftResult<PathBuf> {
    let pipe = scratch_dir.join(SERVER_PIPE);
    match std::fs::remove_file(&pipe) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(crate::error::ForkliftError::io("remove stale server pipe", e)),
    }
    nix::unistd::mkfifo(&pipe, Mode::from_bits_truncate(0o777)).map_err(|e| {
        crate::error::ForkliftError::Syscall {
            syscall: "mkfifo",
            message: format!("{}: {}", pipe.display(), e),
        }
    })?;
    Ok(pipe)
}

/// Wait for the runtime to write `ready` into the server pipe.
pub(crate) async fn wait_for_ready(scratch_dir: &Path) -> ForkliftResult<()> {
    let pipe_path = scratch_dir.join(SERVER_PIPE);
    // read-write so opening never blocks and EOF is never seen
    let mut pipe = tokio::net::unix::pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(&pipe_path)
        .map_err(|e| crate::error::ForkliftError::io("open server pipe", e))?;

    let mut buf = [0u8; 5];
    match tokio::time::timeout(READY_TIMEOUT, pipe.read_exact(&mut buf)).await {
        Err(_) => Err(SandboxError::NotReady {
            path: pipe_path,
            waited_ms: READY_TIMEOUT.as_millis() as u64,
        }
        .into()),
        Ok(Err(e)) => Err(crate::error::ForkliftError::io("read server pipe", e)),
        Ok(Ok(_)) if &buf == b"ready" => Ok(()),
        Ok(Ok(_)) => Err(SandboxError::Launch {
            reason: format!(
                "expected `ready` on server pipe, got {:?}",
                String::from_utf8_lossy(&buf)
            ),
        }
        .into()),
    }
}

#[async_trait]
impl SandboxPool for DockerPool {
    async fn create(
        &self,
        parent: Option<SandboxHandle>,
        is_leaf: bool,
        code_dir: Option<&Path>,
        scratch_dir: &Path,
        meta: Option<SandboxMeta>,
        runtime: RuntimeKind,
    ) -> ForkliftResult<SandboxHandle> {
        if parent.is_some() {
            return Err(SandboxError::Unsupported {
                backend: "docker",
                operation: "fork from a parent",
            }
            .into());
        }
        if !is_leaf {
            return Err(SandboxError::Unsupported {
                backend: "docker",
                operation: "non-leaf sandboxes",
            }
            .into());
        }
        let code_dir = code_dir.ok_or(SandboxError::LeafWithoutCode)?;

        let meta = meta.unwrap_or_default().with_defaults(&self.conf.limits);
        let id = next_sandbox_id();
        if runtime == RuntimeKind::Python {
            write_bootstrap(scratch_dir, &meta, true)?;
        }
        make_server_pipe(scratch_dir)?;

        let container = format!("forklift-{}-{}", self.name, id);
        let config = self.container_config(code_dir, scratch_dir, &meta);
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: Some(container.clone()),
                    platform: String::new(),
                }),
                config,
            )
            .await
            .map_err(docker_err)?;
        tracing::info!(pool = %self.name, sandbox_id = %id, container = %container, "Container created");

        let client = SandboxClient::unix(
            scratch_dir.join(SOCKET_NAME),
            Duration::from_secs(self.conf.limits.max_runtime_default),
        );
        let mut sb = DockerSandbox {
            id,
            runtime,
            meta,
            container,
            scratch_dir: scratch_dir.to_path_buf(),
            docker: self.docker.clone(),
            client,
        };

        if let Err(e) = self.start_runtime(&sb).await {
            sb.destroy(&format!("runtime start failed: {}", e)).await;
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
            "DOCKER POOL {}: image {}, {} live\n",
            self.name,
            self.conf.docker.base_image,
            self.handles.iter().filter(|e| e.value().strong_count() > 0).count()
        )
    }
}

struct DockerSandbox {
    id: SandboxId,
    runtime: RuntimeKind,
    meta: SandboxMeta,
    container: String,
    scratch_dir: PathBuf,
    docker: Docker,
    client: SandboxClient,
}

#[async_trait]
impl Sandbox for DockerSandbox {
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
        true
    }

    fn client(&self) -> SandboxClient {
        self.client.clone()
    }

    async fn pause(&mut self) -> ForkliftResult<()> {
        self.docker
            .pause_container(&self.container)
            .await
            .map_err(docker_err)?;
        self.client.close_idle_connections();
        Ok(())
    }

    async fn unpause(&mut self) -> ForkliftResult<()> {
        self.docker
            .unpause_container(&self.container)
            .await
            .map_err(docker_err)?;
        Ok(())
    }

    async fn destroy(&mut self, reason: &str) {
        tracing::info!(sandbox_id = %self.id, container = %self.container, reason = reason, "Removing container");
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self
            .docker
            .remove_container(&self.container, Some(options))
            .await
        {
            tracing::error!(sandbox_id = %self.id, container = %self.container, error = %e, "Could not remove container");
        }
    }

    async fn fork(&mut self, _dst: &ForkTarget) -> ForkliftResult<()> {
        Err(SandboxError::Unsupported {
            backend: "docker",
            operation: "fork",
        }
        .into())
    }

    async fn child_exit(&mut self, child: SandboxId) {
        tracing::error!(sandbox_id = %self.id, child = %child, "Docker sandbox cannot have children");
    }

    fn debug_string(&self) -> String {
        format!(
            "SANDBOX {} (DOCKER {})\nHOST DIR: {}\n",
            self.id,
            self.container,
            self.scratch_dir.display()
        )
    }

    fn runtime_log(&self) -> Option<String> {
        std::fs::read_to_string(self.scratch_dir.join(RUNTIME_LOG)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_server_pipe_ready() {
        let dir = tempfile::TempDir::new().unwrap();
        let pipe = make_server_pipe(dir.path()).unwrap();

        let writer = tokio::task::spawn_blocking(move || {
            let mut f = std::fs::OpenOptions::new().write(true).open(pipe).unwrap();
            f.write_all(b"ready").unwrap();
        });
        wait_for_ready(dir.path()).await.unwrap();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_pipe_garbage() {
        let dir = tempfile::TempDir::new().unwrap();
        let pipe = make_server_pipe(dir.path()).unwrap();
        // a stale pipe is replaced
        make_server_pipe(dir.path()).unwrap();

        let writer = tokio::task::spawn_blocking(move || {
            let mut f = std::fs::OpenOptions::new().write(true).open(pipe).unwrap();
            f.write_all(b"nope!").unwrap();
        });
        let err = wait_for_ready(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("nope!"));
        writer.await.unwrap();
    }
}
