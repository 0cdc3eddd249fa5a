// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Per-function task: code freshness, admission and instance scaling.
//!
//! All mutable state of a function lives inside its task and is reached
//! only through channels. [`LambdaFunc`] is the cloneable front of it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;

use super::autoscaler::{Autoscaler, ScaleStep, ScalingPolicy};
use super::cleanup::{CleanupItem, CleanupQueue};
use super::instance::{Instance, InstanceEvent, InstanceHandle, InstanceQueue};
use super::{error_response, Invocation, LambdaShared};
use crate::error::{ForkliftError, ForkliftResult};
use crate::packages::normalize_pkg;
use crate::sandbox::SandboxMeta;
use crate::stats::{FunctionStats, RollingAvg};
use crate::types::{FunctionName, RuntimeKind};

/// Bound of both the admission queue and the instance queue.
pub const QUEUE_DEPTH: usize = 32;

const EXEC_WINDOW: usize = 10;

#[derive(Debug, Default)]
struct Counters {
    instances: AtomicUsize,
    outstanding: AtomicUsize,
    avg_exec_ms: AtomicU64,
    invocations: AtomicU64,
    rejected: AtomicU64,
}

/// Handle to a running function task.
pub struct LambdaFunc {
    name: FunctionName,
    func_tx: mpsc::Sender<Invocation>,
    kill_tx: mpsc::Sender<oneshot::Sender<()>>,
    counters: Arc<Counters>,
}

impl LambdaFunc {
    pub(crate) fn spawn(name: FunctionName, shared: Arc<LambdaShared>) -> Self {
        let (func_tx, func_rx) = mpsc::channel(QUEUE_DEPTH);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        let (inst_tx, inst_rx) = mpsc::channel(QUEUE_DEPTH);
        // Unbounded: an instance must never block reporting back while the
        // function task is blocked waiting for it to die.
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());

        let task = FunctionTask {
            name: name.clone(),
            cleanup: CleanupQueue::spawn(name.clone()),
            shared,
            counters: counters.clone(),
            func_rx,
            kill_rx,
            inst_tx,
            inst_rx: Arc::new(Mutex::new(inst_rx)),
            done_tx,
            done_rx,
            code: None,
            last_pull: None,
            instances: Vec::new(),
            next_instance: 0,
            exec_ms: RollingAvg::new(EXEC_WINDOW),
            outstanding: 0,
            scaler: Autoscaler::new(ScalingPolicy::default()),
            timer: None,
        };
        tokio::spawn(task.run());

        tracing::info!(function = %name, "Function task started");
        Self {
            name,
            func_tx,
            kill_tx,
            counters,
        }
    }

    pub fn name(&self) -> &FunctionName {
        &self.name
    }

    /// Queue `req` and wait for its response. A full queue is answered with
    /// 429 without reaching the task.
    pub async fn invoke(&self, req: Request<Bytes>) -> Response<Bytes> {
        let (done, rx) = oneshot::channel();
        let inv = Invocation {
            request: Some(req),
            response: None,
            exec_ms: 0,
            done,
        };

        match self.func_tx.try_send(inv) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "lambda function queue is full",
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "lambda function is shutting down",
                );
            }
        }

        rx.await.unwrap_or_else(|_| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "lambda instance dropped the request",
            )
        })
    }

    /// Stop every instance and wait for queued cleanup to finish.
    pub async fn kill(&self) {
        let (tx, rx) = oneshot::channel();
        if self.kill_tx.send(tx).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn stats(&self) -> FunctionStats {
        FunctionStats {
            instances: self.counters.instances.load(Ordering::Relaxed),
            outstanding: self.counters.outstanding.load(Ordering::Relaxed),
            avg_exec_ms: self.counters.avg_exec_ms.load(Ordering::Relaxed),
            invocations: self.counters.invocations.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

/// The code an instance runs.
#[derive(Debug, Clone)]
struct FunctionCode {
    dir: PathBuf,
    runtime: RuntimeKind,
    meta: SandboxMeta,
}

enum Event {
    Tick,
    Request(Invocation),
    Instance(InstanceEvent),
    Kill(Option<oneshot::Sender<()>>),
}

struct FunctionTask {
    name: FunctionName,
    shared: Arc<LambdaShared>,
    counters: Arc<Counters>,
    cleanup: CleanupQueue,

    func_rx: mpsc::Receiver<Invocation>,
    kill_rx: mpsc::Receiver<oneshot::Sender<()>>,
    inst_tx: mpsc::Sender<Invocation>,
    inst_rx: InstanceQueue,
    done_tx: mpsc::UnboundedSender<InstanceEvent>,
    done_rx: mpsc::UnboundedReceiver<InstanceEvent>,

    code: Option<FunctionCode>,
    last_pull: Option<Instant>,
    instances: Vec<InstanceHandle>,
    next_instance: u64,
    exec_ms: RollingAvg,
    outstanding: usize,
    scaler: Autoscaler,
    timer: Option<Instant>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl FunctionTask {
    async fn run(mut self) {
        loop {
            let deadline = self.timer;
            let event = tokio::select! {
                _ = sleep_until_opt(deadline) => Event::Tick,
                reply = self.kill_rx.recv() => Event::Kill(reply),
                Some(event) = self.done_rx.recv() => Event::Instance(event),
                inv = self.func_rx.recv() => match inv {
                    Some(inv) => Event::Request(inv),
                    None => Event::Kill(None),
                },
            };

            match event {
                Event::Tick => self.timer = None,
                Event::Request(inv) => self.admit(inv).await,
                Event::Instance(InstanceEvent::Done(inv)) => self.finish(inv),
                Event::Instance(InstanceEvent::Exited(id)) => {
                    // requests still queued need a live instance to serve them
                    self.instances.retain(|inst| inst.id() != id);
                }
                Event::Kill(reply) => {
                    self.shutdown().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    return;
                }
            }

            self.autoscale();
        }
    }

    async fn admit(&mut self, inv: Invocation) {
        self.counters.invocations.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.refresh_code().await {
            tracing::warn!(function = %self.name, error = %e, "Could not pull handler");
            inv.reply(error_response(StatusCode::INTERNAL_SERVER_ERROR, &e));
            return;
        }
        if let (Some(tracer), Some(code)) = (&self.shared.tracer, &self.code) {
            tracer.trace_invocation(&code.dir);
        }

        match self.inst_tx.try_send(inv) {
            Ok(()) => {
                self.outstanding += 1;
                self.counters
                    .outstanding
                    .store(self.outstanding, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(inv))
            | Err(mpsc::error::TrySendError::Closed(inv)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                inv.reply(error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "lambda instance queue is full",
                ));
            }
        }
    }

    fn finish(&mut self, inv: Invocation) {
        self.exec_ms.add(inv.exec_ms);
        self.outstanding = self.outstanding.saturating_sub(1);
        self.counters
            .outstanding
            .store(self.outstanding, Ordering::Relaxed);
        self.counters
            .avg_exec_ms
            .store(self.exec_ms.avg(), Ordering::Relaxed);

        inv.complete();
    }

    /// Pull the handler when the cached copy is older than the freshness
    /// window, and switch instances over when the code changed.
    async fn refresh_code(&mut self) -> ForkliftResult<()> {
        let window = Duration::from_millis(self.shared.conf.registry_cache_ms);
        if let (Some(last), Some(_)) = (self.last_pull, &self.code) {
            if last.elapsed() < window {
                return Ok(());
            }
        }

        let (runtime, dir) = self.shared.handlers.pull(self.name.as_str()).await?;
        if self.code.as_ref().map(|c| &c.dir) != Some(&dir) {
            let meta = match self.install_packages(&dir).await {
                Ok(meta) => meta,
                Err(e) => {
                    let _ = tokio::fs::remove_dir_all(&dir).await;
                    self.shared.handlers.reset(self.name.as_str());
                    return Err(e);
                }
            };

            tracing::info!(function = %self.name, dir = %dir.display(), runtime = %runtime, "New code");
            for inst in self.instances.drain(..) {
                self.cleanup.push(CleanupItem::Wait(inst.kill()));
            }
            self.counters.instances.store(0, Ordering::Relaxed);

            let old = self.code.replace(FunctionCode { dir, runtime, meta });
            if let Some(old) = old {
                self.cleanup.push(CleanupItem::Remove(old.dir));
            }
        }

        self.last_pull = Some(Instant::now());
        Ok(())
    }

    async fn install_packages(&self, dir: &Path) -> ForkliftResult<SandboxMeta> {
        let direct = function_packages(dir).await?;
        let installs = self.shared.packages.install_recursive(&direct).await?;
        if let Some(tracer) = &self.shared.tracer {
            tracer.trace_function(dir, &direct);
        }

        Ok(SandboxMeta {
            installs,
            ..Default::default()
        }
        .with_defaults(&self.shared.conf.limits))
    }

    fn autoscale(&mut self) {
        self.instances.retain(|inst| !inst.is_finished());
        let Some(code) = &self.code else {
            self.counters.instances.store(0, Ordering::Relaxed);
            return;
        };

        let now = Instant::now();
        let desired = self.scaler.desired(self.outstanding, self.exec_ms.avg());
        match self.scaler.step(self.instances.len(), desired, now) {
            ScaleStep::Steady => {}
            ScaleStep::WaitUntil(at) => self.timer = Some(at),
            ScaleStep::Grow => {
                self.next_instance += 1;
                let inst = Instance::spawn(
                    self.next_instance,
                    self.name.clone(),
                    code.runtime,
                    code.dir.clone(),
                    code.meta.clone(),
                    self.shared.clone(),
                    self.inst_rx.clone(),
                    self.done_tx.clone(),
                );
                self.instances.push(inst);
                tracing::debug!(function = %self.name, instances = self.instances.len(), desired, "Scaled up");
            }
            ScaleStep::Shrink => {
                if let Some(inst) = self.instances.pop() {
                    self.cleanup.push(CleanupItem::Wait(inst.kill()));
                }
                tracing::debug!(function = %self.name, instances = self.instances.len(), desired, "Scaled down");
            }
        }

        if self.instances.len() != desired {
            self.timer = Some(self.scaler.next_window(now));
        }
        self.counters
            .instances
            .store(self.instances.len(), Ordering::Relaxed);
    }

    async fn shutdown(self) {
        tracing::info!(function = %self.name, instances = self.instances.len(), "Stopping function");
        for inst in self.instances {
            self.cleanup.push(CleanupItem::Wait(inst.kill()));
        }
        self.counters.instances.store(0, Ordering::Relaxed);
        self.cleanup.close().await;
    }
}

/// Direct package requirements of the handler in `dir`: `requirements.txt`
/// lines plus `# ol-install: a, b` comments in `f.py`.
pub(crate) async fn function_packages(dir: &Path) -> ForkliftResult<Vec<String>> {
    let mut pkgs: Vec<String> = Vec::new();
    let mut add = |raw: &str| {
        let pkg = raw.split('#').next().unwrap_or("");
        let pkg = pkg.split(';').next().unwrap_or("");
        let pkg: String = pkg.chars().filter(|c| !c.is_whitespace()).collect();
        if !pkg.is_empty() && !pkg.starts_with('-') {
            let pkg = normalize_pkg(&pkg);
            if !pkgs.contains(&pkg) {
                pkgs.push(pkg);
            }
        }
    };

    match tokio::fs::read_to_string(dir.join("requirements.txt")).await {
        Ok(content) => content.lines().for_each(&mut add),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(ForkliftError::io("reading requirements.txt", e)),
    }

    match tokio::fs::read_to_string(dir.join("f.py")).await {
        Ok(content) => {
            for line in content.lines() {
                if let Some(list) = line.trim().strip_prefix("# ol-install:") {
                    list.split(',').for_each(&mut add);
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(ForkliftError::io("reading f.py", e)),
    }

    Ok(pkgs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_function_packages() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("requirements.txt"),
            "# pinned\nRequests==2.31.0\n\nPyYAML ; python_version > '3'\n-r other.txt\nsix  # inline\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("f.py"),
            "# ol-install: numpy, six, typing_extensions\nimport numpy\n\ndef f(event):\n    return event\n",
        )
        .unwrap();

        let pkgs = function_packages(dir.path()).await.unwrap();
        assert_eq!(
            pkgs,
            vec!["requests==2.31.0", "pyyaml", "six", "numpy", "typing-extensions"]
        );
    }

    #[tokio::test]
    async fn test_function_packages_none_declared() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.bin"), b"\x7fELF").unwrap();
        assert!(function_packages(dir.path()).await.unwrap().is_empty());
    }
}
