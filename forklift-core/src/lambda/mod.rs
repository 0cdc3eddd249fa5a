// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Function scheduling.
//!
//! [`LambdaManager`] is the worker's entry point: it owns the sandbox pool,
//! the pullers and the import cache, and runs one task per function name.
//! Each function task keeps its code fresh, admits invocations into a
//! bounded queue and scales a set of instance tasks that serve them.

mod autoscaler;
mod cleanup;
mod function;
mod handler_puller;
mod instance;

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use http::{Request, Response, StatusCode};
use tokio::sync::oneshot;

pub use autoscaler::{Autoscaler, ScaleStep, ScalingPolicy};
pub use cleanup::{CleanupItem, CleanupQueue};
pub use function::{LambdaFunc, QUEUE_DEPTH};
pub use handler_puller::HandlerPuller;

use crate::config::WorkerConfig;
use crate::error::ForkliftResult;
use crate::packages::{DepTracer, PackagePuller};
use crate::sandbox::{pool_from_config, Debugger, EventListener, EventType, SandboxPool};
use crate::stats::{MemPoolStats, WorkerStats};
use crate::storage::DirMaker;
use crate::types::FunctionName;
use crate::zygote::{provider_from_config, ZygoteProvider};

/// One request travelling from the front door to an instance and back.
pub struct Invocation {
    pub(crate) request: Option<Request<Bytes>>,
    pub(crate) response: Option<Response<Bytes>>,
    /// Time spent inside the sandbox.
    pub(crate) exec_ms: u64,
    done: oneshot::Sender<Response<Bytes>>,
}

impl Invocation {
    pub(crate) fn reply(self, resp: Response<Bytes>) {
        let _ = self.done.send(resp);
    }

    /// Release the caller with whatever the instance recorded.
    pub(crate) fn complete(mut self) {
        let resp = self.response.take().unwrap_or_else(|| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "lambda instance sent no response",
            )
        });
        self.reply(resp);
    }
}

/// Plain-text error response with a trailing newline.
pub fn error_response(status: StatusCode, msg: impl fmt::Display) -> Response<Bytes> {
    let mut resp = Response::new(Bytes::from(format!("{}\n", msg)));
    *resp.status_mut() = status;
    resp
}

/// Everything function and instance tasks need from the worker.
pub(crate) struct LambdaShared {
    pub(crate) conf: Arc<WorkerConfig>,
    pub(crate) pool: Arc<dyn SandboxPool>,
    pub(crate) zygotes: Option<Arc<dyn ZygoteProvider>>,
    pub(crate) handlers: HandlerPuller,
    pub(crate) packages: Arc<PackagePuller>,
    pub(crate) tracer: Option<Arc<DepTracer>>,
    pub(crate) scratch_dirs: Arc<DirMaker>,
}

pub struct LambdaManager {
    shared: Arc<LambdaShared>,
    code_dirs: Arc<DirMaker>,
    functions: DashMap<String, Arc<LambdaFunc>>,
    debugger: Debugger,
    live_sandboxes: Arc<AtomicI64>,
}

impl LambdaManager {
    /// Build the worker from its configuration, with the sandbox backend
    /// named there.
    pub async fn new(conf: Arc<WorkerConfig>) -> ForkliftResult<Self> {
        let (code_dirs, scratch_dirs) = Self::dir_makers(&conf)?;
        let (pool, debugger) = pool_from_config(conf.clone(), "sandboxes").await?;
        Self::assemble(conf, pool, debugger, code_dirs, scratch_dirs).await
    }

    /// Build the worker on top of an existing pool.
    pub async fn with_pool(
        conf: Arc<WorkerConfig>,
        pool: Arc<dyn SandboxPool>,
    ) -> ForkliftResult<Self> {
        let (code_dirs, scratch_dirs) = Self::dir_makers(&conf)?;
        let debugger = Debugger::attach(pool.as_ref());
        Self::assemble(conf, pool, debugger, code_dirs, scratch_dirs).await
    }

    fn dir_makers(conf: &WorkerConfig) -> ForkliftResult<(Arc<DirMaker>, Arc<DirMaker>)> {
        let code = DirMaker::new(&conf.worker_dir, "code", conf.storage.code.mode)?;
        let scratch = DirMaker::new(&conf.worker_dir, "scratch", conf.storage.scratch.mode)?;
        Ok((Arc::new(code), Arc::new(scratch)))
    }

    async fn assemble(
        conf: Arc<WorkerConfig>,
        pool: Arc<dyn SandboxPool>,
        debugger: Debugger,
        code_dirs: Arc<DirMaker>,
        scratch_dirs: Arc<DirMaker>,
    ) -> ForkliftResult<Self> {
        let live_sandboxes = Arc::new(AtomicI64::new(0));
        let live = live_sandboxes.clone();
        let listener: EventListener = Arc::new(move |event, _sb| match event {
            EventType::Create => {
                live.fetch_add(1, Ordering::Relaxed);
            }
            EventType::Destroy => {
                live.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        });
        pool.add_listener(listener);

        let tracer = Arc::new(DepTracer::open(conf.worker_dir.join("dep-trace.json")).await?);
        let packages = Arc::new(PackagePuller::new(pool.clone(), Some(tracer.clone()), &conf)?);
        let zygotes = provider_from_config(
            &conf,
            pool.clone(),
            packages.clone(),
            code_dirs.clone(),
            scratch_dirs.clone(),
        )?;
        if conf.features.warmup {
            if let Some(zygotes) = &zygotes {
                tracing::info!("Warming up import cache");
                zygotes.warmup().await?;
            }
        }

        let handlers = HandlerPuller::new(&conf.registry, code_dirs.clone());
        tracing::info!(
            registry = %conf.registry,
            import_cache = zygotes.is_some(),
            "Lambda manager ready"
        );

        Ok(Self {
            shared: Arc::new(LambdaShared {
                conf,
                pool,
                zygotes,
                handlers,
                packages,
                tracer: Some(tracer),
                scratch_dirs,
            }),
            code_dirs,
            functions: DashMap::new(),
            debugger,
            live_sandboxes,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.shared.conf
    }

    /// Forward sandbox lifecycle events to `listener` as well.
    pub fn add_sandbox_listener(&self, listener: EventListener) {
        self.shared.pool.add_listener(listener);
    }

    /// Resolves with the reason once the sandbox backend raises a failure
    /// the worker must not keep running after. Never resolves for backends
    /// without one.
    pub async fn fatal(&self) -> String {
        match self.shared.pool.fatal() {
            Some(fatal) => fatal.raised().await,
            None => std::future::pending().await,
        }
    }

    /// Handle for `name`, starting its task on first use.
    pub fn get(&self, name: &FunctionName) -> Arc<LambdaFunc> {
        if let Some(func) = self.functions.get(name.as_str()) {
            return func.clone();
        }
        self.functions
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(LambdaFunc::spawn(name.clone(), self.shared.clone())))
            .clone()
    }

    pub async fn invoke(&self, name: &str, req: Request<Bytes>) -> Response<Bytes> {
        let name = match FunctionName::new(name) {
            Ok(name) => name,
            Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
        };
        self.get(&name).invoke(req).await
    }

    pub fn stats(&self) -> WorkerStats {
        let functions = self
            .functions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect();
        let mem_pool = self.shared.pool.mem_pool().map(|mem| MemPoolStats {
            name: mem.name().to_string(),
            total_mb: mem.total_mb(),
            available_mb: mem.available_mb(),
        });
        let zygotes = self
            .shared
            .zygotes
            .as_ref()
            .map(|z| z.stats())
            .unwrap_or_default();

        WorkerStats {
            functions,
            mem_pool,
            live_sandboxes: self.live_sandboxes.load(Ordering::Relaxed),
            zygotes,
        }
    }

    pub async fn debug_string(&self) -> String {
        let mut out = self.debugger.dump().await;
        if let Some(zygotes) = &self.shared.zygotes {
            out.push_str("\nIMPORT CACHE\n");
            out.push_str(&zygotes.dump());
        }
        out
    }

    /// Stop every function, then tear down the import cache, the pool and
    /// the tracer in that order.
    pub async fn cleanup(&self) {
        let functions: Vec<Arc<LambdaFunc>> =
            self.functions.iter().map(|e| e.value().clone()).collect();
        tracing::info!(functions = functions.len(), "Stopping functions");
        futures_util::future::join_all(functions.iter().map(|f| f.kill())).await;
        self.functions.clear();

        if let Some(zygotes) = &self.shared.zygotes {
            zygotes.cleanup().await;
        }
        self.shared.pool.cleanup().await;
        if let Some(tracer) = &self.shared.tracer {
            tracer.cleanup().await;
        }

        for dirs in [&self.code_dirs, &self.shared.scratch_dirs] {
            if let Err(e) = dirs.cleanup() {
                tracing::warn!(dir = %dirs.prefix().display(), error = %e, "Could not clean directory");
            }
        }
        tracing::info!("Lambda manager stopped");
    }
}
