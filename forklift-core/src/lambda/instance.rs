// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! One instance of a function: a task owning at most one leaf sandbox.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use http::StatusCode;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use super::{error_response, Invocation, LambdaShared};
use crate::error::ForkliftResult;
use crate::sandbox::{SandboxHandle, SandboxMeta};
use crate::types::{FunctionName, RuntimeKind};

/// Queue shared by every instance of one function.
pub(crate) type InstanceQueue = Arc<Mutex<mpsc::Receiver<Invocation>>>;

/// What an instance reports back to its function task.
pub(crate) enum InstanceEvent {
    Done(Invocation),
    /// Sent once the instance's sandbox is destroyed, whatever ended it.
    Exited(u64),
}

/// The function task's grip on a running instance.
pub(crate) struct InstanceHandle {
    id: u64,
    kill_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl InstanceHandle {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Ask the instance to stop after its current request. The returned
    /// handle resolves once the sandbox is gone.
    pub(crate) fn kill(self) -> JoinHandle<()> {
        let _ = self.kill_tx.send(());
        self.join
    }

    /// True once the instance exited on its own, e.g. after a sandbox error.
    pub(crate) fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

pub(crate) struct Instance {
    id: u64,
    function: FunctionName,
    runtime: RuntimeKind,
    code_dir: PathBuf,
    meta: SandboxMeta,
    shared: Arc<LambdaShared>,
    queue: InstanceQueue,
    events: mpsc::UnboundedSender<InstanceEvent>,
}

impl Instance {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: u64,
        function: FunctionName,
        runtime: RuntimeKind,
        code_dir: PathBuf,
        meta: SandboxMeta,
        shared: Arc<LambdaShared>,
        queue: InstanceQueue,
        events: mpsc::UnboundedSender<InstanceEvent>,
    ) -> InstanceHandle {
        let (kill_tx, kill_rx) = oneshot::channel();
        let instance = Self {
            id,
            function,
            runtime,
            code_dir,
            meta,
            shared,
            queue,
            events,
        };
        let join = tokio::spawn(instance.run(kill_rx));
        InstanceHandle { id, kill_tx, join }
    }

    async fn run(self, mut kill_rx: oneshot::Receiver<()>) {
        let mut sandbox: Option<SandboxHandle> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = &mut kill_rx => None,
                inv = async { self.queue.lock().await.recv().await } => inv,
            };
            let Some(mut inv) = next else {
                break;
            };

            let sb = match &sandbox {
                Some(sb) => sb.clone(),
                None => match self.create_sandbox().await {
                    Ok(sb) => {
                        sandbox = Some(sb.clone());
                        sb
                    }
                    Err(e) => {
                        tracing::warn!(function = %self.function, error = %e, "Could not create sandbox");
                        inv.response = Some(error_response(StatusCode::INTERNAL_SERVER_ERROR, &e));
                        let _ = self.events.send(InstanceEvent::Done(inv));
                        break;
                    }
                },
            };

            let Some(request) = inv.request.take() else {
                let _ = self.events.send(InstanceEvent::Done(inv));
                continue;
            };
            let start = Instant::now();
            let result = sb.client().round_trip(request).await;
            inv.exec_ms = start.elapsed().as_millis() as u64;
            if self.shared.conf.trace.latency {
                tracing::debug!(
                    function = %self.function,
                    sandbox_id = %sb.id(),
                    exec_ms = inv.exec_ms,
                    "Invocation finished"
                );
            }

            let healthy = result.is_ok();
            inv.response = Some(match result {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!(
                        function = %self.function,
                        sandbox_id = %sb.id(),
                        error = %e,
                        "Invocation failed, retiring instance"
                    );
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, &e)
                }
            });
            let _ = self.events.send(InstanceEvent::Done(inv));
            if !healthy {
                break;
            }
        }

        if let Some(sb) = sandbox {
            if self.shared.conf.log_output {
                if let Some(log) = sb.runtime_log().await {
                    tracing::info!(function = %self.function, sandbox_id = %sb.id(), log = %log, "Runtime output");
                }
            }
            sb.destroy("function instance stopped").await;
        }
        // the function task may already be gone
        let _ = self.events.send(InstanceEvent::Exited(self.id));
    }

    /// Fork from the import cache when one exists and can host the runtime.
    async fn create_sandbox(&self) -> ForkliftResult<SandboxHandle> {
        let scratch_dir = self.shared.scratch_dirs.make(self.function.as_str())?;
        let pool = self.shared.pool.as_ref();

        match (&self.shared.zygotes, self.runtime) {
            (Some(zygotes), RuntimeKind::Python) => {
                zygotes
                    .create(
                        pool,
                        true,
                        Some(&self.code_dir),
                        &scratch_dir,
                        self.meta.clone(),
                        self.runtime,
                    )
                    .await
            }
            _ => {
                pool.create(
                    None,
                    true,
                    Some(&self.code_dir),
                    &scratch_dir,
                    Some(self.meta.clone()),
                    self.runtime,
                )
                .await
            }
        }
    }
}
