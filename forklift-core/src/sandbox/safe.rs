// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Serializing, self-destructing envelope around a backend sandbox.
//!
//! Contracts:
//! - mutating calls run one at a time under a single lock;
//! - the first error from the backend destroys the sandbox, and every later
//!   mutating call returns a dead-sandbox error;
//! - pausing a paused sandbox (or unpausing a running one) is a silent no-op;
//! - `Unpause` is published before the backend call and `Pause` after it, so
//!   observers never see a sandbox as idle while it can still run.

use std::sync::{Arc, Weak};

use tokio::sync::Mutex;

use super::{
    EventListener, EventType, ForkTarget, Sandbox, SandboxClient, SandboxMeta, SandboxState,
    SandboxStateMachine,
};
use crate::error::{ForkliftError, ForkliftResult, SandboxError};
use crate::types::{RuntimeKind, SandboxId};

struct Guarded {
    sb: Box<dyn Sandbox>,
    machine: SandboxStateMachine,
    dead: Option<String>,
    listeners: Vec<EventListener>,
}

/// Thread-safe sandbox handle. Always used behind an `Arc`.
pub struct SafeSandbox {
    id: SandboxId,
    runtime: RuntimeKind,
    is_leaf: bool,
    meta: SandboxMeta,
    client: SandboxClient,
    this: Weak<SafeSandbox>,
    guarded: Mutex<Guarded>,
}

impl std::fmt::Debug for SafeSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeSandbox")
            .field("id", &self.id)
            .field("runtime", &self.runtime)
            .field("is_leaf", &self.is_leaf)
            .finish_non_exhaustive()
    }
}

impl SafeSandbox {
    /// Wrap a fully set up backend sandbox. Nothing is published until
    /// [`SafeSandbox::start_notifying_listeners`].
    pub fn new(sb: Box<dyn Sandbox>) -> Arc<Self> {
        let id = sb.id();
        Arc::new_cyclic(|this| Self {
            id,
            runtime: sb.runtime(),
            is_leaf: sb.is_leaf(),
            meta: sb.meta().clone(),
            client: sb.client(),
            this: this.clone(),
            guarded: Mutex::new(Guarded {
                sb,
                machine: SandboxStateMachine::new(id),
                dead: None,
                listeners: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> SandboxId {
        self.id
    }

    pub fn runtime(&self) -> RuntimeKind {
        self.runtime
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    pub fn meta(&self) -> &SandboxMeta {
        &self.meta
    }

    /// Not serialized; the client is safe to share.
    pub fn client(&self) -> SandboxClient {
        self.client.clone()
    }

    /// Install the listeners and publish `Create`.
    pub async fn start_notifying_listeners(&self, listeners: Vec<EventListener>) {
        let mut g = self.guarded.lock().await;
        g.listeners = listeners;
        if let Err(e) = g.machine.transition_to(SandboxState::Running) {
            tracing::error!(sandbox_id = %self.id, error = %e, "Sandbox published twice");
            return;
        }
        self.event(&g, EventType::Create);
    }

    pub async fn destroy(&self, reason: &str) {
        let mut g = self.guarded.lock().await;
        if g.dead.is_some() {
            return;
        }
        let state = if g.machine.is_paused() {
            "paused"
        } else {
            "unpaused"
        };
        self.destroy_locked(
            &mut g,
            reason,
            format!("destroyed by Destroy({}) while {}", reason, state),
        )
        .await;
    }

    /// Destroy only if currently paused; otherwise publish `DestroyIgnored`.
    pub async fn destroy_if_paused(&self, reason: &str) {
        let mut g = self.guarded.lock().await;
        if g.dead.is_some() {
            return;
        }
        if g.machine.is_paused() {
            self.destroy_locked(
                &mut g,
                reason,
                format!("destroyed by DestroyIfPaused({})", reason),
            )
            .await;
        } else {
            self.event(&g, EventType::DestroyIgnored);
        }
    }

    pub async fn pause(&self) -> ForkliftResult<()> {
        let mut g = self.guarded.lock().await;
        self.check_alive(&g)?;
        if g.machine.is_paused() {
            return Ok(());
        }

        if let Err(e) = g.sb.pause().await {
            self.destroy_on_err(&mut g, "pause", &e).await;
            return Err(e);
        }
        g.machine.transition_to(SandboxState::Paused)?;
        self.event(&g, EventType::Pause);
        Ok(())
    }

    pub async fn unpause(&self) -> ForkliftResult<()> {
        let mut g = self.guarded.lock().await;
        self.check_alive(&g)?;
        if !g.machine.is_paused() {
            return Ok(());
        }

        self.event(&g, EventType::Unpause);
        if let Err(e) = g.sb.unpause().await {
            self.destroy_on_err(&mut g, "unpause", &e).await;
            return Err(e);
        }
        g.machine.transition_to(SandboxState::Running)?;
        Ok(())
    }

    /// Fork this sandbox's runtime into `dst`. Errors (including
    /// [`SandboxError::ForkFailed`]) are returned unchanged after the parent
    /// has been destroyed.
    pub async fn fork(&self, dst: &ForkTarget) -> ForkliftResult<()> {
        let mut g = self.guarded.lock().await;
        self.check_alive(&g)?;

        if let Err(e) = g.sb.fork(dst).await {
            self.destroy_on_err(&mut g, "fork", &e).await;
            return Err(e);
        }
        self.event(&g, EventType::Fork);
        Ok(())
    }

    /// A forked child was torn down.
    ///
    /// Delivered even after this sandbox died, so the backend can finish
    /// its own teardown once the last descendant is gone.
    pub async fn child_exit(&self, child: SandboxId) {
        let mut g = self.guarded.lock().await;
        g.sb.child_exit(child).await;
        if g.dead.is_none() {
            self.event(&g, EventType::ChildExit);
        }
    }

    pub async fn is_paused(&self) -> bool {
        self.guarded.lock().await.machine.is_paused()
    }

    pub async fn is_dead(&self) -> bool {
        self.guarded.lock().await.dead.is_some()
    }

    pub async fn state(&self) -> SandboxState {
        self.guarded.lock().await.machine.state()
    }

    pub async fn runtime_log(&self) -> Option<String> {
        self.guarded.lock().await.sb.runtime_log()
    }

    pub async fn debug_string(&self) -> String {
        let g = self.guarded.lock().await;
        match &g.dead {
            Some(reason) => format!("SANDBOX {} is DEAD: {}\n", self.id, reason),
            None => g.sb.debug_string(),
        }
    }

    fn check_alive(&self, g: &Guarded) -> ForkliftResult<()> {
        match &g.dead {
            Some(reason) => Err(SandboxError::Dead {
                id: self.id,
                reason: reason.clone(),
            }
            .into()),
            None => Ok(()),
        }
    }

    async fn destroy_on_err(&self, g: &mut Guarded, op: &str, err: &ForkliftError) {
        tracing::warn!(sandbox_id = %self.id, operation = op, error = %err, "Destroying sandbox after error");
        let reason = format!("{} failed", op);
        self.destroy_locked(g, &reason, format!("{} failed: {}", op, err))
            .await;
    }

    async fn destroy_locked(&self, g: &mut Guarded, reason: &str, dead: String) {
        g.sb.destroy(reason).await;
        g.dead = Some(dead);
        if let Err(e) = g.machine.transition_to(SandboxState::Destroyed) {
            tracing::error!(sandbox_id = %self.id, error = %e, "Unexpected state on destroy");
        }
        self.event(g, EventType::Destroy);
    }

    fn event(&self, g: &Guarded, event: EventType) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        for listener in &g.listeners {
            listener(event, &this);
        }
    }
}
