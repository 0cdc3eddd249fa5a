// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Live-sandbox registry for the `/debug` endpoint.

use std::collections::BTreeMap;

use tokio::sync::{mpsc, oneshot};

use super::{EventType, SandboxHandle, SandboxPool};
use crate::types::SandboxId;

enum DebugMsg {
    Event(EventType, SandboxHandle),
    Dump(oneshot::Sender<Vec<SandboxHandle>>),
}

/// Tracks every live sandbox of a pool from its events.
#[derive(Clone)]
pub struct Debugger {
    tx: mpsc::UnboundedSender<DebugMsg>,
}

impl Debugger {
    /// Subscribe to `pool` and start the bookkeeping task.
    pub fn attach(pool: &dyn SandboxPool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(track(rx));

        let events = tx.clone();
        pool.add_listener(std::sync::Arc::new(
            move |event: EventType, sb: &SandboxHandle| {
                let _ = events.send(DebugMsg::Event(event, sb.clone()));
            },
        ));

        Self { tx }
    }

    /// Debug strings of every live sandbox, in creation order.
    pub async fn dump(&self) -> String {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(DebugMsg::Dump(reply)).is_err() {
            return "sandbox debugger stopped\n".to_string();
        }
        let Ok(sandboxes) = rx.await else {
            return "sandbox debugger stopped\n".to_string();
        };

        let mut out = String::new();
        for sb in sandboxes {
            out.push_str(&sb.debug_string().await);
            out.push('\n');
        }
        out
    }
}

async fn track(mut rx: mpsc::UnboundedReceiver<DebugMsg>) {
    let mut live: BTreeMap<SandboxId, SandboxHandle> = BTreeMap::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            DebugMsg::Event(EventType::Create, sb) => {
                live.insert(sb.id(), sb);
            }
            DebugMsg::Event(EventType::Destroy, sb) => {
                live.remove(&sb.id());
            }
            DebugMsg::Event(_, _) => {}
            DebugMsg::Dump(reply) => {
                let _ = reply.send(live.values().cloned().collect());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::mock::MockPool;
    use crate::types::RuntimeKind;

    #[tokio::test]
    async fn test_dump_lists_live_sandboxes() {
        let pool = MockPool::new(500);
        let debugger = Debugger::attach(&pool);
        let dir = tempfile::TempDir::new().unwrap();

        let a = pool
            .create(None, false, None, dir.path(), None, RuntimeKind::Python)
            .await
            .unwrap();
        let b = pool
            .create(None, false, None, dir.path(), None, RuntimeKind::Python)
            .await
            .unwrap();
        b.destroy("test").await;

        let dump = debugger.dump().await;
        assert!(dump.contains(&format!("MOCK {}", a.id())));
        assert!(!dump.contains(&format!("MOCK {}\n", b.id())));
    }
}
