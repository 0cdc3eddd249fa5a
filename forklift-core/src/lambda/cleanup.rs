// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Ordered background cleanup for one function.
//!
//! Items are processed strictly in queue order, so a directory queued
//! after a [`CleanupItem::Wait`] is removed only once that task is done.

use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::types::FunctionName;

#[derive(Debug)]
pub enum CleanupItem {
    /// Block until the task (usually a dying instance) has finished.
    Wait(JoinHandle<()>),
    /// Remove a directory tree.
    Remove(PathBuf),
}

pub struct CleanupQueue {
    tx: mpsc::UnboundedSender<CleanupItem>,
    task: JoinHandle<()>,
}

impl CleanupQueue {
    pub fn spawn(function: FunctionName) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<CleanupItem>();
        let task = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    CleanupItem::Wait(handle) => {
                        if let Err(e) = handle.await {
                            tracing::warn!(function = %function, error = %e, "Instance task failed");
                        }
                    }
                    CleanupItem::Remove(dir) => {
                        tracing::debug!(function = %function, dir = %dir.display(), "Removing old code");
                        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                            if e.kind() != std::io::ErrorKind::NotFound {
                                tracing::warn!(
                                    function = %function,
                                    dir = %dir.display(),
                                    error = %e,
                                    "Could not remove directory"
                                );
                            }
                        }
                    }
                }
            }
        });
        Self { tx, task }
    }

    pub fn push(&self, item: CleanupItem) {
        // the consumer only stops after close(), which takes self
        let _ = self.tx.send(item);
    }

    /// Stop accepting items and wait until everything queued is done.
    pub async fn close(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}
