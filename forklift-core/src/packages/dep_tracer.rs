// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Append-only audit log of package and function dependencies.
//!
//! Records are JSON lines written by a background task so callers never
//! wait on the disk.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{ForkliftError, ForkliftResult};

/// One line of `dep-trace.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TraceRecord {
    Package {
        name: String,
        deps: Vec<String>,
        top: Vec<String>,
    },
    Function {
        name: String,
        deps: Vec<String>,
    },
    Invocation {
        name: String,
    },
}

pub struct DepTracer {
    path: PathBuf,
    tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<TraceRecord>>>,
    writer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DepTracer {
    /// Open (or create) the log at `path` and start the writer task.
    pub async fn open(path: impl AsRef<Path>) -> ForkliftResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| ForkliftError::io("opening dependency trace", e))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<TraceRecord>();
        let log_path = path.clone();
        let writer = tokio::spawn(async move {
            let mut out = BufWriter::new(file);
            while let Some(record) = rx.recv().await {
                let mut line = match serde_json::to_vec(&record) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::error!(error = %e, "Could not encode dependency trace record");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = out.write_all(&line).await {
                    tracing::error!(path = %log_path.display(), error = %e, "Dependency trace write failed");
                    return;
                }
            }
            if let Err(e) = out.flush().await {
                tracing::error!(path = %log_path.display(), error = %e, "Dependency trace flush failed");
            }
        });

        Ok(Self {
            path,
            tx: parking_lot::Mutex::new(Some(tx)),
            writer: tokio::sync::Mutex::new(Some(writer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn send(&self, record: TraceRecord) {
        if let Some(tx) = self.tx.lock().as_ref() {
            // a closed channel means cleanup already ran
            let _ = tx.send(record);
        }
    }

    pub fn trace_package(&self, name: &str, deps: &[String], top: &[String]) {
        self.send(TraceRecord::Package {
            name: name.to_string(),
            deps: deps.to_vec(),
            top: top.to_vec(),
        });
    }

    pub fn trace_function(&self, code_dir: &Path, direct_deps: &[String]) {
        self.send(TraceRecord::Function {
            name: code_dir.display().to_string(),
            deps: direct_deps.to_vec(),
        });
    }

    pub fn trace_invocation(&self, code_dir: &Path) {
        self.send(TraceRecord::Invocation {
            name: code_dir.display().to_string(),
        });
    }

    /// Stop accepting records and wait until everything queued is on disk.
    pub async fn cleanup(&self) {
        self.tx.lock().take();
        if let Some(writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.await {
                tracing::error!(error = %e, "Dependency trace writer panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_are_json_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let tracer = DepTracer::open(dir.path().join("dep-trace.json"))
            .await
            .unwrap();

        tracer.trace_package("requests", &["idna".to_string()], &["requests".to_string()]);
        tracer.trace_function(Path::new("/code/1-echo"), &["requests".to_string()]);
        tracer.trace_invocation(Path::new("/code/1-echo"));
        tracer.cleanup().await;

        // dropped after cleanup
        tracer.trace_invocation(Path::new("/code/1-echo"));

        let content = std::fs::read_to_string(tracer.path()).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["type"], "package");
        assert_eq!(lines[0]["deps"][0], "idna");
        assert_eq!(lines[1]["type"], "function");
        assert_eq!(lines[1]["name"], "/code/1-echo");
        assert_eq!(lines[2]["type"], "invocation");
    }
}
