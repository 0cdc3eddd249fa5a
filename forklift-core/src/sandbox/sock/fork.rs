// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Fork requests to a Zygote's runtime.
//!
//! The Zygote listens on `<scratch>/ol.sock`. A request is a single byte
//! carrying two descriptors (`SCM_RIGHTS`): the child's root directory and
//! the child cgroup's `cgroup.procs`, followed by one JSON line naming the
//! runtime and the modules the child should import. The runtime forks,
//! moves the new process into the new root and answers with the child's
//! PID as a native-endian `i32`; zero or negative means failure.

use std::fs::{File, OpenOptions};
use std::io::{IoSlice, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use serde::Serialize;

use crate::error::{ForkliftResult, SandboxError};
use crate::types::RuntimeKind;

#[derive(Debug, Serialize)]
struct ForkMessage<'a> {
    runtime: RuntimeKind,
    imports: &'a [String],
}

fn failed(reason: impl Into<String>) -> SandboxError {
    SandboxError::ForkFailed {
        reason: reason.into(),
    }
}

/// Send a fork request and return the new child's PID.
pub async fn request(
    sock_path: PathBuf,
    root_dir: PathBuf,
    cgroup_procs: PathBuf,
    runtime: RuntimeKind,
    imports: Vec<String>,
    timeout: Duration,
) -> ForkliftResult<u32> {
    let join = tokio::task::spawn_blocking(move || {
        let msg = ForkMessage {
            runtime,
            imports: &imports,
        };
        request_blocking(&sock_path, &root_dir, &cgroup_procs, &msg, timeout)
    })
    .await;

    match join {
        Ok(result) => result,
        Err(e) => Err(failed(format!("fork request task failed: {}", e)).into()),
    }
}

fn request_blocking(
    sock_path: &Path,
    root_dir: &Path,
    cgroup_procs: &Path,
    msg: &ForkMessage<'_>,
    timeout: Duration,
) -> ForkliftResult<u32> {
    let root = File::open(root_dir)
        .map_err(|e| failed(format!("open {}: {}", root_dir.display(), e)))?;
    let procs = OpenOptions::new()
        .write(true)
        .open(cgroup_procs)
        .map_err(|e| failed(format!("open {}: {}", cgroup_procs.display(), e)))?;

    let mut stream = UnixStream::connect(sock_path)
        .map_err(|e| failed(format!("connect {}: {}", sock_path.display(), e)))?;
    stream
        .set_read_timeout(Some(timeout))
        .and_then(|()| stream.set_write_timeout(Some(timeout)))
        .map_err(|e| failed(e.to_string()))?;

    let fds = [root.as_raw_fd(), procs.as_raw_fd()];
    let payload = [0u8];
    let iov = [IoSlice::new(&payload)];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let sent = sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
        .map_err(|e| failed(format!("sendmsg: {}", e)))?;
    if sent != payload.len() {
        return Err(failed("short write on fork socket").into());
    }

    let mut line = serde_json::to_vec(msg).map_err(|e| failed(e.to_string()))?;
    line.push(b'\n');
    stream
        .write_all(&line)
        .map_err(|e| failed(format!("send fork message: {}", e)))?;

    let mut pid = [0u8; 4];
    stream.read_exact(&mut pid).map_err(|e| {
        if matches!(
            e.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ) {
            failed(format!("no answer within {} s", timeout.as_secs()))
        } else {
            failed(format!("read child pid: {}", e))
        }
    })?;

    match i32::from_ne_bytes(pid) {
        pid if pid > 0 => Ok(pid as u32),
        code => Err(failed(format!("runtime answered {}", code)).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    /// Accepts one request and returns the JSON line it carried.
    fn fake_zygote(dir: &Path, answer: i32) -> (PathBuf, std::thread::JoinHandle<String>) {
        let sock = dir.join("ol.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        let handle = std::thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            let mut reader = std::io::BufReader::new(conn);
            let mut byte = [0u8; 1];
            reader.read_exact(&mut byte).unwrap();
            let mut line = String::new();
            std::io::BufRead::read_line(&mut reader, &mut line).unwrap();
            reader.get_mut().write_all(&answer.to_ne_bytes()).unwrap();
            line
        });
        (sock, handle)
    }

    #[tokio::test]
    async fn test_fork_request_ok() {
        let dir = tempfile::TempDir::new().unwrap();
        let procs = dir.path().join("cgroup.procs");
        std::fs::write(&procs, "").unwrap();
        let (sock, zygote) = fake_zygote(dir.path(), 4242);

        let pid = request(
            sock,
            dir.path().to_path_buf(),
            procs,
            RuntimeKind::Python,
            vec!["numpy".to_string()],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(pid, 4242);

        let line = zygote.join().unwrap();
        let msg: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(msg["runtime"], "python");
        assert_eq!(msg["imports"][0], "numpy");
    }

    #[tokio::test]
    async fn test_fork_request_bad_status() {
        let dir = tempfile::TempDir::new().unwrap();
        let procs = dir.path().join("cgroup.procs");
        std::fs::write(&procs, "").unwrap();
        let (sock, _zygote) = fake_zygote(dir.path(), -1);

        let err = request(
            sock,
            dir.path().to_path_buf(),
            procs,
            RuntimeKind::Python,
            Vec::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(err.is_fork_failed());
    }

    #[tokio::test]
    async fn test_fork_request_no_listener() {
        let dir = tempfile::TempDir::new().unwrap();
        let procs = dir.path().join("cgroup.procs");
        std::fs::write(&procs, "").unwrap();

        let err = request(
            dir.path().join("ol.sock"),
            dir.path().to_path_buf(),
            procs,
            RuntimeKind::Native,
            Vec::new(),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(err.is_fork_failed());
    }
}
