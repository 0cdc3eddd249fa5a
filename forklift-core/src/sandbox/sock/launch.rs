// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Starting a runtime in a freshly built root.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::error::{ForkliftError, ForkliftResult, SandboxError};
use crate::sandbox::SandboxMeta;
use crate::types::RuntimeKind;

/// Descriptor number the runtime finds the cgroup's `cgroup.procs` on.
const CGROUP_FD: i32 = 3;

const READY_TIMEOUT: Duration = Duration::from_secs(20);
const READY_POLL: Duration = Duration::from_millis(5);

const PROXY_START_ATTEMPTS: u32 = 300;
const PROXY_POLL: Duration = Duration::from_millis(10);

pub const RUNTIME_LOG: &str = "ol-runtime.log";
pub const SOCKET_NAME: &str = "ol.sock";

fn launch_err(reason: impl Into<String>) -> SandboxError {
    SandboxError::Launch {
        reason: reason.into(),
    }
}

/// Write `<scratch>/bootstrap.py`: put the installed packages on the
/// import path, import the declared modules, then serve.
///
/// Leaves serve HTTP; Zygotes wait for fork requests.
pub fn write_bootstrap(scratch_dir: &Path, meta: &SandboxMeta, is_leaf: bool) -> ForkliftResult<()> {
    let mut code = vec!["import os, sys".to_string()];

    for pkg in &meta.installs {
        let path = format!("'/packages/{}/files'", pkg);
        code.push(format!("if os.path.exists({}):", path));
        code.push(format!("    if not {} in sys.path:", path));
        code.push(format!("        sys.path.insert(0, {})", path));
    }

    for module in &meta.imports {
        code.push("try:".to_string());
        code.push(format!("    import {}", module));
        code.push("except Exception as e:".to_string());
        code.push("    print('bootstrap.py error:', e)".to_string());
    }

    code.push(if is_leaf { "web_server()" } else { "fork_server()" }.to_string());

    let path = scratch_dir.join("bootstrap.py");
    std::fs::write(&path, code.join("\n")).map_err(|e| ForkliftError::io("write bootstrap.py", e))
}

/// Open the runtime log for appending.
fn runtime_log(scratch_dir: &Path) -> ForkliftResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(scratch_dir.join(RUNTIME_LOG))
        .map_err(|e| ForkliftError::io("open runtime log", e))
}

/// Run the runtime's init inside `root`, placed in the cgroup behind
/// `cgroup_procs`. The init forks the long-lived server and exits.
pub async fn fresh_proc(
    runtime: RuntimeKind,
    root: &Path,
    scratch_dir: &Path,
    cgroup_procs: &Path,
    enable_seccomp: bool,
) -> ForkliftResult<()> {
    let procs = OpenOptions::new()
        .write(true)
        .open(cgroup_procs)
        .map_err(|e| launch_err(format!("open {}: {}", cgroup_procs.display(), e)))?;
    let procs_fd = procs.as_raw_fd();

    let seccomp = enable_seccomp.to_string();
    let mut cmd = Command::new("chroot");
    cmd.arg(root);
    match runtime {
        RuntimeKind::Python => {
            cmd.args([
                "python3",
                "-u",
                "/runtimes/python/server.py",
                "/host/bootstrap.py",
                "1",
                seccomp.as_str(),
            ]);
        }
        RuntimeKind::Native => {
            cmd.args([
                "env",
                "RUST_BACKTRACE=full",
                "/runtimes/native/server",
                "1",
                seccomp.as_str(),
            ]);
        }
    }

    let log = runtime_log(scratch_dir)?;
    let log_err = log
        .try_clone()
        .map_err(|e| ForkliftError::io("clone runtime log", e))?;
    cmd.env_clear()
        .stdin(Stdio::null())
        .stdout(log)
        .stderr(log_err);

    // SAFETY: runs between fork and exec in the child; write(2) and dup2(2)
    // are async-signal-safe. Writing "0" to cgroup.procs moves the writer.
    unsafe {
        cmd.pre_exec(move || {
            if libc::write(procs_fd, b"0".as_ptr().cast(), 1) != 1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::dup2(procs_fd, CGROUP_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let status = cmd
        .status()
        .await
        .map_err(|e| launch_err(format!("spawn chroot: {}", e)))?;
    drop(procs);

    if !status.success() {
        return Err(launch_err(format!(
            "runtime init exited with {} (see {})",
            status,
            scratch_dir.join(RUNTIME_LOG).display()
        ))
        .into());
    }
    Ok(())
}

/// Poll until `path` exists.
pub async fn wait_for_socket(path: &Path, timeout: Duration) -> ForkliftResult<()> {
    let start = tokio::time::Instant::now();
    loop {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(SandboxError::NotReady {
                path: path.to_path_buf(),
                waited_ms: start.elapsed().as_millis() as u64,
            }
            .into());
        }
        tokio::time::sleep(READY_POLL).await;
    }
}

pub async fn wait_until_ready(scratch_dir: &Path) -> ForkliftResult<()> {
    wait_for_socket(&scratch_dir.join(SOCKET_NAME), READY_TIMEOUT).await
}

/// Start the side-car proxy native runtimes talk to, and wait until it
/// has written its pid to `<scratch>/proxy.pid`.
pub async fn start_container_proxy(proxy_bin: &Path, scratch_dir: &Path) -> ForkliftResult<Child> {
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(scratch_dir.join("proxy.log"))
        .map_err(|e| ForkliftError::io("open proxy log", e))?;
    let log_err = log
        .try_clone()
        .map_err(|e| ForkliftError::io("clone proxy log", e))?;

    let mut child = Command::new(proxy_bin)
        .arg(scratch_dir)
        .stdin(Stdio::null())
        .stdout(log)
        .stderr(log_err)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| launch_err(format!("start {}: {}", proxy_bin.display(), e)))?;
    let expected = child.id();

    let pid_file = scratch_dir.join("proxy.pid");
    for _ in 0..PROXY_START_ATTEMPTS {
        if let Ok(Some(status)) = child.try_wait() {
            return Err(launch_err(format!("container proxy exited early with {}", status)).into());
        }

        if let Ok(raw) = tokio::fs::read_to_string(&pid_file).await {
            if let Ok(pid) = raw.trim().parse::<u32>() {
                if Some(pid) != expected {
                    let _ = child.start_kill();
                    return Err(launch_err("container proxy pid does not match").into());
                }
                return Ok(child);
            }
        }
        tokio::time::sleep(PROXY_POLL).await;
    }

    let _ = child.start_kill();
    Err(launch_err("container proxy did not report its pid").into())
}

/// Where the container proxy binary lives: next to the worker binary.
pub fn container_proxy_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("ol-container-proxy")))
        .unwrap_or_else(|| PathBuf::from("ol-container-proxy"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_for_zygote() {
        let dir = tempfile::TempDir::new().unwrap();
        let meta = SandboxMeta {
            installs: vec!["requests".into()],
            imports: vec!["requests".into()],
            ..Default::default()
        };
        write_bootstrap(dir.path(), &meta, false).unwrap();

        let code = std::fs::read_to_string(dir.path().join("bootstrap.py")).unwrap();
        assert!(code.contains("sys.path.insert(0, '/packages/requests/files')"));
        assert!(code.contains("    import requests"));
        assert!(code.ends_with("fork_server()"));
    }

    #[test]
    fn test_bootstrap_for_leaf() {
        let dir = tempfile::TempDir::new().unwrap();
        write_bootstrap(dir.path(), &SandboxMeta::default(), true).unwrap();
        let code = std::fs::read_to_string(dir.path().join("bootstrap.py")).unwrap();
        assert!(code.ends_with("web_server()"));
        assert!(!code.contains("try:"));
    }

    #[tokio::test]
    async fn test_wait_for_socket_times_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ol.sock");
        let err = wait_for_socket(&path, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ForkliftError::Sandbox(SandboxError::NotReady { .. })
        ));

        std::fs::write(&path, "").unwrap();
        wait_for_socket(&path, Duration::from_millis(20)).await.unwrap();
    }
}
