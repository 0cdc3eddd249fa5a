// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Root filesystem assembly for sock sandboxes.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{chown, Gid, Uid};
use walkdir::WalkDir;

use crate::error::{ForkliftResult, SandboxError};

fn step_err(step: &'static str, e: impl std::fmt::Display) -> SandboxError {
    SandboxError::RootFs {
        step,
        reason: e.to_string(),
    }
}

fn bind(source: &Path, target: &Path, step: &'static str) -> ForkliftResult<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| step_err(step, format!("{} -> {}: {}", source.display(), target.display(), e)))?;
    Ok(())
}

fn remount_ro(target: &Path, step: &'static str) -> ForkliftResult<()> {
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|e| step_err(step, format!("remount {} read-only: {}", target.display(), e)))?;
    Ok(())
}

/// Build `root` from the shared base image plus the sandbox's code and
/// scratch directories.
///
/// Leaves whatever was mounted in place on error; the caller's teardown
/// detaches `root` as a whole.
pub fn populate(
    base: &Path,
    root: &Path,
    code_dir: Option<&Path>,
    scratch_dir: &Path,
) -> ForkliftResult<()> {
    bind(base, root, "base bind")?;
    remount_ro(root, "base read-only")?;
    mount(
        None::<&str>,
        root,
        None::<&str>,
        MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| step_err("base private", e))?;

    if let Some(code_dir) = code_dir {
        let handler = root.join("handler");
        bind(code_dir, &handler, "code bind")?;
        remount_ro(&handler, "code read-only")?;
    }

    let tmp = scratch_dir.join("tmp");
    match std::fs::create_dir(&tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(step_err("scratch tmp", e).into()),
    }
    bind(scratch_dir, &root.join("host"), "scratch bind")?;
    bind(&tmp, &root.join("tmp"), "tmp bind")?;

    let (uid, gid) = runtime_owner(base)?;
    own_tree(scratch_dir, uid, gid)
}

/// The runtime runs as whoever owns `/host` in the base image.
fn runtime_owner(base: &Path) -> ForkliftResult<(Uid, Gid)> {
    let meta = std::fs::metadata(base.join("host")).map_err(|e| step_err("runtime owner", e))?;
    Ok((Uid::from_raw(meta.uid()), Gid::from_raw(meta.gid())))
}

/// Recursively hand `dir` to the runtime user: directories 0755, files 0644.
pub fn own_tree(dir: &Path, uid: Uid, gid: Gid) -> ForkliftResult<()> {
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| step_err("scratch ownership", e))?;
        let path = entry.path();
        if entry.path_is_symlink() {
            continue;
        }
        chown(path, Some(uid), Some(gid)).map_err(|e| {
            step_err("scratch ownership", format!("chown {}: {}", path.display(), e))
        })?;

        let mode = if entry.file_type().is_dir() { 0o755 } else { 0o644 };
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| step_err("scratch ownership", format!("chmod {}: {}", path.display(), e)))?;
    }
    Ok(())
}

/// Detach everything mounted under `root` and remove the (now empty)
/// mount point. Never recurses: a failed detach must not reach the base
/// image or the scratch directory.
pub fn teardown(root: &Path) {
    if let Err(e) = umount2(root, MntFlags::MNT_DETACH) {
        tracing::warn!(path = %root.display(), error = %e, "Could not detach sandbox root");
    }
    if let Err(e) = std::fs::remove_dir(root) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %root.display(), error = %e, "Could not remove sandbox root");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_tree_sets_modes() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("tmp")).unwrap();
        std::fs::write(dir.path().join("bootstrap.py"), "web_server()").unwrap();

        let uid = Uid::current();
        let gid = Gid::current();
        own_tree(dir.path(), uid, gid).unwrap();

        let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&dir.path().join("tmp")), 0o755);
        assert_eq!(mode(&dir.path().join("bootstrap.py")), 0o644);
    }

    #[test]
    fn test_runtime_owner_requires_host_dir() {
        let base = tempfile::TempDir::new().unwrap();
        assert!(runtime_owner(base.path()).is_err());

        std::fs::create_dir(base.path().join("host")).unwrap();
        let (uid, _) = runtime_owner(base.path()).unwrap();
        assert_eq!(uid, Uid::current());
    }
}
