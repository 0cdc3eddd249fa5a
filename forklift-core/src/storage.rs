// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Managed worker directories.
//!
//! A [`DirMaker`] owns one subtree of the worker directory (`code/`,
//! `scratch/`, `root-sandboxes/`, ...) and hands out uniquely named
//! directories inside it. The subtree is wiped at startup, so anything left
//! behind by a crashed worker disappears.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use serde::{Deserialize, Serialize};

use crate::error::{ForkliftError, ForkliftResult, HardValidationError};

/// Shared across every DirMaker so names never collide between subtrees.
static NEXT_DIR_ID: AtomicU64 = AtomicU64::new(1000);

/// How a managed subtree is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StoreMode {
    /// Plain directory on the worker's file system.
    #[default]
    #[serde(rename = "")]
    Regular,
    /// 64 MB tmpfs mounted over the subtree.
    #[serde(rename = "memory")]
    Memory,
    /// Bind-mounted onto itself with private propagation.
    #[serde(rename = "private")]
    Private,
}

impl fmt::Display for StoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreMode::Regular => write!(f, "regular"),
            StoreMode::Memory => write!(f, "memory"),
            StoreMode::Private => write!(f, "private"),
        }
    }
}

impl FromStr for StoreMode {
    type Err = HardValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "disk" | "regular" => Ok(StoreMode::Regular),
            "memory" | "tmpfs" => Ok(StoreMode::Memory),
            "private" => Ok(StoreMode::Private),
            other => Err(HardValidationError::InvalidFieldValue {
                field: "storage mode",
                value: other.to_string(),
                reason: "expected \"\", memory or private".to_string(),
            }),
        }
    }
}

/// Hands out fresh directories under `<worker_dir>/<system>`.
#[derive(Debug)]
pub struct DirMaker {
    prefix: PathBuf,
    mode: StoreMode,
}

impl DirMaker {
    /// Wipe and recreate `<worker_dir>/<system>`, mounting it per `mode`.
    pub fn new(worker_dir: &Path, system: &str, mode: StoreMode) -> ForkliftResult<Self> {
        let prefix = worker_dir.join(system);

        if prefix.exists() {
            // a previous worker may have left a mount behind
            let _ = umount2(&prefix, MntFlags::MNT_DETACH);
            std::fs::remove_dir_all(&prefix)
                .map_err(|e| ForkliftError::io("removing stale storage directory", e))?;
        }
        std::fs::create_dir_all(&prefix)
            .map_err(|e| ForkliftError::io("creating storage directory", e))?;

        match mode {
            StoreMode::Regular => {}
            StoreMode::Memory => {
                mount(
                    Some("none"),
                    &prefix,
                    Some("tmpfs"),
                    MsFlags::empty(),
                    Some("size=64m"),
                )
                .map_err(|e| ForkliftError::Syscall {
                    syscall: "mount(tmpfs)",
                    message: format!("{}: {}", prefix.display(), e),
                })?;
            }
            StoreMode::Private => {
                mount(
                    Some(&prefix),
                    &prefix,
                    None::<&str>,
                    MsFlags::MS_BIND,
                    None::<&str>,
                )
                .map_err(|e| ForkliftError::Syscall {
                    syscall: "mount(bind)",
                    message: format!("{}: {}", prefix.display(), e),
                })?;
                mount(
                    None::<&str>,
                    &prefix,
                    None::<&str>,
                    MsFlags::MS_PRIVATE,
                    None::<&str>,
                )
                .map_err(|e| ForkliftError::Syscall {
                    syscall: "mount(private)",
                    message: format!("{}: {}", prefix.display(), e),
                })?;
            }
        }

        tracing::debug!(prefix = %prefix.display(), mode = %mode, "Storage directory ready");
        Ok(Self { prefix, mode })
    }

    /// Unique path `<prefix>/<n>-<suffix>`; nothing is created.
    pub fn get(&self, suffix: &str) -> PathBuf {
        let id = NEXT_DIR_ID.fetch_add(1, Ordering::Relaxed);
        self.prefix.join(format!("{}-{}", id, suffix))
    }

    /// Like [`DirMaker::get`], but also creates the directory.
    pub fn make(&self, suffix: &str) -> ForkliftResult<PathBuf> {
        let dir = self.get(suffix);
        std::fs::create_dir_all(&dir)
            .map_err(|e| ForkliftError::io("creating managed directory", e))?;
        Ok(dir)
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    /// Unmount (if mounted) and remove the whole subtree.
    pub fn cleanup(&self) -> ForkliftResult<()> {
        if self.mode != StoreMode::Regular {
            if let Err(e) = umount2(&self.prefix, MntFlags::MNT_DETACH) {
                tracing::warn!(prefix = %self.prefix.display(), error = %e, "Could not unmount storage");
            }
        }
        match std::fs::remove_dir_all(&self.prefix) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ForkliftError::io("removing storage directory", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_mode_parse() {
        assert_eq!("".parse::<StoreMode>().unwrap(), StoreMode::Regular);
        assert_eq!("disk".parse::<StoreMode>().unwrap(), StoreMode::Regular);
        assert_eq!("tmpfs".parse::<StoreMode>().unwrap(), StoreMode::Memory);
        assert_eq!("private".parse::<StoreMode>().unwrap(), StoreMode::Private);
        assert!("nfs".parse::<StoreMode>().is_err());
    }

    #[test]
    fn test_dir_maker_unique_names() {
        let tmp = TempDir::new().unwrap();
        let maker = DirMaker::new(tmp.path(), "code", StoreMode::Regular).unwrap();

        let a = maker.get("echo");
        let b = maker.get("echo");
        assert_ne!(a, b);
        assert!(a.starts_with(tmp.path().join("code")));
        assert!(a.file_name().unwrap().to_str().unwrap().ends_with("-echo"));
        assert!(!a.exists());

        let made = maker.make("echo").unwrap();
        assert!(made.is_dir());
    }

    #[test]
    fn test_dir_maker_wipes_previous_contents() {
        let tmp = TempDir::new().unwrap();
        let stale = tmp.path().join("scratch").join("1-old");
        std::fs::create_dir_all(&stale).unwrap();

        let maker = DirMaker::new(tmp.path(), "scratch", StoreMode::Regular).unwrap();
        assert!(!stale.exists());
        assert!(maker.prefix().is_dir());

        maker.make("x").unwrap();
        maker.cleanup().unwrap();
        assert!(!maker.prefix().exists());
        // second cleanup is harmless
        maker.cleanup().unwrap();
    }
}
