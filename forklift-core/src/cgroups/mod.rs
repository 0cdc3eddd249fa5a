// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! cgroup v2 management.
//!
//! Every sandbox runs inside its own child cgroup of the pool's group, with
//! the pids, io, memory and cpu controllers enabled. Cgroups are prepared
//! ahead of time by a background task so sandbox creation never waits on
//! `mkdir` in the cgroup file system.

mod cgroup;
mod pool;

pub use cgroup::Cgroup;
pub use pool::{CgroupPool, CGROUP_RESERVE};
