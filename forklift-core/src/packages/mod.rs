// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Package installation and dependency tracing.

mod dep_tracer;
mod puller;

pub use dep_tracer::{DepTracer, TraceRecord};
pub use puller::{normalize_pkg, Package, PackageMeta, PackagePuller};
