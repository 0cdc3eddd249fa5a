// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Worker statistics snapshot served on `/stats`.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::zygote::NodeStats;

/// Point-in-time view of the whole worker.
#[derive(Debug, Clone, Serialize, Default)]
pub struct WorkerStats {
    pub functions: BTreeMap<String, FunctionStats>,
    pub mem_pool: Option<MemPoolStats>,
    pub live_sandboxes: i64,
    /// Import cache counters in tree pre-order; empty without an import cache.
    pub zygotes: Vec<NodeStats>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct FunctionStats {
    pub instances: usize,
    /// Admitted but not yet answered.
    pub outstanding: usize,
    pub avg_exec_ms: u64,
    pub invocations: u64,
    /// Turned away with 429.
    pub rejected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemPoolStats {
    pub name: String,
    pub total_mb: u64,
    pub available_mb: i64,
}

/// Integer mean of the last `size` samples.
#[derive(Debug, Clone)]
pub struct RollingAvg {
    size: usize,
    samples: VecDeque<u64>,
    sum: u64,
}

impl RollingAvg {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            samples: VecDeque::with_capacity(size.max(1)),
            sum: 0,
        }
    }

    pub fn add(&mut self, sample: u64) {
        self.sum += sample;
        self.samples.push_back(sample);
        if self.samples.len() > self.size {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }
    }

    /// 0 before the first sample.
    pub fn avg(&self) -> u64 {
        match self.samples.len() {
            0 => 0,
            n => self.sum / n as u64,
        }
    }
}
