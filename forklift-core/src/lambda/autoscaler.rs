// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Instance-count control for one function.
//!
//! Aims for one instance per second of outstanding work:
//! desired = round(outstanding * avg_exec_ms / 1000), capped at the number
//! of outstanding requests and never below one. The instance count moves by
//! at most one per window.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingPolicy {
    pub min_instances: usize,
    /// Minimum spacing between two adjustments.
    pub window: Duration,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            min_instances: 1,
            window: Duration::from_secs(1),
        }
    }
}

/// What the function task should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleStep {
    /// Already at the desired count.
    Steady,
    /// Start one instance.
    Grow,
    /// Kill the newest instance.
    Shrink,
    /// Too soon since the last adjustment; re-evaluate at this instant.
    WaitUntil(Instant),
}

#[derive(Debug)]
pub struct Autoscaler {
    policy: ScalingPolicy,
    last_scaling: Option<Instant>,
}

impl Autoscaler {
    pub fn new(policy: ScalingPolicy) -> Self {
        Self {
            policy,
            last_scaling: None,
        }
    }

    pub fn desired(&self, outstanding: usize, avg_exec_ms: u64) -> usize {
        let work_ms = outstanding as u64 * avg_exec_ms;
        let desired = ((work_ms + 500) / 1000) as usize;
        desired.min(outstanding).max(self.policy.min_instances)
    }

    pub fn step(&mut self, current: usize, desired: usize, now: Instant) -> ScaleStep {
        if current == desired {
            return ScaleStep::Steady;
        }
        if let Some(last) = self.last_scaling {
            let next = last + self.policy.window;
            if now < next {
                return ScaleStep::WaitUntil(next);
            }
        }

        self.last_scaling = Some(now);
        if current < desired {
            ScaleStep::Grow
        } else {
            ScaleStep::Shrink
        }
    }

    /// Earliest instant the next adjustment may happen.
    pub fn next_window(&self, now: Instant) -> Instant {
        match self.last_scaling {
            Some(last) => last + self.policy.window,
            None => now,
        }
    }
}
