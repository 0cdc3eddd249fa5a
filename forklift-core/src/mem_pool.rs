// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Memory budget shared by every sandbox of a pool.
//!
//! Sandboxes charge their cgroup memory limit against the pool when they are
//! created (or unpaused after a downsize) and return it when torn down. A
//! charge larger than what is free waits; it never fails unless it could not
//! be satisfied even by an empty pool.

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{ForkliftResult, SandboxError};

/// Fixed-size pool of megabytes with blocking reservation.
#[derive(Debug)]
pub struct MemPool {
    name: String,
    total_mb: u64,
    available_mb: Mutex<i64>,
    released: Notify,
    trace: bool,
}

impl MemPool {
    pub fn new(name: impl Into<String>, total_mb: u64, trace: bool) -> Self {
        let name = name.into();
        tracing::info!(pool = %name, total_mb = total_mb, "Memory pool created");
        Self {
            name,
            total_mb,
            available_mb: Mutex::new(total_mb as i64),
            released: Notify::new(),
            trace,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_mb(&self) -> u64 {
        self.total_mb
    }

    pub fn available_mb(&self) -> i64 {
        *self.available_mb.lock()
    }

    /// Wait until `mb` megabytes are free, then take them.
    pub async fn require_mb(&self, mb: u64) -> ForkliftResult<()> {
        if mb > self.total_mb {
            return Err(SandboxError::MemoryRequestTooLarge {
                pool: self.name.clone(),
                requested_mb: mb,
                total_mb: self.total_mb,
            }
            .into());
        }

        loop {
            // register interest before checking so a release between the
            // check and the await is not lost
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut available = self.available_mb.lock();
                if *available >= mb as i64 {
                    *available -= mb as i64;
                    if self.trace {
                        tracing::debug!(pool = %self.name, taken_mb = mb, available_mb = *available, "Memory reserved");
                    }
                    return Ok(());
                }
                if self.trace {
                    tracing::debug!(pool = %self.name, wanted_mb = mb, available_mb = *available, "Waiting for memory");
                }
            }

            notified.await;
        }
    }

    /// Return `mb` megabytes to the pool and wake waiters.
    pub fn release_mb(&self, mb: u64) {
        self.adjust_available_mb(mb as i64);
    }

    /// Add `delta` (possibly negative) to the free count without waiting.
    ///
    /// Only use negative deltas for memory that is already accounted for
    /// elsewhere; reservations should go through [`MemPool::require_mb`].
    pub fn adjust_available_mb(&self, delta: i64) -> i64 {
        let available = {
            let mut available = self.available_mb.lock();
            *available += delta;
            if *available > self.total_mb as i64 {
                tracing::error!(pool = %self.name, available_mb = *available, total_mb = self.total_mb, "More memory returned than was taken");
            }
            *available
        };

        if self.trace {
            tracing::debug!(pool = %self.name, delta_mb = delta, available_mb = available, "Memory adjusted");
        }
        if delta > 0 {
            self.released.notify_waiters();
        }
        available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_require_and_release() {
        let pool = MemPool::new("test", 100, false);
        pool.require_mb(60).await.unwrap();
        assert_eq!(pool.available_mb(), 40);
        pool.release_mb(60);
        assert_eq!(pool.available_mb(), 100);
    }

    #[tokio::test]
    async fn test_oversized_request_fails() {
        let pool = MemPool::new("test", 100, false);
        assert!(pool.require_mb(101).await.is_err());
        assert_eq!(pool.available_mb(), 100);
    }

    #[tokio::test]
    async fn test_require_blocks_until_release() {
        let pool = Arc::new(MemPool::new("test", 100, false));
        pool.require_mb(80).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.require_mb(50).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(pool.available_mb(), 20);

        pool.release_mb(80);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(pool.available_mb(), 50);
    }

    #[tokio::test]
    async fn test_many_waiters_never_overdraw() {
        let pool = Arc::new(MemPool::new("test", 30, false));
        pool.require_mb(30).await.unwrap();

        let mut waiters = Vec::new();
        for _ in 0..5 {
            let pool = pool.clone();
            waiters.push(tokio::spawn(async move {
                pool.require_mb(10).await.unwrap();
                assert!(pool.available_mb() >= 0);
                tokio::time::sleep(Duration::from_millis(10)).await;
                pool.release_mb(10);
            }));
        }

        pool.release_mb(30);
        for w in waiters {
            tokio::time::timeout(Duration::from_secs(2), w)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(pool.available_mb(), 30);
    }
}
