// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Reclaims memory from idle Zygotes when the pool runs low.
//!
//! Only paused, childless, non-leaf sandboxes are candidates. A reserved
//! Zygote is unpaused for as long as it is referenced, and its `Unpause`
//! event is published before it starts running, so it is never picked.
//! Eviction itself goes through `destroy_if_paused`, which re-checks the
//! state under the sandbox lock.
//!
//! Candidates are ranked by `(hits + 1) / (mem_mb * (1 + idle_secs))`;
//! the lowest score goes first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{EventType, SandboxHandle, SandboxPool};
use crate::mem_pool::MemPool;
use crate::types::SandboxId;

/// Share of the pool (in sandboxes) we try to keep free.
const FREE_SANDBOXES_PERCENT_GOAL: i64 = 20;

const CONCURRENT_EVICTIONS: usize = 8;

const TICK: Duration = Duration::from_secs(1);

struct Tracked {
    sb: SandboxHandle,
    paused: bool,
    children: u32,
    hits: u64,
    last_active: Instant,
    evicting: bool,
}

impl Tracked {
    fn new(sb: SandboxHandle) -> Self {
        Self {
            sb,
            paused: false,
            children: 0,
            hits: 0,
            last_active: Instant::now(),
            evicting: false,
        }
    }

    fn is_candidate(&self) -> bool {
        self.paused && self.children == 0 && !self.sb.is_leaf() && !self.evicting
    }

    fn score(&self, now: Instant) -> f64 {
        let idle = now.duration_since(self.last_active).as_secs_f64();
        let mem = self.sb.meta().mem_mb.max(1) as f64;
        (self.hits as f64 + 1.0) / (mem * (1.0 + idle))
    }
}

/// Background eviction task for a sock pool.
pub struct SockEvictor {
    task: JoinHandle<()>,
}

impl SockEvictor {
    /// Subscribe to `pool` and start evicting against `mem`.
    ///
    /// `mem_mb` is the default sandbox size used to express free memory
    /// as a number of sandboxes.
    pub fn spawn(pool: &dyn SandboxPool, mem: Arc<MemPool>, mem_mb: u64, trace: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        pool.add_listener(Arc::new(move |event: EventType, sb: &SandboxHandle| {
            let _ = tx.send((event, sb.clone()));
        }));

        let state = EvictorState {
            mem,
            mem_mb: mem_mb.max(1) as i64,
            trace,
            tracked: HashMap::new(),
        };
        let task = tokio::spawn(state.run(rx));
        Self { task }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

struct EvictorState {
    mem: Arc<MemPool>,
    mem_mb: i64,
    trace: bool,
    tracked: HashMap<SandboxId, Tracked>,
}

impl EvictorState {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<(EventType, SandboxHandle)>) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some((event, sb)) = msg else {
                        tracing::debug!("Evictor stopped, pool dropped its listeners");
                        return;
                    };
                    self.update(event, sb);
                    while let Ok((event, sb)) = rx.try_recv() {
                        self.update(event, sb);
                    }
                }
                _ = tick.tick() => {}
            }
            self.evict();
        }
    }

    fn update(&mut self, event: EventType, sb: SandboxHandle) {
        let id = sb.id();
        if event == EventType::Create {
            self.tracked.insert(id, Tracked::new(sb));
            return;
        }
        if event == EventType::Destroy {
            self.tracked.remove(&id);
            return;
        }

        let Some(entry) = self.tracked.get_mut(&id) else {
            return;
        };
        match event {
            EventType::Pause => {
                entry.paused = true;
                entry.last_active = Instant::now();
            }
            EventType::Unpause => {
                entry.paused = false;
                entry.hits += 1;
                entry.last_active = Instant::now();
            }
            EventType::Fork => entry.children += 1,
            EventType::ChildExit => entry.children = entry.children.saturating_sub(1),
            EventType::DestroyIgnored => entry.evicting = false,
            EventType::Create | EventType::Destroy => {}
        }
        if self.trace {
            tracing::debug!(
                sandbox_id = %id,
                event = %event,
                paused = entry.paused,
                children = entry.children,
                "Evictor state updated"
            );
        }
    }

    fn evict(&mut self) {
        let total = self.mem.total_mb() as i64 / self.mem_mb;
        let free_goal = 1 + (total - 2).max(0) * FREE_SANDBOXES_PERCENT_GOAL / 100;
        let free = self.mem.available_mb() / self.mem_mb;
        if free >= free_goal {
            return;
        }

        // in-flight evictions will free their memory soon
        let in_flight = self.tracked.values().filter(|t| t.evicting).count();
        let cap = CONCURRENT_EVICTIONS.saturating_sub(in_flight);
        let wanted = usize::try_from(free_goal - free - in_flight as i64)
            .unwrap_or(0)
            .min(cap);
        if wanted == 0 {
            return;
        }

        let now = Instant::now();
        let mut candidates: Vec<(f64, SandboxId)> = self
            .tracked
            .iter()
            .filter(|(_, t)| t.is_candidate())
            .map(|(id, t)| (t.score(now), *id))
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        for (score, id) in candidates.into_iter().take(wanted) {
            let Some(entry) = self.tracked.get_mut(&id) else {
                continue;
            };
            entry.evicting = true;
            let sb = entry.sb.clone();
            tracing::info!(sandbox_id = %id, score = score, free_mb = self.mem.available_mb(), "Evicting idle Zygote");
            tokio::spawn(async move {
                sb.destroy_if_paused("idle eviction").await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::mock::MockPool;
    use crate::types::RuntimeKind;

    async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_evicts_paused_zygotes_under_pressure() {
        // 10 sandboxes of 50 MB; goal is 2 free
        let pool = MockPool::new(500);
        let _evictor = SockEvictor::spawn(&pool, pool.mem().clone(), 50, false);
        let dir = tempfile::TempDir::new().unwrap();

        let mut zygotes = Vec::new();
        for _ in 0..9 {
            let sb = pool
                .create(None, false, None, dir.path(), None, RuntimeKind::Python)
                .await
                .unwrap();
            sb.pause().await.unwrap();
            zygotes.push(sb);
        }
        // running Zygote and a leaf: never candidates
        let busy = pool
            .create(None, false, None, dir.path(), None, RuntimeKind::Python)
            .await
            .unwrap();

        assert!(wait_for(|| pool.mem().available_mb() >= 100).await);
        assert!(!busy.is_dead().await);

        let mut dead = 0;
        for sb in &zygotes {
            if sb.is_dead().await {
                dead += 1;
            }
        }
        assert_eq!(dead, 2);
    }

    #[tokio::test]
    async fn test_parents_with_children_are_kept() {
        let pool = MockPool::new(200);
        let _evictor = SockEvictor::spawn(&pool, pool.mem().clone(), 50, false);
        let dir = tempfile::TempDir::new().unwrap();

        let parent = pool
            .create(None, false, None, dir.path(), None, RuntimeKind::Python)
            .await
            .unwrap();
        let child = pool
            .create(
                Some(parent.clone()),
                true,
                Some(dir.path()),
                dir.path(),
                None,
                RuntimeKind::Python,
            )
            .await
            .unwrap();
        parent.pause().await.unwrap();
        child.pause().await.unwrap();

        let other = pool
            .create(None, false, None, dir.path(), None, RuntimeKind::Python)
            .await
            .unwrap();
        other.pause().await.unwrap();
        let filler = pool
            .create(None, false, None, dir.path(), None, RuntimeKind::Python)
            .await
            .unwrap();

        assert!(wait_for(|| pool.mem().available_mb() >= 50).await);
        assert!(other.is_dead().await);
        assert!(!parent.is_dead().await);
        assert!(!child.is_dead().await);
        assert!(!filler.is_dead().await);
    }

    #[tokio::test]
    async fn test_score_prefers_hits_and_recency() {
        let pool = MockPool::new(200);
        let dir = tempfile::TempDir::new().unwrap();
        let sb = pool
            .create(None, false, None, dir.path(), None, RuntimeKind::Python)
            .await
            .unwrap();

        let now = Instant::now();
        let mut cold = Tracked::new(sb.clone());
        let mut hot = Tracked::new(sb);
        hot.hits = 10;
        assert!(hot.score(now) > cold.score(now));

        cold.last_active = now - Duration::from_secs(60);
        hot.hits = 0;
        assert!(hot.score(now) > cold.score(now));
    }
}
