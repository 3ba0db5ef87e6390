use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Point-in-time snapshot of an execution engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    /// Slots currently running a computation
    pub active_count: usize,
    pub core_pool_size: usize,
    pub maximum_pool_size: usize,
    /// Worker threads alive in the pool
    pub pool_size: usize,
    /// Accepted computations not yet picked up by a slot
    pub queue_size: usize,
    pub completed_task_count: u64,
    /// Configured keep-alive in milliseconds. Slots are created up front and
    /// live as long as the engine, so no slot is ever reaped.
    pub keep_alive: u64,
    /// Peak number of simultaneously active slots
    pub largest_pool_size: usize,
    /// Computations ever accepted
    pub task_count: u64,
}

/// Live counters updated by the engine's slots
#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    accepted: AtomicU64,
    active: AtomicUsize,
    completed: AtomicU64,
    peak_active: AtomicUsize,
}

impl EngineCounters {
    pub(crate) fn accept(&self) {
        self.accepted.fetch_add(1, Ordering::SeqCst);
    }

    /// Mark a slot busy; the guard releases it
    pub(crate) fn enter(&self) -> SlotGuard<'_> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);
        SlotGuard { counters: self }
    }

    /// Every accepted computation has settled
    pub(crate) fn is_idle(&self) -> bool {
        self.completed.load(Ordering::SeqCst) >= self.accepted.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshot(
        &self,
        slots: usize,
        pool_size: usize,
        keep_alive_ms: u64,
    ) -> EngineStatus {
        let task_count = self.accepted.load(Ordering::SeqCst);
        let completed_task_count = self.completed.load(Ordering::SeqCst);
        let active_count = self.active.load(Ordering::SeqCst);
        let queue_size = task_count
            .saturating_sub(completed_task_count)
            .saturating_sub(active_count as u64) as usize;

        EngineStatus {
            active_count,
            core_pool_size: slots,
            maximum_pool_size: slots,
            pool_size,
            queue_size,
            completed_task_count,
            keep_alive: keep_alive_ms,
            largest_pool_size: self.peak_active.load(Ordering::SeqCst),
            task_count,
        }
    }
}

pub(crate) struct SlotGuard<'a> {
    counters: &'a EngineCounters,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.counters.completed.fetch_add(1, Ordering::SeqCst);
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}
