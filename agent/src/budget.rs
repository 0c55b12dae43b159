// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Memory budget supervision.
//!
//! The agent defends a soft cap (48 MiB default) covering userspace pools,
//! aggregation state and the static kernel map sizes. Crossing the critical
//! threshold triggers a sweep that halves every reusable object pool by
//! discarding the least recently returned entries. Pool contents are logical
//! caches; dropping them is always safe.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;
use microradar_common::{ContainerInfo, FlowKey, FlowStats};

use crate::errors::{Error, LogThrottle};

pub const WARNING_RATIO: f64 = 0.70;
pub const CRITICAL_RATIO: f64 = 0.85;

const CONTAINER_SCRATCH_POOL_CAPACITY: usize = 100;
const FLOW_KEY_POOL_CAPACITY: usize = 1_000;
const FLOW_STATS_POOL_CAPACITY: usize = 1_000;
const EVENT_PAYLOAD_POOL_CAPACITY: usize = 500;
const BYTE_BUFFER_POOL_CAPACITY: usize = 200;

pub const BYTE_BUFFER_SIZE: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BudgetLevel {
    Normal,
    Warning,
    Critical,
    Exceeded,
}

pub struct MemoryBudget {
    soft_cap: u64,
    current: AtomicU64,
}

impl MemoryBudget {
    pub fn new(soft_cap: u64) -> Self {
        Self {
            soft_cap,
            current: AtomicU64::new(0),
        }
    }

    pub fn soft_cap(&self) -> u64 {
        self.soft_cap
    }

    pub fn set_current(&self, bytes: u64) {
        self.current.store(bytes, Ordering::Relaxed);
    }

    pub fn current_bytes(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn level(&self) -> BudgetLevel {
        let current = self.current_bytes() as f64;
        let cap = self.soft_cap as f64;
        if current >= cap {
            BudgetLevel::Exceeded
        } else if current >= cap * CRITICAL_RATIO {
            BudgetLevel::Critical
        } else if current >= cap * WARNING_RATIO {
            BudgetLevel::Warning
        } else {
            BudgetLevel::Normal
        }
    }
}

/// A bounded free-list of reusable objects. `put` keeps the most recently
/// returned entries; `shrink_half` discards from the least recently returned
/// end.
pub struct Pool<T> {
    free: Mutex<VecDeque<T>>,
    capacity: usize,
    sizer: fn(&T) -> usize,
}

impl<T: Default> Pool<T> {
    pub fn new(capacity: usize, sizer: fn(&T) -> usize) -> Self {
        Self {
            free: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            sizer,
        }
    }

    pub fn get(&self) -> T {
        match self.free.lock() {
            Ok(mut free) => free.pop_front().unwrap_or_default(),
            Err(_) => T::default(),
        }
    }

    pub fn put(&self, item: T) {
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.capacity {
                free.push_front(item);
            }
        }
    }

    pub fn live(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }

    pub fn bytes(&self) -> usize {
        self.free
            .lock()
            .map(|free| free.iter().map(self.sizer).sum())
            .unwrap_or(0)
    }

    pub fn shrink_half(&self) {
        if let Ok(mut free) = self.free.lock() {
            let keep = free.len() / 2;
            free.truncate(keep);
        }
    }
}

type ContainerScratch = Vec<(u64, ContainerInfo)>;
type FlowScratch = Vec<(FlowKey, FlowStats)>;

/// The agent's reusable scratch pools, sized per the budget design.
pub struct PoolSet {
    /// Container table scratch for the aggregator's poll cycle.
    pub container_scratch: Pool<ContainerScratch>,
    /// Stale-key collection for the reaper.
    pub flow_keys: Pool<Vec<FlowKey>>,
    /// Flow table scratch for the aggregator's poll cycle.
    pub flow_scratch: Pool<FlowScratch>,
    /// Ring-buffer record copies in the pump.
    pub event_payloads: Pool<Vec<u8>>,
    /// General 4 KiB buffers (HTTP response assembly).
    pub byte_buffers: Pool<Vec<u8>>,
}

impl Default for PoolSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolSet {
    pub fn new() -> Self {
        Self {
            container_scratch: Pool::new(CONTAINER_SCRATCH_POOL_CAPACITY, |v| {
                v.capacity() * std::mem::size_of::<(u64, ContainerInfo)>()
            }),
            flow_keys: Pool::new(FLOW_KEY_POOL_CAPACITY, |v| {
                v.capacity() * std::mem::size_of::<FlowKey>()
            }),
            flow_scratch: Pool::new(FLOW_STATS_POOL_CAPACITY, |v| {
                v.capacity() * std::mem::size_of::<(FlowKey, FlowStats)>()
            }),
            event_payloads: Pool::new(EVENT_PAYLOAD_POOL_CAPACITY, Vec::capacity),
            byte_buffers: Pool::new(BYTE_BUFFER_POOL_CAPACITY, Vec::capacity),
        }
    }

    pub fn bytes(&self) -> u64 {
        (self.container_scratch.bytes()
            + self.flow_keys.bytes()
            + self.flow_scratch.bytes()
            + self.event_payloads.bytes()
            + self.byte_buffers.bytes()) as u64
    }

    /// Halve every pool, least recently returned entries first.
    pub fn sweep(&self) {
        self.container_scratch.shrink_half();
        self.flow_keys.shrink_half();
        self.flow_scratch.shrink_half();
        self.event_payloads.shrink_half();
        self.byte_buffers.shrink_half();
    }
}

/// One supervision cycle: account, and sweep when critical. Returns the
/// post-cycle level.
pub fn supervise(
    budget: &MemoryBudget,
    pools: &PoolSet,
    static_bytes: u64,
    state_bytes: u64,
    throttle: &LogThrottle,
) -> BudgetLevel {
    budget.set_current(static_bytes + state_bytes + pools.bytes());
    let level = budget.level();
    if level < BudgetLevel::Critical {
        return level;
    }

    pools.sweep();
    budget.set_current(static_bytes + state_bytes + pools.bytes());
    let after = budget.level();
    if after >= BudgetLevel::Critical {
        let err = Error::BudgetExceeded {
            current: budget.current_bytes(),
            cap: budget.soft_cap(),
        };
        if throttle.should_log(err.kind()) {
            warn!("{err}");
        }
    }
    after
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        let budget = MemoryBudget::new(100);
        budget.set_current(10);
        assert_eq!(budget.level(), BudgetLevel::Normal);
        budget.set_current(70);
        assert_eq!(budget.level(), BudgetLevel::Warning);
        budget.set_current(85);
        assert_eq!(budget.level(), BudgetLevel::Critical);
        budget.set_current(100);
        assert_eq!(budget.level(), BudgetLevel::Exceeded);
    }

    #[test]
    fn test_pool_reuses_and_bounds() {
        let pool: Pool<Vec<u8>> = Pool::new(2, Vec::capacity);
        let mut a = pool.get();
        a.reserve(64);
        pool.put(a);
        assert_eq!(pool.live(), 1);
        assert!(pool.bytes() >= 64);

        pool.put(Vec::with_capacity(8));
        pool.put(Vec::with_capacity(8));
        // Third return is dropped: the pool is full.
        assert_eq!(pool.live(), 2);

        // Most recently returned comes back first.
        let reused = pool.get();
        assert_eq!(reused.capacity(), 8);
    }

    #[test]
    fn test_shrink_half() {
        let pool: Pool<Vec<u8>> = Pool::new(10, Vec::capacity);
        for _ in 0..9 {
            pool.put(Vec::new());
        }
        pool.shrink_half();
        assert_eq!(pool.live(), 4);
        pool.shrink_half();
        assert_eq!(pool.live(), 2);
    }

    #[test]
    fn test_supervise_sweeps_on_critical() {
        let budget = MemoryBudget::new(1_000);
        let pools = PoolSet::new();
        let throttle = LogThrottle::per_minute();
        for _ in 0..10 {
            pools.byte_buffers.put(Vec::with_capacity(100));
        }
        let before = pools.byte_buffers.live();
        assert_eq!(before, 10);

        // Static usage alone crosses the 85% threshold.
        let level = supervise(&budget, &pools, 900, 0, &throttle);
        assert!(pools.byte_buffers.live() <= before / 2);
        assert!(level >= BudgetLevel::Warning);
    }

    #[test]
    fn test_supervise_normal_leaves_pools_alone() {
        let budget = MemoryBudget::new(1_000_000);
        let pools = PoolSet::new();
        let throttle = LogThrottle::per_minute();
        pools.flow_keys.put(Vec::with_capacity(16));
        supervise(&budget, &pools, 0, 0, &throttle);
        assert_eq!(pools.flow_keys.live(), 1);
    }
}
