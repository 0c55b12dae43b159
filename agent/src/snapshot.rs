// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Immutable metrics snapshots and their store.
//!
//! The store holds exactly one current snapshot behind an atomically swapped
//! pointer: one writer (the aggregator) publishes, any number of readers
//! (HTTP, dashboard) load without ever blocking the writer or each other.
//! Snapshots are never mutated after publication.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use arc_swap::ArcSwapOption;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Starting,
    Running,
    Paused,
    Stopped,
    Exited,
    Unknown,
}

impl ContainerStatus {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            microradar_common::status::CREATED => ContainerStatus::Starting,
            microradar_common::status::RUNNING => ContainerStatus::Running,
            microradar_common::status::PAUSED => ContainerStatus::Paused,
            microradar_common::status::STOPPED => ContainerStatus::Stopped,
            microradar_common::status::EXITED => ContainerStatus::Exited,
            _ => ContainerStatus::Unknown,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerStatus::Starting => "starting",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Per-container view inside a snapshot.
#[derive(Debug, Clone)]
pub struct ContainerMetrics {
    pub cgroup_id: u64,
    /// Runtime-reported id when the resolver knows one, otherwise the
    /// kernel's hex rendering truncated to 12 characters.
    pub container_id: String,
    pub name: String,
    pub runtime: Option<String>,
    pub status: ContainerStatus,
    pub pid: u32,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_bytes: u64,
    pub network_latency_ms: f64,
    pub tcp_retransmits: u64,
    /// Nanoseconds since boot at container creation.
    pub started_at_ns: u64,
    /// Set for one cycle after a counter re-baseline (LRU eviction).
    pub reseeded: bool,
    pub cpu_samples: Vec<f64>,
    pub memory_samples: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Assigned by the store at publication, strictly increasing.
    pub generation: u64,
    pub taken_at: SystemTime,
    /// Sorted by cgroup id ascending; renderers rely on this for
    /// diff-stable output.
    pub containers: Vec<ContainerMetrics>,
    /// Agent memory in use, as accounted by the budget supervisor.
    pub memory_usage_bytes: u64,
    pub kernel_maps_count: usize,
    pub events_dropped: u64,
    pub decode_failures: u64,
}

/// Single-writer / multi-reader snapshot cell. Readers are wait-free.
pub struct SnapshotStore {
    current: ArcSwapOption<Snapshot>,
    generation: AtomicU64,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::const_empty(),
            generation: AtomicU64::new(0),
        }
    }

    /// Publish a new generation. The previous snapshot is released once the
    /// last reader drops its handle.
    pub fn publish(&self, mut snapshot: Snapshot) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        snapshot.generation = generation;
        self.current.store(Some(Arc::new(snapshot)));
        generation
    }

    pub fn load(&self) -> Option<Arc<Snapshot>> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;

    pub(crate) fn empty_snapshot() -> Snapshot {
        Snapshot {
            generation: 0,
            taken_at: SystemTime::now(),
            containers: Vec::new(),
            memory_usage_bytes: 0,
            kernel_maps_count: 0,
            events_dropped: 0,
            decode_failures: 0,
        }
    }

    #[test]
    fn test_store_starts_empty() {
        let store = SnapshotStore::new();
        assert!(store.load().is_none());
        assert_eq!(store.generation(), 0);
    }

    #[test]
    fn test_publish_is_monotonic() {
        let store = SnapshotStore::new();
        let g1 = store.publish(empty_snapshot());
        let g2 = store.publish(empty_snapshot());
        assert!(g2 > g1);
        assert_eq!(store.load().unwrap().generation, g2);
    }

    #[test]
    fn test_readers_keep_old_generation_alive() {
        let store = SnapshotStore::new();
        store.publish(empty_snapshot());
        let held = store.load().unwrap();
        store.publish(empty_snapshot());
        // The old arc is still valid for the reader that holds it.
        assert_eq!(held.generation, 1);
        assert_eq!(store.load().unwrap().generation, 2);
    }

    #[test]
    fn test_publish_time_monotonic() {
        let store = SnapshotStore::new();
        store.publish(empty_snapshot());
        let first = store.load().unwrap().taken_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.publish(empty_snapshot());
        let second = store.load().unwrap().taken_at;
        assert!(second > first);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ContainerStatus::from_raw(microradar_common::status::CREATED),
            ContainerStatus::Starting
        );
        assert_eq!(ContainerStatus::from_raw(77), ContainerStatus::Unknown);
        assert_eq!(ContainerStatus::Starting.to_string(), "starting");
    }
}
