// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Metrics aggregation.
//!
//! Raw events from the pump and periodic polls of the kernel tables are
//! folded into per-container rolling state, then assembled into immutable
//! snapshots. Kernel counters are cumulative; the aggregator keeps per-flow
//! baselines and folds deltas, re-baselining when a counter decreases (LRU
//! eviction).
//!
//! Lock discipline: one RwLock over the whole aggregation state. The poll
//! cycle and the reaper take the writer; pump event handlers take it briefly.
//! Nothing holds it across I/O — identities are resolved between lock scopes
//! and snapshots are published through the wait-free store.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};

use microradar_common::{ContainerInfo, FlowKey, FlowStats, flow_flags};
use rustc_hash::FxHashMap;

use crate::budget::PoolSet;
use crate::errors::Error;
use crate::events::Event;
use crate::maps::TelemetrySource;
use crate::resolver::CgroupResolver;
use crate::snapshot::{ContainerMetrics, ContainerStatus, Snapshot, SnapshotStore};

/// Sliding window over which samples are kept.
pub const WINDOW: Duration = Duration::from_secs(60);
/// Bound on every per-container sample ring.
pub const MAX_SAMPLES: usize = 100;
/// Memory-percent denominator when the host total cannot be read.
pub const DEFAULT_TOTAL_MEMORY_BYTES: u64 = 8 * 1024 * 1024 * 1024;

/// Bounded ring of samples, oldest dropped first.
#[derive(Debug, Default, Clone)]
struct SampleRing {
    samples: std::collections::VecDeque<f64>,
}

impl SampleRing {
    fn push(&mut self, value: f64) {
        if self.samples.len() == MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn latest(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    fn to_vec(&self) -> Vec<f64> {
        self.samples.iter().copied().collect()
    }
}

#[derive(Debug)]
struct ContainerAgg {
    pid: u32,
    status: ContainerStatus,
    started_at_ns: u64,
    name: String,
    cpu_samples: SampleRing,
    memory_samples: SampleRing,
    memory_bytes: u64,
    last_update: Instant,
    reseeded: bool,
}

impl ContainerAgg {
    fn new(now: Instant) -> Self {
        Self {
            pid: 0,
            status: ContainerStatus::Unknown,
            started_at_ns: 0,
            name: String::new(),
            cpu_samples: SampleRing::default(),
            memory_samples: SampleRing::default(),
            memory_bytes: 0,
            last_update: now,
            reseeded: false,
        }
    }

    fn apply_info(&mut self, info: &ContainerInfo, now: Instant) {
        self.pid = info.pid;
        self.started_at_ns = info.start_ns;
        let name = comm_str(&info.comm);
        if !name.is_empty() {
            self.name = name;
        }
        let status = ContainerStatus::from_raw(info.status);
        // A created-state report never demotes a container exec already
        // promoted.
        if !(self.status == ContainerStatus::Running && status == ContainerStatus::Starting) {
            self.status = status;
        }
        if info.memory_bytes > 0 {
            self.memory_bytes = info.memory_bytes;
            self.memory_samples.push(info.memory_bytes as f64);
        }
        if info.cpu_millipercent > 0 {
            self.cpu_samples.push(f64::from(info.cpu_millipercent) / 10.0);
        }
        self.last_update = now;
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct FlowBaseline {
    packets: u64,
    bytes: u64,
    retransmits: u32,
    latency_sum_ns: u64,
    latency_count: u64,
    seen_cycle: u64,
}

#[derive(Debug, Default)]
struct NetworkAgg {
    packets_in: u64,
    packets_out: u64,
    bytes_in: u64,
    bytes_out: u64,
    retransmits: u64,
    latency_samples: SampleRing,
    baselines: FxHashMap<FlowKey, FlowBaseline>,
}

struct AggState {
    containers: FxHashMap<u64, ContainerAgg>,
    networks: FxHashMap<u64, NetworkAgg>,
    cycle: u64,
}

pub struct Aggregator {
    state: RwLock<AggState>,
    store: Arc<SnapshotStore>,
    total_memory_bytes: u64,
    max_containers: usize,
}

fn comm_str(comm: &[u8; 16]) -> String {
    let end = comm.iter().position(|&b| b == 0).unwrap_or(comm.len());
    String::from_utf8_lossy(comm.get(..end).unwrap_or_default()).into_owned()
}

/// Snapshot textual id for a cgroup with no resolver identity: the cgroup id
/// in hex without leading zeros, truncated to 12 characters.
fn fallback_container_id(cgroup_id: u64) -> String {
    let mut id = format!("{cgroup_id:x}");
    id.truncate(12);
    id
}

impl Aggregator {
    pub fn new(store: Arc<SnapshotStore>, total_memory_bytes: u64, max_containers: u32) -> Self {
        Self {
            state: RwLock::new(AggState {
                containers: FxHashMap::default(),
                networks: FxHashMap::default(),
                cycle: 0,
            }),
            store,
            total_memory_bytes: total_memory_bytes.max(1),
            max_containers: max_containers as usize,
        }
    }

    /// Total memory of the host, read once at startup. Falls back to 8 GiB
    /// when /proc/meminfo is unreadable.
    pub fn host_total_memory(proc_root: &std::path::Path) -> u64 {
        let Ok(contents) = std::fs::read_to_string(proc_root.join("meminfo")) else {
            return DEFAULT_TOTAL_MEMORY_BYTES;
        };
        for line in contents.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                if let Some(kb) = rest
                    .trim()
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse::<u64>().ok())
                {
                    return kb * 1024;
                }
            }
        }
        DEFAULT_TOTAL_MEMORY_BYTES
    }

    /// Incremental update from a decoded event. Holds the writer lock only
    /// for the duration of the fold.
    pub fn handle_event(&self, event: &Event) {
        let now = Instant::now();
        let Ok(mut state) = self.state.write() else {
            return;
        };
        match event {
            Event::ContainerStart {
                cgroup_id, info, ..
            } => {
                if state.containers.len() >= self.max_containers
                    && !state.containers.contains_key(cgroup_id)
                {
                    return;
                }
                state
                    .containers
                    .entry(*cgroup_id)
                    .or_insert_with(|| ContainerAgg::new(now))
                    .apply_info(info, now);
            }
            Event::ContainerStop { cgroup_id, .. } => {
                if let Some(agg) = state.containers.get_mut(cgroup_id) {
                    agg.status = ContainerStatus::Stopped;
                    agg.last_update = now;
                }
            }
            Event::NetworkPacket { cgroup_id, .. } => {
                // Counters reconcile on the next poll of the flow table; the
                // event just keeps the record fresh.
                if let Some(agg) = state.containers.get_mut(cgroup_id) {
                    agg.last_update = now;
                }
            }
            Event::CpuSample {
                cgroup_id,
                millipercent,
                ..
            } => {
                if let Some(agg) = state.containers.get_mut(cgroup_id) {
                    agg.cpu_samples.push(*millipercent as f64 / 10.0);
                    agg.last_update = now;
                }
            }
            Event::MemorySample {
                cgroup_id, bytes, ..
            } => {
                if let Some(agg) = state.containers.get_mut(cgroup_id) {
                    agg.memory_bytes = *bytes;
                    agg.memory_samples.push(*bytes as f64);
                    agg.last_update = now;
                }
            }
        }
    }

    /// Container pids currently known, for the procfs sampler.
    pub fn sampling_targets(&self) -> Vec<(u64, u32)> {
        match self.state.read() {
            Ok(state) => state
                .containers
                .iter()
                .filter(|(_, agg)| agg.pid != 0 && agg.status != ContainerStatus::Stopped)
                .map(|(cgroup_id, agg)| (*cgroup_id, agg.pid))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// One aggregation cycle: reconcile with the kernel tables, then publish
    /// a fresh snapshot. Returns the published generation.
    pub fn poll_cycle(
        &self,
        source: &mut dyn TelemetrySource,
        resolver: &mut CgroupResolver,
        pools: &PoolSet,
        decode_failures: u64,
        memory_usage_bytes: u64,
    ) -> Result<u64, Error> {
        let mut container_scratch = pools.container_scratch.get();
        let mut flow_scratch = pools.flow_scratch.get();

        let result = source
            .containers_into(&mut container_scratch)
            .and_then(|()| source.flows_into(&mut flow_scratch));
        if let Err(err) = result {
            pools.container_scratch.put(container_scratch);
            pools.flow_scratch.put(flow_scratch);
            return Err(err);
        }
        let dropped = source.dropped_events();
        let maps_count = source.map_count();

        let now = Instant::now();
        {
            let Ok(mut state) = self.state.write() else {
                return Err(Error::MapAccess {
                    context: "aggregation lock poisoned".into(),
                });
            };
            state.cycle += 1;
            let cycle = state.cycle;
            for agg in state.containers.values_mut() {
                agg.reseeded = false;
            }

            for (cgroup_id, info) in &container_scratch {
                if *cgroup_id <= 1 {
                    continue;
                }
                if state.containers.len() >= self.max_containers
                    && !state.containers.contains_key(cgroup_id)
                {
                    continue;
                }
                state
                    .containers
                    .entry(*cgroup_id)
                    .or_insert_with(|| ContainerAgg::new(now))
                    .apply_info(info, now);
            }

            for (key, stats) in &flow_scratch {
                if key.cgroup_id <= 1 {
                    continue;
                }
                let reseeded = {
                    let network = state.networks.entry(key.cgroup_id).or_default();
                    fold_flow(network, key, stats, cycle)
                };
                if reseeded {
                    if let Some(agg) = state.containers.get_mut(&key.cgroup_id) {
                        agg.reseeded = true;
                    }
                }
            }

            // Baselines for flows the kernel no longer reports are dropped
            // after a couple of cycles; a returning flow re-baselines anyway.
            for network in state.networks.values_mut() {
                network
                    .baselines
                    .retain(|_, baseline| cycle - baseline.seen_cycle <= 2);
            }
        }

        pools.container_scratch.put(container_scratch);
        pools.flow_scratch.put(flow_scratch);

        // Resolve identities outside the lock: the resolver may rescan
        // procfs, and nothing here needs the state to stay frozen.
        let cgroup_ids: Vec<u64> = match self.state.read() {
            Ok(state) => state.containers.keys().copied().collect(),
            Err(_) => Vec::new(),
        };
        let mut identities = FxHashMap::default();
        for cgroup_id in cgroup_ids {
            if let Some(resolved) = resolver.lookup(cgroup_id) {
                identities.insert(cgroup_id, resolved);
            }
        }

        let snapshot = self.build_snapshot(
            &identities,
            maps_count,
            dropped,
            decode_failures,
            memory_usage_bytes,
        )?;
        Ok(self.store.publish(snapshot))
    }

    fn build_snapshot(
        &self,
        identities: &FxHashMap<u64, crate::resolver::ResolvedContainer>,
        kernel_maps_count: usize,
        events_dropped: u64,
        decode_failures: u64,
        memory_usage_bytes: u64,
    ) -> Result<Snapshot, Error> {
        let state = self.state.read().map_err(|_| Error::MapAccess {
            context: "aggregation lock poisoned".into(),
        })?;

        let mut containers: Vec<ContainerMetrics> = state
            .containers
            .iter()
            .map(|(cgroup_id, agg)| {
                let network = state.networks.get(cgroup_id);
                let resolved = identities.get(cgroup_id);
                let container_id = resolved
                    .map(|r| r.container_id.clone())
                    .unwrap_or_else(|| fallback_container_id(*cgroup_id));
                ContainerMetrics {
                    cgroup_id: *cgroup_id,
                    container_id,
                    name: if agg.name.is_empty() {
                        "unknown".to_string()
                    } else {
                        agg.name.clone()
                    },
                    runtime: resolved.map(|r| r.runtime.to_string()),
                    status: agg.status,
                    pid: agg.pid,
                    cpu_percent: agg.cpu_samples.latest().unwrap_or(0.0),
                    memory_percent: agg.memory_bytes as f64 / self.total_memory_bytes as f64
                        * 100.0,
                    memory_bytes: agg.memory_bytes,
                    network_latency_ms: network
                        .and_then(|n| n.latency_samples.mean())
                        .unwrap_or(0.0),
                    tcp_retransmits: network.map(|n| n.retransmits).unwrap_or(0),
                    started_at_ns: agg.started_at_ns,
                    reseeded: agg.reseeded,
                    cpu_samples: agg.cpu_samples.to_vec(),
                    memory_samples: agg.memory_samples.to_vec(),
                }
            })
            .collect();
        containers.sort_by_key(|c| c.cgroup_id);

        Ok(Snapshot {
            generation: 0,
            taken_at: SystemTime::now(),
            containers,
            memory_usage_bytes,
            kernel_maps_count,
            events_dropped: events_dropped + decode_failures,
            decode_failures,
        })
    }

    /// Approximate resident size of the aggregation state, for the budget
    /// supervisor.
    pub fn approx_bytes(&self) -> u64 {
        let Ok(state) = self.state.read() else {
            return 0;
        };
        let container_bytes = state.containers.len()
            * (std::mem::size_of::<ContainerAgg>() + MAX_SAMPLES * 2 * std::mem::size_of::<f64>());
        let network_bytes: usize = state
            .networks
            .values()
            .map(|n| {
                std::mem::size_of::<NetworkAgg>()
                    + n.baselines.len()
                        * (std::mem::size_of::<FlowKey>() + std::mem::size_of::<FlowBaseline>())
            })
            .sum();
        (container_bytes + network_bytes) as u64
    }

    /// Drop aggregation entries idle beyond `horizon`. Running containers
    /// are first marked exited and removed on the following sweep. Returns
    /// the cgroup ids that were removed so the caller can clear the kernel
    /// tables too.
    pub fn prune_idle(&self, horizon: Duration) -> Vec<u64> {
        let now = Instant::now();
        let Ok(mut state) = self.state.write() else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        state.containers.retain(|cgroup_id, agg| {
            if now.duration_since(agg.last_update) < horizon {
                return true;
            }
            match agg.status {
                ContainerStatus::Stopped | ContainerStatus::Exited => {
                    removed.push(*cgroup_id);
                    false
                }
                _ => {
                    agg.status = ContainerStatus::Exited;
                    true
                }
            }
        });
        for cgroup_id in &removed {
            state.networks.remove(cgroup_id);
        }
        // Network-only state for cgroups the container table never named.
        let live: Vec<u64> = state.containers.keys().copied().collect();
        state
            .networks
            .retain(|cgroup_id, _| live.contains(cgroup_id));
        removed
    }

    /// Full sweep: prune and reset every sample window.
    pub fn reset_windows(&self) {
        if let Ok(mut state) = self.state.write() {
            for agg in state.containers.values_mut() {
                agg.cpu_samples = SampleRing::default();
                agg.memory_samples = SampleRing::default();
            }
            for network in state.networks.values_mut() {
                network.latency_samples = SampleRing::default();
            }
        }
    }

    pub fn container_count(&self) -> usize {
        self.state.read().map(|s| s.containers.len()).unwrap_or(0)
    }
}

/// Fold one flow-table entry into the rollup. Returns true when the counters
/// went backwards and the baseline was reseeded (LRU eviction observed).
fn fold_flow(network: &mut NetworkAgg, key: &FlowKey, stats: &FlowStats, cycle: u64) -> bool {
    let baseline = network.baselines.entry(*key).or_default();
    let evicted = stats.packets < baseline.packets;

    if !evicted {
        let packets = stats.packets - baseline.packets;
        let bytes = stats.bytes - baseline.bytes;
        if stats.flags & flow_flags::OUTBOUND != 0 {
            network.packets_out += packets;
            network.bytes_out += bytes;
        } else if stats.flags & flow_flags::INBOUND != 0 {
            network.packets_in += packets;
            network.bytes_in += bytes;
        }
        network.retransmits += u64::from(stats.retransmits.saturating_sub(baseline.retransmits));

        let latency_count = stats.latency_count.saturating_sub(baseline.latency_count);
        let latency_sum = stats.latency_sum_ns.saturating_sub(baseline.latency_sum_ns);
        if latency_count > 0 {
            let mean_ms = latency_sum as f64 / latency_count as f64 / 1_000_000.0;
            network.latency_samples.push(mean_ms);
        }
    }

    *baseline = FlowBaseline {
        packets: stats.packets,
        bytes: stats.bytes,
        retransmits: stats.retransmits,
        latency_sum_ns: stats.latency_sum_ns,
        latency_count: stats.latency_count,
        seen_cycle: cycle,
    };
    evicted
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use microradar_common::status;

    use super::*;

    fn ring_with(values: &[f64]) -> SampleRing {
        let mut ring = SampleRing::default();
        for v in values {
            ring.push(*v);
        }
        ring
    }

    #[test]
    fn test_sample_ring_bounded() {
        let mut ring = SampleRing::default();
        for i in 0..250 {
            ring.push(i as f64);
        }
        assert_eq!(ring.len(), MAX_SAMPLES);
        // Oldest dropped first.
        assert_eq!(ring.to_vec()[0], 150.0);
        assert_eq!(ring.latest(), Some(249.0));
    }

    #[test]
    fn test_sample_ring_mean() {
        assert_eq!(ring_with(&[]).mean(), None);
        assert_eq!(ring_with(&[2.0, 4.0]).mean(), Some(3.0));
    }

    #[test]
    fn test_comm_str_stops_at_nul() {
        let mut comm = [0u8; 16];
        comm[..5].copy_from_slice(b"nginx");
        assert_eq!(comm_str(&comm), "nginx");
        assert_eq!(comm_str(&[0; 16]), "");
    }

    #[test]
    fn test_fallback_container_id() {
        assert_eq!(fallback_container_id(0xABCD_EF00), "abcdef00");
        assert_eq!(
            fallback_container_id(0x1234_5678_9ABC_DEF0),
            "123456789abc"
        );
    }

    #[test]
    fn test_fold_flow_accumulates_deltas() {
        let mut network = NetworkAgg::default();
        let key = FlowKey {
            protocol: 6,
            cgroup_id: 0xABCD,
            ..Default::default()
        };
        let mut stats = FlowStats {
            packets: 2,
            bytes: 160,
            flags: flow_flags::OUTBOUND,
            ..Default::default()
        };
        assert!(!fold_flow(&mut network, &key, &stats, 1));
        assert_eq!(network.packets_out, 2);
        assert_eq!(network.bytes_out, 160);

        stats.packets = 5;
        stats.bytes = 400;
        assert!(!fold_flow(&mut network, &key, &stats, 2));
        assert_eq!(network.packets_out, 5);
        assert_eq!(network.bytes_out, 400);
    }

    #[test]
    fn test_fold_flow_latency_mean() {
        let mut network = NetworkAgg::default();
        let key = FlowKey::default();
        let stats = FlowStats {
            packets: 1,
            latency_sum_ns: 5_000_000,
            latency_count: 1,
            flags: flow_flags::OUTBOUND,
            ..Default::default()
        };
        fold_flow(&mut network, &key, &stats, 1);
        assert_eq!(network.latency_samples.latest(), Some(5.0));
    }

    #[test]
    fn test_fold_flow_rebaselines_on_eviction() {
        let mut network = NetworkAgg::default();
        let key = FlowKey::default();
        let mut stats = FlowStats {
            packets: 1_000_000,
            bytes: 1_000_000,
            flags: flow_flags::OUTBOUND,
            latency_sum_ns: 1_000_000,
            latency_count: 1,
            ..Default::default()
        };
        fold_flow(&mut network, &key, &stats, 1);
        let packets_before = network.packets_out;
        let latency_len_before = network.latency_samples.len();

        // After LRU eviction the counter restarts far below the baseline.
        stats.packets = 12;
        stats.bytes = 800;
        stats.latency_sum_ns = 0;
        stats.latency_count = 0;
        assert!(fold_flow(&mut network, &key, &stats, 2));
        // No negative delta, no counted packets, latency ring untouched.
        assert_eq!(network.packets_out, packets_before);
        assert_eq!(network.latency_samples.len(), latency_len_before);

        // The next delta counts from the new baseline.
        stats.packets = 20;
        stats.bytes = 1_600;
        assert!(!fold_flow(&mut network, &key, &stats, 3));
        assert_eq!(network.packets_out, packets_before + 8);
    }

    #[test]
    fn test_handle_event_lifecycle() {
        let store = Arc::new(SnapshotStore::new());
        let agg = Aggregator::new(store, DEFAULT_TOTAL_MEMORY_BYTES, 100);

        let mut comm = [0u8; 16];
        comm[..5].copy_from_slice(b"nginx");
        let info = ContainerInfo {
            cgroup_id: 42,
            pid: 4321,
            ppid: 4321,
            status: status::CREATED,
            start_ns: 1,
            comm,
            ..Default::default()
        };
        agg.handle_event(&Event::ContainerStart {
            cgroup_id: 42,
            pid: 4321,
            timestamp_ns: 1,
            info,
        });
        assert_eq!(agg.container_count(), 1);
        assert_eq!(agg.sampling_targets(), vec![(42, 4321)]);

        agg.handle_event(&Event::CpuSample {
            cgroup_id: 42,
            pid: 4321,
            timestamp_ns: 2,
            millipercent: 155,
        });
        agg.handle_event(&Event::MemorySample {
            cgroup_id: 42,
            pid: 4321,
            timestamp_ns: 2,
            bytes: 1024,
        });

        agg.handle_event(&Event::ContainerStop {
            cgroup_id: 42,
            pid: 4321,
            timestamp_ns: 3,
            info,
        });
        // Stopped containers are no longer sampling targets.
        assert!(agg.sampling_targets().is_empty());
    }

    #[test]
    fn test_max_containers_enforced() {
        let store = Arc::new(SnapshotStore::new());
        let agg = Aggregator::new(store, DEFAULT_TOTAL_MEMORY_BYTES, 2);
        for cgroup_id in 10..20u64 {
            agg.handle_event(&Event::ContainerStart {
                cgroup_id,
                pid: cgroup_id as u32,
                timestamp_ns: 1,
                info: ContainerInfo {
                    cgroup_id,
                    pid: cgroup_id as u32,
                    ..Default::default()
                },
            });
        }
        assert_eq!(agg.container_count(), 2);
    }

    #[test]
    fn test_prune_idle_two_phase() {
        let store = Arc::new(SnapshotStore::new());
        let agg = Aggregator::new(store, DEFAULT_TOTAL_MEMORY_BYTES, 100);
        agg.handle_event(&Event::ContainerStart {
            cgroup_id: 7,
            pid: 7,
            timestamp_ns: 1,
            info: ContainerInfo {
                cgroup_id: 7,
                pid: 7,
                status: status::RUNNING,
                ..Default::default()
            },
        });

        // First sweep with a zero horizon: running container is marked
        // exited but kept.
        let removed = agg.prune_idle(Duration::ZERO);
        assert!(removed.is_empty());
        assert_eq!(agg.container_count(), 1);

        // Second sweep removes it.
        let removed = agg.prune_idle(Duration::ZERO);
        assert_eq!(removed, vec![7]);
        assert_eq!(agg.container_count(), 0);
    }

    #[test]
    fn test_host_total_memory_parses_meminfo() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("meminfo"),
            "MemTotal:       16384 kB\nMemFree:        8192 kB\n",
        )
        .unwrap();
        assert_eq!(
            Aggregator::host_total_memory(dir.path()),
            16384 * 1024
        );
        assert_eq!(
            Aggregator::host_total_memory(&dir.path().join("absent")),
            DEFAULT_TOTAL_MEMORY_BYTES
        );
    }
}
