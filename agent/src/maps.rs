// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Typed userspace view over the kernel maps.
//!
//! The loader owns two probe objects (lifecycle, network); this module builds
//! the union of their map specifications into one [`KernelMaps`] handle plus
//! the two ring buffers the pump consumes. Map names must be disjoint across
//! the objects.

use aya::maps::{Array, HashMap as AyaHashMap, Map, MapData, RingBuf};
use aya::Ebpf;
use microradar_common::{
    ContainerInfo, FlowKey, FlowStats, CONTAINER_TABLE_CAPACITY, COUNTERS_CAPACITY,
    FLOW_TABLE_CAPACITY, LATENCY_PENDING_CAPACITY, LIFECYCLE_RING_BYTES, NETWORK_RING_BYTES,
    PID_TO_CGROUP_CAPACITY,
};

use crate::errors::Error;

pub const CONTAINER_TABLE: &str = "CONTAINER_TABLE";
pub const PID_TO_CGROUP: &str = "PID_TO_CGROUP";
pub const FLOW_TABLE: &str = "FLOW_TABLE";
pub const LATENCY_PENDING: &str = "LATENCY_PENDING";
pub const LIFECYCLE_EVENTS: &str = "LIFECYCLE_EVENTS";
pub const NETWORK_EVENTS: &str = "NETWORK_EVENTS";
pub const LIFECYCLE_COUNTERS: &str = "LIFECYCLE_COUNTERS";
pub const NETWORK_COUNTERS: &str = "NETWORK_COUNTERS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    LruHash,
    RingBuffer,
    Array,
}

impl MapKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MapKind::LruHash => "lru_hash",
            MapKind::RingBuffer => "ring_buffer",
            MapKind::Array => "array",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MapSpec {
    pub name: &'static str,
    pub kind: MapKind,
    /// Entries for hash/array maps, bytes for ring buffers.
    pub capacity: u32,
}

/// The full map specification, the union of both probe objects.
pub const MAP_SPECS: &[MapSpec] = &[
    MapSpec {
        name: CONTAINER_TABLE,
        kind: MapKind::LruHash,
        capacity: CONTAINER_TABLE_CAPACITY,
    },
    MapSpec {
        name: PID_TO_CGROUP,
        kind: MapKind::LruHash,
        capacity: PID_TO_CGROUP_CAPACITY,
    },
    MapSpec {
        name: LIFECYCLE_EVENTS,
        kind: MapKind::RingBuffer,
        capacity: LIFECYCLE_RING_BYTES,
    },
    MapSpec {
        name: LIFECYCLE_COUNTERS,
        kind: MapKind::Array,
        capacity: COUNTERS_CAPACITY,
    },
    MapSpec {
        name: FLOW_TABLE,
        kind: MapKind::LruHash,
        capacity: FLOW_TABLE_CAPACITY,
    },
    MapSpec {
        name: LATENCY_PENDING,
        kind: MapKind::LruHash,
        capacity: LATENCY_PENDING_CAPACITY,
    },
    MapSpec {
        name: NETWORK_EVENTS,
        kind: MapKind::RingBuffer,
        capacity: NETWORK_RING_BYTES,
    },
    MapSpec {
        name: NETWORK_COUNTERS,
        kind: MapKind::Array,
        capacity: COUNTERS_CAPACITY,
    },
];

/// Read access to the authoritative kernel tables, behind a trait so the
/// aggregator and reaper can be driven by a synthetic source in tests.
///
/// Any single read is a slightly stale snapshot; counters only move forward
/// between LRU evictions, and the consumers re-baseline on decreases.
pub trait TelemetrySource {
    /// Fill `out` (cleared first) with the container table contents. Scratch
    /// vectors come from the pool set so steady-state polling is
    /// allocation-free.
    fn containers_into(&mut self, out: &mut Vec<(u64, ContainerInfo)>) -> Result<(), Error>;
    /// Fill `out` (cleared first) with the flow table contents.
    fn flows_into(&mut self, out: &mut Vec<(FlowKey, FlowStats)>) -> Result<(), Error>;
    /// Sum of both probe objects' ring reservation failures.
    fn dropped_events(&mut self) -> u64;
    /// Best-effort delete; LRU eviction reclaims entries we miss.
    fn remove_container(&mut self, cgroup_id: u64);
    fn remove_flow(&mut self, key: &FlowKey);
    fn map_count(&self) -> usize;
    /// Drop pending-latency entries that were never paired. Advisory, like
    /// the other deletions.
    fn prune_pending(&mut self, _now_ns: u64, _horizon_ns: u64) {}
}

pub struct KernelMaps {
    containers: AyaHashMap<MapData, u64, ContainerInfo>,
    flows: AyaHashMap<MapData, FlowKey, FlowStats>,
    latency_pending: AyaHashMap<MapData, FlowKey, u64>,
    lifecycle_counters: Array<MapData, u64>,
    network_counters: Array<MapData, u64>,
}

impl KernelMaps {
    /// Take ownership of the maps from both loaded objects. Returns the
    /// typed handle plus the two ring buffers, lifecycle first.
    pub fn take(
        lifecycle: &mut Ebpf,
        network: &mut Ebpf,
    ) -> Result<(Self, RingBuf<MapData>, RingBuf<MapData>), Error> {
        check_disjoint(lifecycle, network)?;

        let containers = AyaHashMap::try_from(take_map(lifecycle, CONTAINER_TABLE)?)
            .map_err(|e| map_error(CONTAINER_TABLE, &e))?;
        let lifecycle_counters = Array::try_from(take_map(lifecycle, LIFECYCLE_COUNTERS)?)
            .map_err(|e| map_error(LIFECYCLE_COUNTERS, &e))?;
        let lifecycle_events = RingBuf::try_from(take_map(lifecycle, LIFECYCLE_EVENTS)?)
            .map_err(|e| map_error(LIFECYCLE_EVENTS, &e))?;

        let flows = AyaHashMap::try_from(take_map(network, FLOW_TABLE)?)
            .map_err(|e| map_error(FLOW_TABLE, &e))?;
        let latency_pending = AyaHashMap::try_from(take_map(network, LATENCY_PENDING)?)
            .map_err(|e| map_error(LATENCY_PENDING, &e))?;
        let network_counters = Array::try_from(take_map(network, NETWORK_COUNTERS)?)
            .map_err(|e| map_error(NETWORK_COUNTERS, &e))?;
        let network_events = RingBuf::try_from(take_map(network, NETWORK_EVENTS)?)
            .map_err(|e| map_error(NETWORK_EVENTS, &e))?;

        Ok((
            Self {
                containers,
                flows,
                latency_pending,
                lifecycle_counters,
                network_counters,
            },
            lifecycle_events,
            network_events,
        ))
    }

    fn counter(array: &Array<MapData, u64>, index: u32) -> u64 {
        array.get(&index, 0).unwrap_or(0)
    }

    /// Pending-latency entries the tcp_probe tracepoint never paired. The
    /// reaper clears them alongside idle flows; LRU eviction covers the
    /// rest.
    pub fn prune_latency_pending(&mut self, now_ns: u64, horizon_ns: u64) -> usize {
        let stale: Vec<FlowKey> = self
            .latency_pending
            .iter()
            .filter_map(|entry| entry.ok())
            .filter(|(_, sent_ns)| now_ns.saturating_sub(*sent_ns) > horizon_ns)
            .map(|(key, _)| key)
            .collect();
        let count = stale.len();
        for key in stale {
            let _ = self.latency_pending.remove(&key);
        }
        count
    }
}

impl TelemetrySource for KernelMaps {
    fn containers_into(&mut self, out: &mut Vec<(u64, ContainerInfo)>) -> Result<(), Error> {
        out.clear();
        for entry in self.containers.iter() {
            let pair = entry.map_err(|e| Error::MapAccess {
                context: format!("{CONTAINER_TABLE} iteration: {e}"),
            })?;
            out.push(pair);
        }
        Ok(())
    }

    fn flows_into(&mut self, out: &mut Vec<(FlowKey, FlowStats)>) -> Result<(), Error> {
        out.clear();
        for entry in self.flows.iter() {
            let pair = entry.map_err(|e| Error::MapAccess {
                context: format!("{FLOW_TABLE} iteration: {e}"),
            })?;
            out.push(pair);
        }
        Ok(())
    }

    fn dropped_events(&mut self) -> u64 {
        Self::counter(&self.lifecycle_counters, microradar_common::counter::DROPPED_EVENTS)
            + Self::counter(&self.network_counters, microradar_common::counter::DROPPED_EVENTS)
    }

    fn remove_container(&mut self, cgroup_id: u64) {
        let _ = self.containers.remove(&cgroup_id);
    }

    fn remove_flow(&mut self, key: &FlowKey) {
        let _ = self.flows.remove(key);
    }

    fn map_count(&self) -> usize {
        MAP_SPECS.len()
    }

    fn prune_pending(&mut self, now_ns: u64, horizon_ns: u64) {
        self.prune_latency_pending(now_ns, horizon_ns);
    }
}

fn take_map(obj: &mut Ebpf, name: &str) -> Result<Map, Error> {
    obj.take_map(name).ok_or_else(|| Error::MapAccess {
        context: format!("probe object does not define map {name}"),
    })
}

fn map_error(name: &str, err: &dyn std::fmt::Display) -> Error {
    Error::MapAccess {
        context: format!("{name}: {err}"),
    }
}

/// The two objects must not both define a map of the same name: shared state
/// would silently diverge since each object gets its own fd.
fn check_disjoint(lifecycle: &Ebpf, network: &Ebpf) -> Result<(), Error> {
    let lifecycle_names: Vec<String> = lifecycle.maps().map(|(name, _)| name.to_string()).collect();
    for (name, _) in network.maps() {
        // Every object carries hidden .rodata/.bss sections; only reject
        // collisions on our declared maps.
        if MAP_SPECS.iter().any(|spec| spec.name == name) && lifecycle_names.iter().any(|n| n == name)
        {
            return Err(Error::MapAccess {
                context: format!("map {name} defined by both probe objects"),
            });
        }
    }
    Ok(())
}

/// Static bytes pinned by the kernel maps at their declared capacities,
/// counted against the soft memory cap.
pub fn static_map_bytes() -> u64 {
    let key_value_bytes = |name: &str| -> u64 {
        match name {
            CONTAINER_TABLE => (8 + std::mem::size_of::<ContainerInfo>()) as u64,
            PID_TO_CGROUP => 4 + 8,
            FLOW_TABLE => {
                (std::mem::size_of::<FlowKey>() + std::mem::size_of::<FlowStats>()) as u64
            }
            LATENCY_PENDING => (std::mem::size_of::<FlowKey>() + 8) as u64,
            _ => 8,
        }
    };
    MAP_SPECS
        .iter()
        .map(|spec| match spec.kind {
            MapKind::RingBuffer => u64::from(spec.capacity),
            MapKind::Array => u64::from(spec.capacity) * 8,
            MapKind::LruHash => u64::from(spec.capacity) * key_value_bytes(spec.name),
        })
        .sum()
}

/// Monotonic clock in nanoseconds, the same clock the kernel programs stamp
/// records with (`bpf_ktime_get_ns`).
#[cfg(target_os = "linux")]
pub fn monotonic_now_ns() -> u64 {
    use nix::time::{clock_gettime, ClockId};
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as u64) * 1_000_000_000 + ts.tv_nsec() as u64,
        Err(_) => 0,
    }
}

#[cfg(not(target_os = "linux"))]
pub fn monotonic_now_ns() -> u64 {
    0
}
