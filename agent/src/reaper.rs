// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Stale-state reaper.
//!
//! Two horizons: the short horizon (2× the sampling window) ages out idle
//! aggregation entries and, best effort, their kernel table entries; the
//! long horizon (10 minutes) additionally resets every sample window.
//! Kernel-side deletion is advisory — LRU eviction reclaims whatever the
//! reaper misses.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use microradar_common::FlowKey;
use tokio::sync::watch;

use crate::aggregate::{Aggregator, WINDOW};
use crate::budget::PoolSet;
use crate::maps::TelemetrySource;

pub const SHORT_HORIZON: Duration = Duration::from_secs(2 * WINDOW.as_secs());
pub const LONG_HORIZON: Duration = Duration::from_secs(600);

pub struct Reaper {
    aggregator: Arc<Aggregator>,
    pools: Arc<PoolSet>,
    short_horizon: Duration,
    long_horizon: Duration,
}

impl Reaper {
    pub fn new(aggregator: Arc<Aggregator>, pools: Arc<PoolSet>) -> Self {
        Self {
            aggregator,
            pools,
            short_horizon: SHORT_HORIZON,
            long_horizon: LONG_HORIZON,
        }
    }

    #[cfg(test)]
    fn with_horizons(mut self, short: Duration, long: Duration) -> Self {
        self.short_horizon = short;
        self.long_horizon = long;
        self
    }

    /// Short sweep: drop idle aggregation entries and mirror the deletions
    /// into the kernel tables.
    pub fn sweep(&self, source: &mut dyn TelemetrySource, now_ns: u64) {
        let removed = self.aggregator.prune_idle(self.short_horizon);
        for cgroup_id in &removed {
            source.remove_container(*cgroup_id);
        }
        if !removed.is_empty() {
            debug!("reaped {} idle containers", removed.len());
        }

        // Kernel flows idle beyond the horizon, by their own last-seen
        // stamps (CLOCK_MONOTONIC, same clock as `now_ns`).
        let horizon_ns = self.short_horizon.as_nanos() as u64;
        let mut scratch = self.pools.flow_scratch.get();
        let mut stale_keys: Vec<FlowKey> = self.pools.flow_keys.get();
        stale_keys.clear();
        if source.flows_into(&mut scratch).is_ok() {
            for (key, stats) in &scratch {
                if now_ns.saturating_sub(stats.last_seen_ns) > horizon_ns {
                    stale_keys.push(*key);
                }
            }
            for key in &stale_keys {
                source.remove_flow(key);
            }
            if !stale_keys.is_empty() {
                debug!("reaped {} idle flows", stale_keys.len());
            }
        }
        source.prune_pending(now_ns, horizon_ns);
        self.pools.flow_scratch.put(scratch);
        self.pools.flow_keys.put(stale_keys);
    }

    /// Long sweep: everything the short sweep does, plus a window reset.
    pub fn full_sweep(&self, source: &mut dyn TelemetrySource, now_ns: u64) {
        self.sweep(source, now_ns);
        self.aggregator.reset_windows();
    }

    /// Run until shutdown. The short sweep runs once per window, the full
    /// sweep once per long horizon.
    pub async fn run(
        self,
        mut source: impl TelemetrySource,
        now_ns: impl Fn() -> u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut short_tick = tokio::time::interval(WINDOW);
        let mut long_tick = tokio::time::interval(self.long_horizon);
        // Both fire immediately on the first tick; skip those.
        short_tick.tick().await;
        long_tick.tick().await;
        loop {
            tokio::select! {
                _ = long_tick.tick() => self.full_sweep(&mut source, now_ns()),
                _ = short_tick.tick() => self.sweep(&mut source, now_ns()),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use std::sync::Arc;

    use microradar_common::{ContainerInfo, FlowStats, status};

    use super::*;
    use crate::aggregate::DEFAULT_TOTAL_MEMORY_BYTES;
    use crate::errors::Error;
    use crate::events::Event;
    use crate::snapshot::SnapshotStore;

    #[derive(Default)]
    struct FakeSource {
        containers: Vec<(u64, ContainerInfo)>,
        flows: Vec<(FlowKey, FlowStats)>,
        removed_containers: Vec<u64>,
        removed_flows: Vec<FlowKey>,
    }

    impl TelemetrySource for FakeSource {
        fn containers_into(&mut self, out: &mut Vec<(u64, ContainerInfo)>) -> Result<(), Error> {
            out.clear();
            out.extend_from_slice(&self.containers);
            Ok(())
        }

        fn flows_into(&mut self, out: &mut Vec<(FlowKey, FlowStats)>) -> Result<(), Error> {
            out.clear();
            out.extend_from_slice(&self.flows);
            Ok(())
        }

        fn dropped_events(&mut self) -> u64 {
            0
        }

        fn remove_container(&mut self, cgroup_id: u64) {
            self.removed_containers.push(cgroup_id);
            self.containers.retain(|(id, _)| *id != cgroup_id);
        }

        fn remove_flow(&mut self, key: &FlowKey) {
            self.removed_flows.push(*key);
            self.flows.retain(|(k, _)| k != key);
        }

        fn map_count(&self) -> usize {
            8
        }
    }

    fn reaper() -> (Reaper, Arc<Aggregator>, Arc<PoolSet>) {
        let store = Arc::new(SnapshotStore::new());
        let aggregator = Arc::new(Aggregator::new(store, DEFAULT_TOTAL_MEMORY_BYTES, 100));
        let pools = Arc::new(PoolSet::new());
        let reaper = Reaper::new(aggregator.clone(), pools.clone())
            .with_horizons(Duration::ZERO, Duration::ZERO);
        (reaper, aggregator, pools)
    }

    #[test]
    fn test_sweep_removes_stopped_containers_from_kernel() {
        let (reaper, aggregator, _) = reaper();
        aggregator.handle_event(&Event::ContainerStart {
            cgroup_id: 5,
            pid: 5,
            timestamp_ns: 1,
            info: ContainerInfo {
                cgroup_id: 5,
                pid: 5,
                status: status::STOPPED,
                ..Default::default()
            },
        });

        let mut source = FakeSource::default();
        reaper.sweep(&mut source, 0);
        assert_eq!(source.removed_containers, vec![5]);
        assert_eq!(aggregator.container_count(), 0);
    }

    #[test]
    fn test_sweep_removes_idle_kernel_flows() {
        let (reaper, _, _) = reaper();
        let fresh = FlowKey {
            src_port: 1,
            ..Default::default()
        };
        let stale = FlowKey {
            src_port: 2,
            ..Default::default()
        };
        let mut source = FakeSource {
            flows: vec![
                (
                    fresh,
                    FlowStats {
                        last_seen_ns: 1_000,
                        ..Default::default()
                    },
                ),
                (
                    stale,
                    FlowStats {
                        last_seen_ns: 0,
                        ..Default::default()
                    },
                ),
            ],
            ..Default::default()
        };
        // Zero horizon: anything older than "now" is stale.
        reaper.sweep(&mut source, 1_000);
        assert_eq!(source.removed_flows, vec![stale]);
        assert_eq!(source.flows.len(), 1);
    }
}
