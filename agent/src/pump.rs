// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Ring-buffer event pump.
//!
//! One drain per tick per buffer, bounded by a record budget so a flooded
//! buffer cannot monopolize the task. Undrained records wait for the next
//! tick; under sustained overflow the kernel side drops at reservation time
//! and the drop counter rises, which is the intended degradation path.
//! Decode failures are counted, logged at most once a minute, and never
//! retried. Cancellation is checked between records, never mid-record.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::watch;

use crate::aggregate::Aggregator;
use crate::budget::PoolSet;
use crate::errors::LogThrottle;
use crate::events;

/// Records consumed per tick per buffer.
pub const DRAIN_BUDGET: usize = 256;
/// Default pump tick.
pub const TICK: Duration = Duration::from_millis(100);

/// One ring buffer's worth of raw records. The aya ring buffer implements
/// this; tests drive the pump with vectors.
pub trait RecordSource {
    /// Copy the next record into `buf` (cleared first). Returns false when
    /// the buffer is currently empty.
    fn next_record(&mut self, buf: &mut Vec<u8>) -> bool;
}

impl RecordSource for aya::maps::RingBuf<aya::maps::MapData> {
    fn next_record(&mut self, buf: &mut Vec<u8>) -> bool {
        match self.next() {
            Some(item) => {
                buf.clear();
                buf.extend_from_slice(&item);
                true
            }
            None => false,
        }
    }
}

/// Shared pump counters, read by the aggregator when it assembles snapshots.
#[derive(Default)]
pub struct PumpStats {
    decode_failures: AtomicU64,
}

impl PumpStats {
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }
}

pub struct EventPump {
    aggregator: Arc<Aggregator>,
    pools: Arc<PoolSet>,
    stats: Arc<PumpStats>,
    throttle: LogThrottle,
}

impl EventPump {
    pub fn new(aggregator: Arc<Aggregator>, pools: Arc<PoolSet>, stats: Arc<PumpStats>) -> Self {
        Self {
            aggregator,
            pools,
            stats,
            throttle: LogThrottle::per_minute(),
        }
    }

    /// Drain up to `budget` records from one buffer. Returns the number of
    /// records consumed.
    pub fn drain(&self, source: &mut impl RecordSource, budget: usize) -> usize {
        let mut buf = self.pools.event_payloads.get();
        let mut consumed = 0;
        while consumed < budget {
            if !source.next_record(&mut buf) {
                break;
            }
            consumed += 1;
            match events::decode(&buf) {
                Ok(event) => self.aggregator.handle_event(&event),
                Err(err) => {
                    self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                    if self.throttle.should_log(err.kind()) {
                        warn!("dropping undecodable record: {err}");
                    }
                }
            }
        }
        self.pools.event_payloads.put(buf);
        consumed
    }

    /// Run until shutdown, draining both buffers once per tick, lifecycle
    /// first.
    pub async fn run(
        self,
        mut lifecycle: impl RecordSource,
        mut network: impl RecordSource,
        tick: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let consumed = self.drain(&mut lifecycle, DRAIN_BUDGET)
                        + self.drain(&mut network, DRAIN_BUDGET);
                    if consumed > 0 {
                        debug!("pump consumed {consumed} records");
                    }
                }
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
    use std::collections::VecDeque;
    use std::sync::Arc;

    use microradar_common::{ContainerInfo, EventPayload, EventRecord, tag};

    use super::*;
    use crate::aggregate::{Aggregator, DEFAULT_TOTAL_MEMORY_BYTES};
    use crate::events::encode;
    use crate::snapshot::SnapshotStore;

    struct VecSource(VecDeque<Vec<u8>>);

    impl RecordSource for VecSource {
        fn next_record(&mut self, buf: &mut Vec<u8>) -> bool {
            match self.0.pop_front() {
                Some(record) => {
                    buf.clear();
                    buf.extend_from_slice(&record);
                    true
                }
                None => false,
            }
        }
    }

    fn start_record(cgroup_id: u64, pid: u32) -> Vec<u8> {
        let mut record = EventRecord::header(tag::CONTAINER_START, pid, 1, cgroup_id);
        record.payload = EventPayload {
            container: ContainerInfo {
                cgroup_id,
                pid,
                ..Default::default()
            },
        };
        encode(&record)
    }

    fn pump() -> (EventPump, Arc<Aggregator>, Arc<PumpStats>) {
        let store = Arc::new(SnapshotStore::new());
        let aggregator = Arc::new(Aggregator::new(store, DEFAULT_TOTAL_MEMORY_BYTES, 1_000));
        let pools = Arc::new(PoolSet::new());
        let stats = Arc::new(PumpStats::default());
        (
            EventPump::new(aggregator.clone(), pools, stats.clone()),
            aggregator,
            stats,
        )
    }

    #[test]
    fn test_drain_dispatches_and_counts() {
        let (pump, aggregator, stats) = pump();
        let mut source = VecSource(VecDeque::from([
            start_record(10, 100),
            start_record(11, 101),
            vec![0u8; 8],
        ]));
        let consumed = pump.drain(&mut source, DRAIN_BUDGET);
        assert_eq!(consumed, 3);
        assert_eq!(aggregator.container_count(), 2);
        assert_eq!(stats.decode_failures(), 1);
    }

    #[test]
    fn test_drain_respects_budget() {
        let (pump, aggregator, _) = pump();
        let records: VecDeque<Vec<u8>> =
            (0..20u64).map(|i| start_record(100 + i, 1)).collect();
        let mut source = VecSource(records);
        let consumed = pump.drain(&mut source, 5);
        assert_eq!(consumed, 5);
        assert_eq!(aggregator.container_count(), 5);
        // Next tick resumes where this one stopped.
        let consumed = pump.drain(&mut source, 100);
        assert_eq!(consumed, 15);
        assert_eq!(aggregator.container_count(), 20);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (pump, _, _) = pump();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(pump.run(
            VecSource(VecDeque::new()),
            VecSource(VecDeque::new()),
            Duration::from_millis(5),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
