// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Ring-buffer record decoding.
//!
//! Records are fixed-size PODs written by the kernel programs. Decoding maps
//! the tag onto a closed enum so every consumer dispatch is exhaustive at the
//! type level; an unknown tag or a short record is a [`Error::Decode`].

use microradar_common::{tag, ContainerInfo, EventRecord, FlowStats, EVENT_RECORD_BYTES};

use crate::errors::Error;

#[derive(Debug, Clone, Copy)]
pub enum Event {
    ContainerStart {
        cgroup_id: u64,
        pid: u32,
        timestamp_ns: u64,
        info: ContainerInfo,
    },
    ContainerStop {
        cgroup_id: u64,
        pid: u32,
        timestamp_ns: u64,
        info: ContainerInfo,
    },
    NetworkPacket {
        cgroup_id: u64,
        timestamp_ns: u64,
        stats: FlowStats,
    },
    CpuSample {
        cgroup_id: u64,
        pid: u32,
        timestamp_ns: u64,
        millipercent: u64,
    },
    MemorySample {
        cgroup_id: u64,
        pid: u32,
        timestamp_ns: u64,
        bytes: u64,
    },
}

impl Event {
    pub fn cgroup_id(&self) -> u64 {
        match self {
            Event::ContainerStart { cgroup_id, .. }
            | Event::ContainerStop { cgroup_id, .. }
            | Event::NetworkPacket { cgroup_id, .. }
            | Event::CpuSample { cgroup_id, .. }
            | Event::MemorySample { cgroup_id, .. } => *cgroup_id,
        }
    }
}

pub fn decode(bytes: &[u8]) -> Result<Event, Error> {
    if bytes.len() < EVENT_RECORD_BYTES {
        return Err(Error::Decode {
            reason: format!(
                "short record: {} bytes, expected {}",
                bytes.len(),
                EVENT_RECORD_BYTES
            ),
        });
    }

    // SAFETY: length checked above; EventRecord is a POD for which any bit
    // pattern is a value, and read_unaligned has no alignment requirement.
    let record: EventRecord =
        unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const EventRecord) };

    // SAFETY: the union field read is selected by the record tag, matching
    // what the producer wrote.
    unsafe {
        match record.tag {
            tag::CONTAINER_START => Ok(Event::ContainerStart {
                cgroup_id: record.cgroup_id,
                pid: record.pid,
                timestamp_ns: record.timestamp_ns,
                info: record.payload.container,
            }),
            tag::CONTAINER_STOP => Ok(Event::ContainerStop {
                cgroup_id: record.cgroup_id,
                pid: record.pid,
                timestamp_ns: record.timestamp_ns,
                info: record.payload.container,
            }),
            tag::NETWORK_PACKET => Ok(Event::NetworkPacket {
                cgroup_id: record.cgroup_id,
                timestamp_ns: record.timestamp_ns,
                stats: record.payload.flow,
            }),
            tag::CPU_SAMPLE => Ok(Event::CpuSample {
                cgroup_id: record.cgroup_id,
                pid: record.pid,
                timestamp_ns: record.timestamp_ns,
                millipercent: record.payload.value,
            }),
            tag::MEMORY_SAMPLE => Ok(Event::MemorySample {
                cgroup_id: record.cgroup_id,
                pid: record.pid,
                timestamp_ns: record.timestamp_ns,
                bytes: record.payload.value,
            }),
            other => Err(Error::Decode {
                reason: format!("unknown tag {other}"),
            }),
        }
    }
}

#[cfg(test)]
pub(crate) fn encode(record: &EventRecord) -> Vec<u8> {
    // SAFETY: EventRecord is a POD with no padding holes beyond those the
    // layout declares explicitly.
    unsafe {
        std::slice::from_raw_parts(record as *const EventRecord as *const u8, EVENT_RECORD_BYTES)
    }
    .to_vec()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use microradar_common::{status, EventPayload};

    use super::*;

    #[test]
    fn test_decode_container_start() {
        let info = ContainerInfo {
            cgroup_id: 0xABCD_EF00,
            start_ns: 42,
            pid: 4321,
            ppid: 4321,
            status: status::CREATED,
            ..Default::default()
        };
        let mut record = EventRecord::header(tag::CONTAINER_START, 4321, 42, 0xABCD_EF00);
        record.payload = EventPayload { container: info };

        match decode(&encode(&record)).unwrap() {
            Event::ContainerStart {
                cgroup_id,
                pid,
                timestamp_ns,
                info,
            } => {
                assert_eq!(cgroup_id, 0xABCD_EF00);
                assert_eq!(pid, 4321);
                assert_eq!(timestamp_ns, 42);
                assert_eq!(info.status, status::CREATED);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_decode_network_packet() {
        let stats = FlowStats {
            packets: 2,
            bytes: 160,
            retransmits: 1,
            ..Default::default()
        };
        let mut record = EventRecord::header(tag::NETWORK_PACKET, 0, 7, 0xDEAD);
        record.payload = EventPayload { flow: stats };

        match decode(&encode(&record)).unwrap() {
            Event::NetworkPacket {
                cgroup_id, stats, ..
            } => {
                assert_eq!(cgroup_id, 0xDEAD);
                assert_eq!(stats.packets, 2);
                assert_eq!(stats.bytes, 160);
                assert_eq!(stats.retransmits, 1);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_decode_scalar_samples() {
        let mut record = EventRecord::header(tag::CPU_SAMPLE, 10, 1, 5);
        record.payload = EventPayload { value: 1_500 };
        match decode(&encode(&record)).unwrap() {
            Event::CpuSample { millipercent, .. } => assert_eq!(millipercent, 1_500),
            other => panic!("wrong variant: {other:?}"),
        }

        let mut record = EventRecord::header(tag::MEMORY_SAMPLE, 10, 1, 5);
        record.payload = EventPayload { value: 64 * 1024 };
        match decode(&encode(&record)).unwrap() {
            Event::MemorySample { bytes, .. } => assert_eq!(bytes, 64 * 1024),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_tag_is_decode_error() {
        let record = EventRecord::header(99, 0, 0, 0);
        let err = decode(&encode(&record)).unwrap_err();
        assert_eq!(err.kind(), "decode");
    }

    #[test]
    fn test_short_record_is_decode_error() {
        let err = decode(&[0u8; 16]).unwrap_err();
        assert_eq!(err.kind(), "decode");
    }
}
