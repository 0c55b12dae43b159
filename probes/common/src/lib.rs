// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Types shared between the kernel probes and the userspace loader.
//!
//! Everything that crosses an eBPF map or ring buffer is declared here as a
//! `#[repr(C)]` POD with explicit padding, so both sides agree on layout.
//! The `user` feature adds `aya::Pod` impls for the loader; the kernel
//! programs consume this crate with no features and no dependencies.

#![no_std]

/// Capacity of the cgroup-id → container table (LRU).
pub const CONTAINER_TABLE_CAPACITY: u32 = 1_000;
/// Capacity of the pid → cgroup-id table (LRU).
pub const PID_TO_CGROUP_CAPACITY: u32 = 10_000;
/// Capacity of the flow table (LRU).
pub const FLOW_TABLE_CAPACITY: u32 = 10_240;
/// Capacity of the pending-latency table (LRU).
pub const LATENCY_PENDING_CAPACITY: u32 = 10_240;
/// Byte size of the lifecycle event ring buffer.
pub const LIFECYCLE_RING_BYTES: u32 = 256 * 1024;
/// Byte size of the network event ring buffer.
pub const NETWORK_RING_BYTES: u32 = 512 * 1024;
/// Slots in each per-object counter array.
pub const COUNTERS_CAPACITY: u32 = 30;

/// Counter array indices. Both probe objects carry their own counter array
/// with the same index layout; userspace sums them where that makes sense
/// (dropped events) and reads per-object where it does not.
pub mod counter {
    /// Ring-buffer reservation failures.
    pub const DROPPED_EVENTS: u32 = 0;
    /// Records successfully submitted to the ring buffer.
    pub const EVENTS_EMITTED: u32 = 1;
    /// Packets inspected by the TC programs.
    pub const PACKETS_SEEN: u32 = 2;
    /// Packets passed through without counting (non-IPv4, non-TCP/UDP).
    pub const PACKETS_SKIPPED: u32 = 3;
    /// TCP retransmissions observed.
    pub const RETRANSMITS: u32 = 4;
}

/// Event record tags.
pub mod tag {
    pub const CONTAINER_START: u32 = 1;
    pub const CONTAINER_STOP: u32 = 2;
    pub const NETWORK_PACKET: u32 = 3;
    pub const CPU_SAMPLE: u32 = 4;
    pub const MEMORY_SAMPLE: u32 = 5;
}

/// Container status values as stored in the kernel table.
pub mod status {
    pub const CREATED: u32 = 0;
    pub const RUNNING: u32 = 1;
    pub const PAUSED: u32 = 2;
    pub const STOPPED: u32 = 3;
    pub const EXITED: u32 = 4;
}

/// Flow flag bits.
pub mod flow_flags {
    pub const INBOUND: u32 = 0x1;
    pub const OUTBOUND: u32 = 0x2;
    pub const RETRANSMIT: u32 = 0x4;
}

/// Identifies one flow: the 5-tuple plus the owning cgroup.
///
/// Addresses and ports are carried in network byte order as observed on the
/// wire; endianness is normalized only at exposition time.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    /// Must be zeroed by every producer: the key is hashed bytewise.
    pub _pad: [u8; 3],
    pub cgroup_id: u64,
}

const _: () = assert!(core::mem::size_of::<FlowKey>() == 24);

/// Per-flow counters. All counter fields are updated with atomic
/// fetch-and-add from kernel contexts and read without locking by the one
/// userspace poller.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct FlowStats {
    pub packets: u64,
    pub bytes: u64,
    pub latency_sum_ns: u64,
    pub latency_count: u64,
    pub last_seen_ns: u64,
    pub retransmits: u32,
    pub flags: u32,
}

const _: () = assert!(core::mem::size_of::<FlowStats>() == 48);

/// Kernel-side view of a container.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ContainerInfo {
    pub cgroup_id: u64,
    /// Creation timestamp, nanoseconds since boot.
    pub start_ns: u64,
    /// Last memory reading in bytes. Zero until the first sample.
    pub memory_bytes: u64,
    /// Primary pid (the task that cloned into the cgroup first).
    pub pid: u32,
    pub ppid: u32,
    /// One of the `status` module values.
    pub status: u32,
    /// CPU usage in millipercent of one core. Zero until the first sample.
    pub cpu_millipercent: u32,
    /// Process name, NUL padded.
    pub comm: [u8; 16],
    /// Cgroup id rendered as 16 lowercase hex characters.
    pub id_hex: [u8; 16],
}

const _: () = assert!(core::mem::size_of::<ContainerInfo>() == 72);

impl Default for ContainerInfo {
    fn default() -> Self {
        Self {
            cgroup_id: 0,
            start_ns: 0,
            memory_bytes: 0,
            pid: 0,
            ppid: 0,
            status: status::CREATED,
            cpu_millipercent: 0,
            comm: [0; 16],
            id_hex: [0; 16],
        }
    }
}

/// Payload of an [`EventRecord`], interpreted according to the record tag.
#[repr(C)]
#[derive(Clone, Copy)]
pub union EventPayload {
    pub container: ContainerInfo,
    pub flow: FlowStats,
    pub value: u64,
    pub raw: [u8; 72],
}

const _: () = assert!(core::mem::size_of::<EventPayload>() == 72);

/// Fixed-size record reserved directly on the ring buffer. No pointers, no
/// secondary allocation.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct EventRecord {
    /// One of the `tag` module values.
    pub tag: u32,
    pub pid: u32,
    /// Nanoseconds since boot at emission.
    pub timestamp_ns: u64,
    pub cgroup_id: u64,
    pub _reserved: u64,
    pub payload: EventPayload,
}

pub const EVENT_RECORD_BYTES: usize = 104;
const _: () = assert!(core::mem::size_of::<EventRecord>() == EVENT_RECORD_BYTES);

impl EventRecord {
    /// A zeroed record with the header filled in. Callers overwrite the
    /// payload for tags that carry one.
    pub fn header(tag: u32, pid: u32, timestamp_ns: u64, cgroup_id: u64) -> Self {
        Self {
            tag,
            pid,
            timestamp_ns,
            cgroup_id,
            _reserved: 0,
            payload: EventPayload { raw: [0; 72] },
        }
    }
}

/// Render a cgroup id as 16 lowercase hex characters, most significant
/// nibble first. Shared so the kernel table and the userspace fallback agree
/// byte for byte.
pub fn cgroup_id_hex(id: u64) -> [u8; 16] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = [0u8; 16];
    let mut i = 0;
    while i < 16 {
        let shift = 60 - i * 4;
        out[i] = DIGITS[((id >> shift) & 0xf) as usize];
        i += 1;
    }
    out
}

#[cfg(feature = "user")]
mod pod {
    use super::{ContainerInfo, EventRecord, FlowKey, FlowStats};

    // SAFETY: all four are #[repr(C)] with explicit padding and every bit
    // pattern is a valid value.
    unsafe impl aya::Pod for FlowKey {}
    unsafe impl aya::Pod for FlowStats {}
    unsafe impl aya::Pod for ContainerInfo {}
    unsafe impl aya::Pod for EventRecord {}
}
