// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Per-flow network telemetry probes.
//!
//! # Attach points
//! - TC ingress/egress classifiers: parse Ethernet+IPv4, count packets and
//!   bytes per flow, record egress timestamps for RTT pairing. Always pass.
//! - `tcp_retransmit_skb` (kprobe): per-flow retransmit accounting.
//! - `tcp/tcp_probe` tracepoint: RTT computed against the pending-latency
//!   table written on egress.
//!
//! Only IPv4 TCP/UDP is parsed; everything else passes untouched and is
//! counted under the skipped-packets counter. Flow keys carry addresses and
//! ports in network byte order as observed on the wire.

#![no_std]
#![no_main]

use core::mem;
use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use aya_ebpf::{
    bindings::TC_ACT_OK,
    helpers::{bpf_get_current_cgroup_id, bpf_ktime_get_ns, bpf_probe_read_kernel},
    macros::{classifier, kprobe, map, tracepoint},
    maps::{Array, LruHashMap, RingBuf},
    programs::{ProbeContext, TcContext, TracePointContext},
};
use microradar_common::{
    counter, flow_flags, tag, EventPayload, EventRecord, FlowKey, FlowStats, COUNTERS_CAPACITY,
    FLOW_TABLE_CAPACITY, LATENCY_PENDING_CAPACITY, NETWORK_RING_BYTES,
};

#[map]
static FLOW_TABLE: LruHashMap<FlowKey, FlowStats> =
    LruHashMap::with_max_entries(FLOW_TABLE_CAPACITY, 0);

#[map]
static LATENCY_PENDING: LruHashMap<FlowKey, u64> =
    LruHashMap::with_max_entries(LATENCY_PENDING_CAPACITY, 0);

#[map]
static NETWORK_EVENTS: RingBuf = RingBuf::with_byte_size(NETWORK_RING_BYTES, 0);

#[map]
static NETWORK_COUNTERS: Array<u64> = Array::with_max_entries(COUNTERS_CAPACITY, 0);

const ETH_HDR_LEN: usize = 14;
const ETH_P_IP: u16 = 0x0800;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// Offsets into `struct sock.__sk_common`. See the kernel's sock_common
/// definition; stable since 4.x.
const SKC_DADDR_OFFSET: usize = 0;
const SKC_RCV_SADDR_OFFSET: usize = 4;
const SKC_DPORT_OFFSET: usize = 12;
const SKC_NUM_OFFSET: usize = 14;

/// Offsets into the tcp/tcp_probe tracepoint record. See
/// /sys/kernel/debug/tracing/events/tcp/tcp_probe/format. The address fields
/// are sockaddr storage: family at +0, port at +2, IPv4 address at +4.
const TP_SADDR_OFFSET: usize = 8;
const TP_DADDR_OFFSET: usize = 36;
const TP_SPORT_OFFSET: usize = 64;
const TP_DPORT_OFFSET: usize = 66;
const AF_INET: u16 = 2;

#[repr(C)]
struct EthHdr {
    dst: [u8; 6],
    src: [u8; 6],
    ether_type: u16,
}

#[repr(C)]
struct Ipv4Hdr {
    version_ihl: u8,
    tos: u8,
    tot_len: u16,
    id: u16,
    frag_off: u16,
    ttl: u8,
    protocol: u8,
    check: u16,
    saddr: u32,
    daddr: u32,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Ingress,
    Egress,
}

#[inline(always)]
fn bump_counter(index: u32) {
    if let Some(ptr) = NETWORK_COUNTERS.get_ptr_mut(index) {
        // SAFETY: the array slot is a valid u64 owned by this map.
        unsafe { AtomicU64::from_ptr(ptr) }.fetch_add(1, Ordering::Relaxed);
    }
}

/// SAFETY: caller guarantees `ptr` points at a live u64 in a map value.
#[inline(always)]
unsafe fn atomic_add_u64(ptr: *mut u64, val: u64) {
    unsafe { AtomicU64::from_ptr(ptr) }.fetch_add(val, Ordering::Relaxed);
}

/// SAFETY: caller guarantees `ptr` points at a live u32 in a map value.
#[inline(always)]
unsafe fn atomic_add_u32(ptr: *mut u32, val: u32) {
    unsafe { AtomicU32::from_ptr(ptr) }.fetch_add(val, Ordering::Relaxed);
}

/// SAFETY: caller guarantees `ptr` points at a live u32 in a map value.
#[inline(always)]
unsafe fn atomic_or_u32(ptr: *mut u32, bits: u32) {
    unsafe { AtomicU32::from_ptr(ptr) }.fetch_or(bits, Ordering::Relaxed);
}

/// Bounds-checked pointer into packet data; the verifier needs the explicit
/// comparison against data_end before any dereference.
#[inline(always)]
fn ptr_at<T>(ctx: &TcContext, offset: usize) -> Result<*const T, ()> {
    let start = ctx.data();
    let end = ctx.data_end();
    if start + offset + mem::size_of::<T>() > end {
        return Err(());
    }
    Ok((start + offset) as *const T)
}

#[inline(always)]
fn emit(record: EventRecord) {
    match NETWORK_EVENTS.reserve::<EventRecord>(0) {
        Some(mut slot) => {
            slot.write(record);
            slot.submit(0);
            bump_counter(counter::EVENTS_EMITTED);
        }
        None => bump_counter(counter::DROPPED_EVENTS),
    }
}

/// Upsert the flow entry and fold one packet in. Creation races are
/// harmless: counters are additive and last-seen's last writer wins.
#[inline(always)]
fn record_packet(key: &FlowKey, packet_bytes: u64, dir: Direction, now: u64) {
    // SAFETY: map value pointers stay valid for the program's lifetime and
    // all counter updates go through atomics.
    unsafe {
        let stats = match FLOW_TABLE.get_ptr_mut(key) {
            Some(stats) => stats,
            None => {
                let fresh = FlowStats::default();
                let _ = FLOW_TABLE.insert(key, &fresh, 0);
                match FLOW_TABLE.get_ptr_mut(key) {
                    Some(stats) => stats,
                    None => return,
                }
            }
        };
        atomic_add_u64(addr_of_mut!((*stats).packets), 1);
        atomic_add_u64(addr_of_mut!((*stats).bytes), packet_bytes);
        let flag = match dir {
            Direction::Ingress => flow_flags::INBOUND,
            Direction::Egress => flow_flags::OUTBOUND,
        };
        atomic_or_u32(addr_of_mut!((*stats).flags), flag);
        (*stats).last_seen_ns = now;
    }
}

#[classifier]
pub fn tc_ingress(ctx: TcContext) -> i32 {
    let _ = try_tc(&ctx, Direction::Ingress);
    TC_ACT_OK
}

#[classifier]
pub fn tc_egress(ctx: TcContext) -> i32 {
    let _ = try_tc(&ctx, Direction::Egress);
    TC_ACT_OK
}

fn try_tc(ctx: &TcContext, dir: Direction) -> Result<(), ()> {
    bump_counter(counter::PACKETS_SEEN);

    let eth = ptr_at::<EthHdr>(ctx, 0)?;
    // SAFETY: ptr_at bounds-checked the full header.
    if u16::from_be(unsafe { (*eth).ether_type }) != ETH_P_IP {
        bump_counter(counter::PACKETS_SKIPPED);
        return Ok(());
    }

    let ip = ptr_at::<Ipv4Hdr>(ctx, ETH_HDR_LEN)?;
    // SAFETY: ptr_at bounds-checked the full header.
    let (version_ihl, protocol, saddr, daddr) =
        unsafe { ((*ip).version_ihl, (*ip).protocol, (*ip).saddr, (*ip).daddr) };
    if version_ihl >> 4 != 4 {
        bump_counter(counter::PACKETS_SKIPPED);
        return Ok(());
    }
    if protocol != IPPROTO_TCP && protocol != IPPROTO_UDP {
        bump_counter(counter::PACKETS_SKIPPED);
        return Ok(());
    }

    // The IHL skips IPv4 options; src/dst ports are the first four bytes of
    // both the TCP and UDP headers.
    let l4_offset = ETH_HDR_LEN + usize::from(version_ihl & 0x0f) * 4;
    let ports = ptr_at::<[u16; 2]>(ctx, l4_offset)?;
    // SAFETY: ptr_at bounds-checked both ports.
    let [src_port, dst_port] = unsafe { *ports };

    // TC runs in softirq context where `current` is unrelated to the
    // traffic; the skb knows its cgroup.
    // SAFETY: the skb pointer is valid for the duration of the program.
    let cgroup_id = unsafe { aya_ebpf::helpers::gen::bpf_skb_cgroup_id(ctx.skb.skb) };
    // Root/init cgroup traffic is not a container's.
    if cgroup_id <= 1 {
        bump_counter(counter::PACKETS_SKIPPED);
        return Ok(());
    }

    let key = FlowKey {
        src_ip: saddr,
        dst_ip: daddr,
        src_port,
        dst_port,
        protocol,
        _pad: [0; 3],
        cgroup_id,
    };

    let now = unsafe { bpf_ktime_get_ns() };
    record_packet(&key, u64::from(ctx.len()), dir, now);

    if dir == Direction::Egress {
        let _ = LATENCY_PENDING.insert(&key, &now, 0);
    }
    Ok(())
}

#[kprobe]
pub fn tcp_retransmit_skb(ctx: ProbeContext) -> u32 {
    match try_tcp_retransmit_skb(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_tcp_retransmit_skb(ctx: &ProbeContext) -> Result<(), i64> {
    // SAFETY: helper takes no pointers.
    let cgroup_id = unsafe { bpf_get_current_cgroup_id() };
    if cgroup_id <= 1 {
        return Ok(());
    }

    let sock: *const u8 = ctx.arg(0).ok_or(1i64)?;

    // SAFETY: probe reads against the sock_common layout, each individually
    // checked by the helper.
    let (daddr, saddr, dport, snum) = unsafe {
        (
            bpf_probe_read_kernel(sock.add(SKC_DADDR_OFFSET) as *const u32)?,
            bpf_probe_read_kernel(sock.add(SKC_RCV_SADDR_OFFSET) as *const u32)?,
            bpf_probe_read_kernel(sock.add(SKC_DPORT_OFFSET) as *const u16)?,
            bpf_probe_read_kernel(sock.add(SKC_NUM_OFFSET) as *const u16)?,
        )
    };

    // Rebuild the egress flow key: skc_num is host order, skc_dport is
    // already network order.
    let key = FlowKey {
        src_ip: saddr,
        dst_ip: daddr,
        src_port: snum.to_be(),
        dst_port: dport,
        protocol: IPPROTO_TCP,
        _pad: [0; 3],
        cgroup_id,
    };

    bump_counter(counter::RETRANSMITS);

    // SAFETY: counter updates are atomic; the payload copy is a plain read
    // of POD fields.
    let snapshot = unsafe {
        let Some(stats) = FLOW_TABLE.get_ptr_mut(&key) else {
            return Ok(());
        };
        atomic_add_u32(addr_of_mut!((*stats).retransmits), 1);
        atomic_or_u32(addr_of_mut!((*stats).flags), flow_flags::RETRANSMIT);
        *stats
    };

    let now = unsafe { bpf_ktime_get_ns() };
    let mut record = EventRecord::header(tag::NETWORK_PACKET, 0, now, key.cgroup_id);
    record.payload = EventPayload { flow: snapshot };
    emit(record);
    Ok(())
}

#[tracepoint]
pub fn tcp_probe(ctx: TracePointContext) -> u32 {
    match try_tcp_probe(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_tcp_probe(ctx: &TracePointContext) -> Result<(), i64> {
    // SAFETY: helper takes no pointers.
    let cgroup_id = unsafe { bpf_get_current_cgroup_id() };
    if cgroup_id <= 1 {
        return Ok(());
    }

    // SAFETY: fixed tracepoint record offsets, each read individually.
    let family: u16 = unsafe { ctx.read_at(TP_SADDR_OFFSET)? };
    if family != AF_INET {
        return Ok(());
    }

    // SAFETY: as above.
    let (saddr, daddr, sport, dport) = unsafe {
        (
            ctx.read_at::<u32>(TP_SADDR_OFFSET + 4)?,
            ctx.read_at::<u32>(TP_DADDR_OFFSET + 4)?,
            ctx.read_at::<u16>(TP_SPORT_OFFSET)?,
            ctx.read_at::<u16>(TP_DPORT_OFFSET)?,
        )
    };

    let key = FlowKey {
        src_ip: saddr,
        dst_ip: daddr,
        src_port: sport.to_be(),
        dst_port: dport.to_be(),
        protocol: IPPROTO_TCP,
        _pad: [0; 3],
        cgroup_id,
    };

    // SAFETY: single read; the entry is deleted after pairing.
    let Some(sent_ns) = (unsafe { LATENCY_PENDING.get(&key) }).copied() else {
        return Ok(());
    };

    let now = unsafe { bpf_ktime_get_ns() };
    let rtt = now.saturating_sub(sent_ns);

    // SAFETY: atomic accumulation into the flow entry.
    unsafe {
        if let Some(stats) = FLOW_TABLE.get_ptr_mut(&key) {
            atomic_add_u64(addr_of_mut!((*stats).latency_sum_ns), rtt);
            atomic_add_u64(addr_of_mut!((*stats).latency_count), 1);
        }
    }

    let _ = LATENCY_PENDING.remove(&key);
    Ok(())
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
