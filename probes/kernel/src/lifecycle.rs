// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Container lifecycle probes.
//!
//! # Attach points
//! - `syscalls/sys_enter_clone`: first sighting of a cgroup creates a
//!   container table entry and emits a container-start event.
//! - `syscalls/sys_enter_exit`: primary-pid exit marks the container stopped,
//!   emits a container-stop event and drops the table entries.
//! - `cgroup_attach_task` (kprobe): refreshes the pid mapping and promotes
//!   created containers to running.
//! - `sched/sched_process_exec`: refreshes the process name and promotes
//!   created containers to running.
//!
//! Cgroup ids 0 and 1 denote the root/init cgroup and are never containers.

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicU64, Ordering};

use aya_ebpf::{
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns},
    macros::{kprobe, map, tracepoint},
    maps::{Array, LruHashMap, RingBuf},
    programs::{ProbeContext, TracePointContext},
};
use microradar_common::{
    cgroup_id_hex, counter, status, tag, ContainerInfo, EventPayload, EventRecord,
    CONTAINER_TABLE_CAPACITY, COUNTERS_CAPACITY, LIFECYCLE_RING_BYTES, PID_TO_CGROUP_CAPACITY,
};

#[map]
static CONTAINER_TABLE: LruHashMap<u64, ContainerInfo> =
    LruHashMap::with_max_entries(CONTAINER_TABLE_CAPACITY, 0);

#[map]
static PID_TO_CGROUP: LruHashMap<u32, u64> =
    LruHashMap::with_max_entries(PID_TO_CGROUP_CAPACITY, 0);

#[map]
static LIFECYCLE_EVENTS: RingBuf = RingBuf::with_byte_size(LIFECYCLE_RING_BYTES, 0);

#[map]
static LIFECYCLE_COUNTERS: Array<u64> = Array::with_max_entries(COUNTERS_CAPACITY, 0);

#[inline(always)]
fn bump_counter(index: u32) {
    if let Some(ptr) = LIFECYCLE_COUNTERS.get_ptr_mut(index) {
        // SAFETY: the array slot is a valid u64 owned by this map.
        unsafe { AtomicU64::from_ptr(ptr) }.fetch_add(1, Ordering::Relaxed);
    }
}

#[inline(always)]
fn current_cgroup_id() -> u64 {
    // SAFETY: helper takes no pointers.
    unsafe { aya_ebpf::helpers::bpf_get_current_cgroup_id() }
}

#[inline(always)]
fn is_root_cgroup(cgroup_id: u64) -> bool {
    cgroup_id <= 1
}

/// Reserve a slot, write the record, submit. On reservation failure the drop
/// counter rises and the caller continues.
#[inline(always)]
fn emit(record: EventRecord) {
    match LIFECYCLE_EVENTS.reserve::<EventRecord>(0) {
        Some(mut slot) => {
            slot.write(record);
            slot.submit(0);
            bump_counter(counter::EVENTS_EMITTED);
        }
        None => bump_counter(counter::DROPPED_EVENTS),
    }
}

#[tracepoint]
pub fn sys_enter_clone(ctx: TracePointContext) -> u32 {
    match try_sys_enter_clone(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_sys_enter_clone(_ctx: &TracePointContext) -> Result<(), i64> {
    let cgroup_id = current_cgroup_id();
    if is_root_cgroup(cgroup_id) {
        return Ok(());
    }

    let pid = (bpf_get_current_pid_tgid() >> 32) as u32;
    PID_TO_CGROUP.insert(&pid, &cgroup_id, 0)?;

    // SAFETY: value pointer is only read before any map mutation.
    if unsafe { CONTAINER_TABLE.get(&cgroup_id) }.is_some() {
        return Ok(());
    }

    let now = unsafe { bpf_ktime_get_ns() };
    let comm = bpf_get_current_comm().unwrap_or([0; 16]);
    let info = ContainerInfo {
        cgroup_id,
        start_ns: now,
        memory_bytes: 0,
        pid,
        ppid: pid,
        status: status::CREATED,
        cpu_millipercent: 0,
        comm,
        id_hex: cgroup_id_hex(cgroup_id),
    };
    // Two clones racing on the same cgroup are harmless: counters are
    // additive and the last writer of the scalar state wins.
    CONTAINER_TABLE.insert(&cgroup_id, &info, 0)?;

    let mut record = EventRecord::header(tag::CONTAINER_START, pid, now, cgroup_id);
    record.payload = EventPayload { container: info };
    emit(record);
    Ok(())
}

#[tracepoint]
pub fn sys_enter_exit(ctx: TracePointContext) -> u32 {
    match try_sys_enter_exit(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_sys_enter_exit(_ctx: &TracePointContext) -> Result<(), i64> {
    let cgroup_id = current_cgroup_id();
    if is_root_cgroup(cgroup_id) {
        return Ok(());
    }

    let pid = (bpf_get_current_pid_tgid() >> 32) as u32;
    // SAFETY: single read of the map value; the copy below is taken before
    // the entry is deleted.
    let Some(info) = (unsafe { CONTAINER_TABLE.get(&cgroup_id) }) else {
        return Ok(());
    };
    if info.pid != pid {
        // A worker task exiting, not the container.
        return Ok(());
    }

    let mut stopped = *info;
    stopped.status = status::STOPPED;

    let now = unsafe { bpf_ktime_get_ns() };
    let mut record = EventRecord::header(tag::CONTAINER_STOP, pid, now, cgroup_id);
    record.payload = EventPayload { container: stopped };
    emit(record);

    let _ = CONTAINER_TABLE.remove(&cgroup_id);
    let _ = PID_TO_CGROUP.remove(&pid);
    Ok(())
}

#[kprobe]
pub fn cgroup_attach_task(ctx: ProbeContext) -> u32 {
    match try_cgroup_attach(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

#[tracepoint]
pub fn sched_process_exec(ctx: TracePointContext) -> u32 {
    match try_exec(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_exec(_ctx: &TracePointContext) -> Result<(), i64> {
    let cgroup_id = current_cgroup_id();
    if is_root_cgroup(cgroup_id) {
        return Ok(());
    }

    // SAFETY: see try_promote; scalar fields only, last writer wins.
    if let Some(info) = unsafe { CONTAINER_TABLE.get_ptr_mut(&cgroup_id) } {
        let comm = bpf_get_current_comm().unwrap_or([0; 16]);
        unsafe {
            (*info).comm = comm;
            if (*info).status == status::CREATED {
                (*info).status = status::RUNNING;
            }
        }
    }
    Ok(())
}

fn try_cgroup_attach(_ctx: &ProbeContext) -> Result<(), i64> {
    let cgroup_id = current_cgroup_id();
    if is_root_cgroup(cgroup_id) {
        return Ok(());
    }

    let pid = (bpf_get_current_pid_tgid() >> 32) as u32;
    PID_TO_CGROUP.insert(&pid, &cgroup_id, 0)?;

    // SAFETY: scalar status update; racing writers of the same value are
    // harmless.
    if let Some(info) = unsafe { CONTAINER_TABLE.get_ptr_mut(&cgroup_id) } {
        unsafe {
            if (*info).status == status::CREATED {
                (*info).status = status::RUNNING;
                let now = bpf_ktime_get_ns();
                let mut record = EventRecord::header(tag::CONTAINER_START, pid, now, cgroup_id);
                record.payload = EventPayload { container: *info };
                emit(record);
            }
        }
    }
    Ok(())
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
