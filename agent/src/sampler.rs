// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Userspace CPU/memory sampling.
//!
//! The kernel probes own lifecycle and network telemetry; CPU and memory
//! come from procfs, sampled once per aggregation interval for every known
//! container's primary pid and fed through the same event path the pump
//! uses. A vanished pid is not an error, just a container on its way out.

use std::env;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::budget::PoolSet;
use crate::events::Event;

/// Linux clock ticks per second; fixed at 100 on every supported kernel.
const CLK_TCK: f64 = 100.0;

fn default_proc_root() -> PathBuf {
    if let Ok(root) = env::var("HOST_PROC") {
        return root.into();
    }
    "/proc".into()
}

#[derive(Debug, Clone, Copy)]
struct CpuBaseline {
    total_ticks: u64,
    at: Instant,
}

pub struct ProcSampler {
    proc_root: PathBuf,
    baselines: FxHashMap<u32, CpuBaseline>,
}

impl Default for ProcSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcSampler {
    pub fn new() -> Self {
        Self::with_root(default_proc_root())
    }

    pub fn with_root(proc_root: PathBuf) -> Self {
        Self {
            proc_root,
            baselines: FxHashMap::default(),
        }
    }

    /// Sample every (cgroup id, pid) target, producing cpu-sample and
    /// memory-sample events. CPU needs two observations; the first call per
    /// pid only seeds the baseline.
    pub fn sample(&mut self, targets: &[(u64, u32)], timestamp_ns: u64, pools: &PoolSet) -> Vec<Event> {
        let mut events = Vec::with_capacity(targets.len() * 2);
        let now = Instant::now();
        let mut buf = pools.byte_buffers.get();

        self.baselines
            .retain(|pid, _| targets.iter().any(|(_, p)| p == pid));

        for &(cgroup_id, pid) in targets {
            if let Some(ticks) = read_cpu_ticks(&self.proc_root, pid, &mut buf) {
                if let Some(baseline) = self.baselines.get(&pid) {
                    let elapsed = now.duration_since(baseline.at).as_secs_f64();
                    if elapsed > 0.0 {
                        let delta = ticks.saturating_sub(baseline.total_ticks) as f64;
                        let percent = delta / CLK_TCK / elapsed * 100.0;
                        events.push(Event::CpuSample {
                            cgroup_id,
                            pid,
                            timestamp_ns,
                            millipercent: (percent * 10.0).round() as u64,
                        });
                    }
                }
                self.baselines.insert(
                    pid,
                    CpuBaseline {
                        total_ticks: ticks,
                        at: now,
                    },
                );
            }

            if let Some(bytes) = read_rss_bytes(&self.proc_root, pid, &mut buf) {
                events.push(Event::MemorySample {
                    cgroup_id,
                    pid,
                    timestamp_ns,
                    bytes,
                });
            }
        }
        pools.byte_buffers.put(buf);
        events
    }
}

/// Read a procfs file into the reusable buffer and view it as a str.
fn read_proc_file<'a>(proc_root: &Path, pid: u32, file: &str, buf: &'a mut Vec<u8>) -> Option<&'a str> {
    buf.clear();
    let mut handle = File::open(proc_root.join(pid.to_string()).join(file)).ok()?;
    handle.read_to_end(buf).ok()?;
    std::str::from_utf8(buf).ok()
}

/// utime + stime from /proc/<pid>/stat. The comm field may contain spaces
/// and parentheses; fields are counted from after the closing paren.
fn read_cpu_ticks(proc_root: &Path, pid: u32, buf: &mut Vec<u8>) -> Option<u64> {
    let contents = read_proc_file(proc_root, pid, "stat", buf)?;
    let after_comm = contents.rsplit_once(')')?.1;
    let mut fields = after_comm.split_whitespace();
    // utime and stime are fields 14 and 15 of the full line; the state
    // field right after the comm is field 3.
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}

/// VmRSS from /proc/<pid>/status, in bytes.
fn read_rss_bytes(proc_root: &Path, pid: u32, buf: &mut Vec<u8>) -> Option<u64> {
    let contents = read_proc_file(proc_root, pid, "status", buf)?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().split_whitespace().next()?.parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn write_proc(root: &Path, pid: u32, utime: u64, stime: u64, rss_kb: u64) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("stat"),
            format!(
                "{pid} (some proc) S 1 {pid} {pid} 0 -1 4194304 100 0 0 0 {utime} {stime} 0 0 20 0 1 0 100 1000000 500 18446744073709551615"
            ),
        )
        .unwrap();
        fs::write(
            dir.join("status"),
            format!("Name:\tsome proc\nVmRSS:\t{rss_kb} kB\n"),
        )
        .unwrap();
    }

    #[test]
    fn test_read_cpu_ticks_handles_spaced_comm() {
        let dir = TempDir::new().unwrap();
        write_proc(dir.path(), 42, 120, 30, 2048);
        let mut buf = Vec::new();
        assert_eq!(read_cpu_ticks(dir.path(), 42, &mut buf), Some(150));
    }

    #[test]
    fn test_read_rss_bytes() {
        let dir = TempDir::new().unwrap();
        write_proc(dir.path(), 42, 0, 0, 2048);
        let mut buf = Vec::new();
        assert_eq!(read_rss_bytes(dir.path(), 42, &mut buf), Some(2048 * 1024));
    }

    #[test]
    fn test_first_sample_seeds_baseline_only() {
        let dir = TempDir::new().unwrap();
        let pools = PoolSet::new();
        write_proc(dir.path(), 42, 100, 0, 1024);
        let mut sampler = ProcSampler::with_root(dir.path().to_path_buf());

        let events = sampler.sample(&[(7, 42)], 1, &pools);
        // Memory is immediate; CPU needs a second observation.
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::MemorySample { bytes, .. } if bytes == 1024 * 1024));

        std::thread::sleep(std::time::Duration::from_millis(20));
        write_proc(dir.path(), 42, 150, 10, 1024);
        let events = sampler.sample(&[(7, 42)], 2, &pools);
        assert_eq!(events.len(), 2);
        let cpu = events
            .iter()
            .find_map(|e| match e {
                Event::CpuSample { millipercent, .. } => Some(*millipercent),
                _ => None,
            })
            .unwrap();
        // 60 ticks in ~20ms is a busy process; just check it registered.
        assert!(cpu > 0);
    }

    #[test]
    fn test_vanished_pid_is_silent() {
        let dir = TempDir::new().unwrap();
        let pools = PoolSet::new();
        let mut sampler = ProcSampler::with_root(dir.path().to_path_buf());
        let events = sampler.sample(&[(7, 9999)], 1, &pools);
        assert!(events.is_empty());
    }

    #[test]
    fn test_baselines_pruned_for_gone_targets() {
        let dir = TempDir::new().unwrap();
        let pools = PoolSet::new();
        write_proc(dir.path(), 1, 10, 0, 100);
        write_proc(dir.path(), 2, 10, 0, 100);
        let mut sampler = ProcSampler::with_root(dir.path().to_path_buf());
        sampler.sample(&[(7, 1), (8, 2)], 1, &pools);
        assert_eq!(sampler.baselines.len(), 2);
        sampler.sample(&[(7, 1)], 2, &pools);
        assert_eq!(sampler.baselines.len(), 1);
        // The scratch buffer went back to the pool.
        assert_eq!(pools.byte_buffers.live(), 1);
    }
}
