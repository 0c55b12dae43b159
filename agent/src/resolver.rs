// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Runtime detection and cgroup-id → container identity resolution.
//!
//! Containers are joined to runtimes by scanning `/proc/<pid>/cgroup` lines
//! for runtime path signatures and statting the cgroup directory for its
//! inode, which is the kernel cgroup id. Scans are cached for 30 seconds.
//! Absence of a runtime is not an error; unparseable cgroup lines are
//! silently skipped.

use std::fs;
use std::num::NonZeroUsize;
use std::os::linux::fs::MetadataExt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::debug;
use lru::LruCache;

use crate::config::RuntimeKind;

const SCAN_TTL: Duration = Duration::from_secs(30);

/// Well-known daemon socket locations, checked in order.
const DOCKER_SOCKETS: &[&str] = &["/var/run/docker.sock", "/run/docker.sock"];
const CONTAINERD_SOCKETS: &[&str] = &[
    "/run/containerd/containerd.sock",
    "/var/run/containerd/containerd.sock",
];
const CRIO_SOCKETS: &[&str] = &["/var/run/crio/crio.sock", "/run/crio/crio.sock"];

const ALL_RUNTIMES: &[RuntimeKind] = &[
    RuntimeKind::Docker,
    RuntimeKind::Containerd,
    RuntimeKind::CriO,
];

#[derive(Debug, Clone)]
pub struct RuntimeDescriptor {
    pub runtime: RuntimeKind,
    pub version: Option<String>,
    pub socket_path: Option<PathBuf>,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedContainer {
    pub runtime: RuntimeKind,
    pub container_id: String,
    pub pid: u32,
}

fn socket_candidates(runtime: RuntimeKind) -> &'static [&'static str] {
    match runtime {
        RuntimeKind::Docker => DOCKER_SOCKETS,
        RuntimeKind::Containerd => CONTAINERD_SOCKETS,
        RuntimeKind::CriO => CRIO_SOCKETS,
    }
}

fn daemon_name(runtime: RuntimeKind) -> &'static str {
    match runtime {
        RuntimeKind::Docker => "dockerd",
        RuntimeKind::Containerd => "containerd",
        RuntimeKind::CriO => "crio",
    }
}

pub(crate) fn socket_is_present(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false)
}

/// Find the pid of a process whose command line contains `needle`.
fn find_daemon_pid(proc_root: &Path, needle: &str) -> Option<u32> {
    let entries = fs::read_dir(proc_root).ok()?;
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(cmdline) = fs::read_to_string(entry.path().join("cmdline")) else {
            continue;
        };
        // Match on the executable only: "containerd" must not match
        // "containerd-shim" worker processes.
        let exe = cmdline.split('\0').next().unwrap_or("");
        let base = exe.rsplit('/').next().unwrap_or(exe);
        if base == needle {
            return Some(pid);
        }
    }
    None
}

/// A runtime is present if its well-known socket exists and is a socket, or
/// a daemon process of the right name is running.
pub fn detect_runtimes(proc_root: &Path) -> Vec<RuntimeDescriptor> {
    let mut present = Vec::new();
    for &runtime in ALL_RUNTIMES {
        let socket_path = socket_candidates(runtime)
            .iter()
            .map(PathBuf::from)
            .find(|p| socket_is_present(p));
        let pid = find_daemon_pid(proc_root, daemon_name(runtime));
        if socket_path.is_some() || pid.is_some() {
            present.push(RuntimeDescriptor {
                runtime,
                version: None,
                socket_path,
                pid,
            });
        }
    }
    present
}

/// Classify one cgroup path by runtime signature and extract the container
/// id that follows it. Returns None for paths no runtime claims.
pub fn classify_cgroup_path(path: &str) -> Option<(RuntimeKind, String)> {
    const SIGNATURES: &[(&str, RuntimeKind)] = &[
        ("/docker/", RuntimeKind::Docker),
        ("/docker-", RuntimeKind::Docker),
        ("/containerd/", RuntimeKind::Containerd),
        ("/k8s.io/", RuntimeKind::Containerd),
        ("/crio-", RuntimeKind::CriO),
        ("/crio/", RuntimeKind::CriO),
    ];
    for (signature, runtime) in SIGNATURES {
        if let Some((_, rest)) = path.split_once(signature) {
            let id = rest.split('/').next().unwrap_or(rest);
            let id = id.strip_suffix(".scope").unwrap_or(id);
            if id.is_empty() {
                continue;
            }
            return Some((*runtime, id.to_string()));
        }
    }
    None
}

/// The path component of a `/proc/<pid>/cgroup` line
/// (`hierarchy:controllers:path`). Lines that do not have three fields are
/// skipped by the caller.
fn cgroup_line_path(line: &str) -> Option<&str> {
    let mut fields = line.splitn(3, ':');
    let _hierarchy = fields.next()?;
    let _controllers = fields.next()?;
    fields.next()
}

pub struct CgroupResolver {
    proc_root: PathBuf,
    cgroup_root: PathBuf,
    filter: Option<Vec<RuntimeKind>>,
    cache: LruCache<u64, ResolvedContainer>,
    last_scan: Option<Instant>,
    ttl: Duration,
}

impl CgroupResolver {
    pub fn new(max_containers: u32, filter: Option<Vec<RuntimeKind>>) -> Self {
        Self::with_roots(Path::new("/proc"), Path::new("/sys/fs/cgroup"), max_containers, filter)
    }

    pub fn with_roots(
        proc_root: &Path,
        cgroup_root: &Path,
        max_containers: u32,
        filter: Option<Vec<RuntimeKind>>,
    ) -> Self {
        let capacity = NonZeroUsize::new(max_containers.max(1) as usize)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            proc_root: proc_root.to_path_buf(),
            cgroup_root: cgroup_root.to_path_buf(),
            filter,
            cache: LruCache::new(capacity),
            last_scan: None,
            ttl: SCAN_TTL,
        }
    }

    /// Identity for a cgroup id, from the most recent scan. Triggers a scan
    /// when the cached one is older than the TTL.
    pub fn lookup(&mut self, cgroup_id: u64) -> Option<ResolvedContainer> {
        self.refresh_if_stale();
        self.cache.get(&cgroup_id).cloned()
    }

    fn refresh_if_stale(&mut self) {
        let stale = self
            .last_scan
            .is_none_or(|at| at.elapsed() >= self.ttl);
        if stale {
            self.scan();
            self.last_scan = Some(Instant::now());
        }
    }

    /// One record per (pid, detected runtime); later pids win for the same
    /// cgroup, which is harmless since they carry the same id.
    fn scan(&mut self) {
        let Ok(entries) = fs::read_dir(&self.proc_root) else {
            return;
        };
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            let Ok(contents) = fs::read_to_string(entry.path().join("cgroup")) else {
                continue;
            };
            for line in contents.lines() {
                let Some(path) = cgroup_line_path(line) else {
                    continue;
                };
                let Some((runtime, container_id)) = classify_cgroup_path(path) else {
                    continue;
                };
                if let Some(filter) = &self.filter {
                    if !filter.contains(&runtime) {
                        continue;
                    }
                }
                let Some(cgroup_id) = self.cgroup_inode(path) else {
                    debug!("could not stat cgroup path {path} for pid {pid}");
                    continue;
                };
                self.cache.put(
                    cgroup_id,
                    ResolvedContainer {
                        runtime,
                        container_id,
                        pid,
                    },
                );
            }
        }
    }

    /// The kernel cgroup id is the inode of the cgroup directory.
    fn cgroup_inode(&self, cgroup_path: &str) -> Option<u64> {
        let relative = cgroup_path.trim_start_matches('/');
        fs::metadata(self.cgroup_root.join(relative))
            .ok()
            .map(|m| m.st_ino())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use std::os::unix::net::UnixListener;

    use tempfile::TempDir;

    use super::*;

    fn write_proc_entry(proc_root: &Path, pid: u32, cgroup: &str, cmdline: &str) {
        let dir = proc_root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("cgroup"), cgroup).unwrap();
        fs::write(dir.join("cmdline"), cmdline).unwrap();
    }

    #[test]
    fn test_classify_signatures() {
        let cases = [
            (
                "/docker/4f8e28abcdef0123",
                Some((RuntimeKind::Docker, "4f8e28abcdef0123")),
            ),
            (
                "/system.slice/docker-beef1234.scope",
                Some((RuntimeKind::Docker, "beef1234")),
            ),
            (
                "/containerd/abc123",
                Some((RuntimeKind::Containerd, "abc123")),
            ),
            (
                "/kubepods/k8s.io/pod42/cafe",
                Some((RuntimeKind::Containerd, "pod42")),
            ),
            (
                "/kubepods.slice/crio-77aa88bb.scope",
                Some((RuntimeKind::CriO, "77aa88bb")),
            ),
            ("/crio/aa11", Some((RuntimeKind::CriO, "aa11"))),
            ("/user.slice/session-1.scope", None),
            ("/", None),
        ];
        for (path, expected) in cases {
            let got = classify_cgroup_path(path);
            match expected {
                Some((runtime, id)) => {
                    let (got_runtime, got_id) = got.unwrap_or_else(|| panic!("no match for {path}"));
                    assert_eq!(got_runtime, runtime, "{path}");
                    assert_eq!(got_id, id, "{path}");
                }
                None => assert!(got.is_none(), "unexpected match for {path}: {got:?}"),
            }
        }
    }

    #[test]
    fn test_cgroup_line_path() {
        assert_eq!(
            cgroup_line_path("0::/system.slice/docker-aa.scope"),
            Some("/system.slice/docker-aa.scope")
        );
        assert_eq!(cgroup_line_path("4:memory:/docker/bb"), Some("/docker/bb"));
        assert_eq!(cgroup_line_path("garbage"), None);
    }

    #[test]
    fn test_scan_resolves_inode_to_identity() {
        let proc_dir = TempDir::new().unwrap();
        let cgroup_dir = TempDir::new().unwrap();

        let scope = "system.slice/docker-deadbeefcafe0123.scope";
        fs::create_dir_all(cgroup_dir.path().join(scope)).unwrap();
        let inode = fs::metadata(cgroup_dir.path().join(scope)).unwrap().st_ino();

        write_proc_entry(
            proc_dir.path(),
            4321,
            "0::/system.slice/docker-deadbeefcafe0123.scope\n",
            "nginx\0-g\0daemon off;\0",
        );
        // Non-numeric entries and junk lines are skipped silently.
        fs::create_dir_all(proc_dir.path().join("self")).unwrap();
        write_proc_entry(proc_dir.path(), 5000, "not a cgroup line\n", "bash\0");

        let mut resolver = CgroupResolver::with_roots(
            proc_dir.path(),
            cgroup_dir.path(),
            100,
            None,
        );
        let resolved = resolver.lookup(inode).unwrap();
        assert_eq!(resolved.runtime, RuntimeKind::Docker);
        assert_eq!(resolved.container_id, "deadbeefcafe0123");
        assert_eq!(resolved.pid, 4321);

        assert!(resolver.lookup(inode + 999).is_none());
    }

    #[test]
    fn test_scan_respects_runtime_filter() {
        let proc_dir = TempDir::new().unwrap();
        let cgroup_dir = TempDir::new().unwrap();

        let scope = "system.slice/docker-ffff0000.scope";
        fs::create_dir_all(cgroup_dir.path().join(scope)).unwrap();
        let inode = fs::metadata(cgroup_dir.path().join(scope)).unwrap().st_ino();
        write_proc_entry(
            proc_dir.path(),
            77,
            "0::/system.slice/docker-ffff0000.scope\n",
            "redis\0",
        );

        let mut resolver = CgroupResolver::with_roots(
            proc_dir.path(),
            cgroup_dir.path(),
            100,
            Some(vec![RuntimeKind::CriO]),
        );
        assert!(resolver.lookup(inode).is_none());
    }

    #[test]
    fn test_detect_runtime_by_process() {
        let proc_dir = TempDir::new().unwrap();
        write_proc_entry(proc_dir.path(), 1000, "", "/usr/bin/dockerd\0--iptables\0");
        // Shim processes must not count as the containerd daemon.
        write_proc_entry(proc_dir.path(), 1001, "", "containerd-shim-runc-v2\0");

        let detected = detect_runtimes(proc_dir.path());
        let docker = detected
            .iter()
            .find(|d| d.runtime == RuntimeKind::Docker)
            .unwrap();
        assert_eq!(docker.pid, Some(1000));
        assert!(
            !detected.iter().any(|d| d.runtime == RuntimeKind::Containerd
                && d.socket_path.is_none()
                && d.pid == Some(1001))
        );
    }

    #[test]
    fn test_socket_detection() {
        let dir = TempDir::new().unwrap();
        let sock_path = dir.path().join("docker.sock");
        let _listener = UnixListener::bind(&sock_path).unwrap();
        assert!(socket_is_present(&sock_path));
        assert!(!socket_is_present(&dir.path().join("absent.sock")));
        let file_path = dir.path().join("regular");
        fs::write(&file_path, b"x").unwrap();
        assert!(!socket_is_present(&file_path));
    }
}
