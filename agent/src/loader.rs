// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Probe loading and agent lifecycle.
//!
//! The loader owns everything: it raises the locked-memory limit, loads both
//! probe objects, attaches programs in a deterministic order (lifecycle
//! tracepoints, then kprobes, then TC), starts the pump/aggregator/reaper/
//! budget tasks and tears it all down in reverse on shutdown. Lifecycle
//! tracepoint failures are fatal; anything else degrades the metric set and
//! is reported through status. A failed transition unwinds to unloaded.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use aya::Ebpf;
use aya::programs::{KProbe, SchedClassifier, TracePoint, tc, tc::TcAttachType};
use log::{info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::aggregate::Aggregator;
use crate::budget::{MemoryBudget, PoolSet, supervise};
use crate::config::Config;
use crate::errors::{Error, LogThrottle};
use crate::maps::{self, KernelMaps, MapSpec, TelemetrySource};
use crate::pump::{self, EventPump, PumpStats};
use crate::reaper::Reaper;
use crate::resolver::CgroupResolver;
use crate::sampler::ProcSampler;

/// Time each task gets to wind down before its handle is aborted.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const BUDGET_INTERVAL: Duration = Duration::from_secs(1);

const LIFECYCLE_OBJECT: &str = "lifecycle";
const NETWORK_OBJECT: &str = "network";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    Unloaded,
    Loaded,
    Attached,
    Running,
    Stopping,
}

impl LoaderState {
    pub fn as_str(self) -> &'static str {
        match self {
            LoaderState::Unloaded => "unloaded",
            LoaderState::Loaded => "loaded",
            LoaderState::Attached => "attached",
            LoaderState::Running => "running",
            LoaderState::Stopping => "stopping",
        }
    }

    pub(crate) fn can_transition_to(self, next: LoaderState) -> bool {
        use LoaderState::*;
        matches!(
            (self, next),
            (Unloaded, Loaded)
                | (Loaded, Attached)
                | (Attached, Running)
                | (Running, Stopping)
                | (Stopping, Unloaded)
                // Unwind paths for failed transitions.
                | (Loaded, Unloaded)
                | (Attached, Unloaded)
        )
    }
}

impl fmt::Display for LoaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of the loader state, shared with the HTTP handlers.
#[derive(Clone)]
pub struct StatusHandle(Arc<RwLock<LoaderState>>);

impl StatusHandle {
    fn new() -> Self {
        Self(Arc::new(RwLock::new(LoaderState::Unloaded)))
    }

    pub fn state(&self) -> LoaderState {
        self.0.read().map(|s| *s).unwrap_or(LoaderState::Unloaded)
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == LoaderState::Running
    }

    fn set(&self, state: LoaderState) {
        if let Ok(mut cell) = self.0.write() {
            *cell = state;
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoaderStatus {
    pub state: LoaderState,
    pub maps: &'static [MapSpec],
    pub attached: Vec<String>,
    /// Hook points that failed to attach; the metric set is degraded.
    pub degraded: Vec<String>,
}

pub struct Loader {
    config: Config,
    state: LoaderState,
    status: StatusHandle,
    aggregator: Arc<Aggregator>,
    pools: Arc<PoolSet>,
    budget: Arc<MemoryBudget>,
    pump_stats: Arc<PumpStats>,
    lifecycle_obj: Option<Ebpf>,
    network_obj: Option<Ebpf>,
    attached: Vec<String>,
    degraded: Vec<String>,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl Loader {
    pub fn new(
        config: Config,
        aggregator: Arc<Aggregator>,
        pools: Arc<PoolSet>,
        budget: Arc<MemoryBudget>,
    ) -> Self {
        Self {
            config,
            state: LoaderState::Unloaded,
            status: StatusHandle::new(),
            aggregator,
            pools,
            budget,
            pump_stats: Arc::new(PumpStats::default()),
            lifecycle_obj: None,
            network_obj: None,
            attached: Vec::new(),
            degraded: Vec::new(),
            shutdown: None,
            tasks: Vec::new(),
            grace: SHUTDOWN_GRACE,
        }
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn pump_stats(&self) -> Arc<PumpStats> {
        self.pump_stats.clone()
    }

    pub fn status(&self) -> LoaderStatus {
        LoaderStatus {
            state: self.state,
            maps: maps::MAP_SPECS,
            attached: self.attached.clone(),
            degraded: self.degraded.clone(),
        }
    }

    fn transition(&mut self, next: LoaderState) -> Result<(), Error> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state.as_str(),
                to: next.as_str(),
            });
        }
        self.state = next;
        self.status.set(next);
        Ok(())
    }

    /// Raise RLIMIT_MEMLOCK and load both probe objects.
    pub fn load(&mut self) -> Result<(), Error> {
        if self.state != LoaderState::Unloaded {
            return Err(Error::InvalidTransition {
                from: self.state.as_str(),
                to: LoaderState::Loaded.as_str(),
            });
        }
        raise_memlock();

        let probe_dir = self.config.system.probe_dir.clone();
        self.lifecycle_obj = Some(load_object(probe_dir.join(LIFECYCLE_OBJECT), LIFECYCLE_OBJECT)?);
        self.network_obj = match load_object(probe_dir.join(NETWORK_OBJECT), NETWORK_OBJECT) {
            Ok(obj) => Some(obj),
            Err(err) => {
                self.lifecycle_obj = None;
                return Err(err);
            }
        };
        self.transition(LoaderState::Loaded)?;
        info!("loaded probe objects from {}", probe_dir.display());
        Ok(())
    }

    /// Attach every program: lifecycle tracepoints first, then kprobes, then
    /// the TC classifiers. TC is skipped without error when no interface is
    /// configured.
    pub fn attach(&mut self) -> Result<(), Error> {
        if self.state != LoaderState::Loaded {
            return Err(Error::InvalidTransition {
                from: self.state.as_str(),
                to: LoaderState::Attached.as_str(),
            });
        }

        let result = self.attach_all();
        match result {
            Ok(()) => self.transition(LoaderState::Attached),
            Err(err) => {
                // Unwind: dropping the objects detaches whatever made it on.
                self.lifecycle_obj = None;
                self.network_obj = None;
                self.attached.clear();
                self.degraded.clear();
                self.transition(LoaderState::Unloaded)?;
                Err(err)
            }
        }
    }

    fn attach_all(&mut self) -> Result<(), Error> {
        let Some(lifecycle) = self.lifecycle_obj.as_mut() else {
            return Err(Error::ProbeLoad {
                object: LIFECYCLE_OBJECT.into(),
                reason: "object not loaded".into(),
            });
        };

        // Lifecycle tracepoints: failures here are fatal.
        for (name, category, event) in [
            ("sys_enter_clone", "syscalls", "sys_enter_clone"),
            ("sys_enter_exit", "syscalls", "sys_enter_exit"),
            ("sched_process_exec", "sched", "sched_process_exec"),
        ] {
            attach_tracepoint(lifecycle, name, category, event)?;
            self.attached.push(name.to_string());
        }

        // Kprobes and the tcp_probe tracepoint degrade on failure: missing
        // the TCP probe means latency is unavailable but flows still
        // accumulate packets and bytes.
        match attach_kprobe(lifecycle, "cgroup_attach_task", "cgroup_attach_task") {
            Ok(()) => self.attached.push("cgroup_attach_task".to_string()),
            Err(err) => {
                warn!("continuing without cgroup_attach_task: {err}");
                self.degraded.push("cgroup_attach_task".to_string());
            }
        }

        let Some(network) = self.network_obj.as_mut() else {
            return Err(Error::ProbeLoad {
                object: NETWORK_OBJECT.into(),
                reason: "object not loaded".into(),
            });
        };
        for (name, result) in [
            (
                "tcp_retransmit_skb",
                attach_kprobe(network, "tcp_retransmit_skb", "tcp_retransmit_skb"),
            ),
            (
                "tcp_probe",
                attach_tracepoint(network, "tcp_probe", "tcp", "tcp_probe"),
            ),
        ] {
            match result {
                Ok(()) => self.attached.push(name.to_string()),
                Err(err) => {
                    warn!("continuing without {name}: {err}");
                    self.degraded.push(name.to_string());
                }
            }
        }

        match self.config.system.network_interface.clone() {
            Some(iface) => {
                // clsact may already exist from a previous run.
                let _ = tc::qdisc_add_clsact(&iface);
                for (name, kind) in [
                    ("tc_ingress", TcAttachType::Ingress),
                    ("tc_egress", TcAttachType::Egress),
                ] {
                    match attach_tc(network, name, &iface, kind) {
                        Ok(()) => self.attached.push(name.to_string()),
                        Err(err) => {
                            warn!("continuing without {name}: {err}");
                            self.degraded.push(name.to_string());
                        }
                    }
                }
            }
            None => info!("no network interface configured, skipping TC attachment"),
        }
        Ok(())
    }

    /// Take the maps and spawn the long-lived tasks. Calling start while
    /// running is an error and modifies nothing.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.state == LoaderState::Running {
            return Err(Error::AlreadyRunning);
        }
        if self.state != LoaderState::Attached {
            return Err(Error::InvalidTransition {
                from: self.state.as_str(),
                to: LoaderState::Running.as_str(),
            });
        }

        let (lifecycle_obj, network_obj) =
            match (self.lifecycle_obj.as_mut(), self.network_obj.as_mut()) {
                (Some(l), Some(n)) => (l, n),
                _ => {
                    return Err(Error::ProbeLoad {
                        object: LIFECYCLE_OBJECT.into(),
                        reason: "object not loaded".into(),
                    });
                }
            };
        let (kernel_maps, lifecycle_ring, network_ring) =
            KernelMaps::take(lifecycle_obj, network_obj)?;
        let kernel_maps = Arc::new(Mutex::new(kernel_maps));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump = EventPump::new(
            self.aggregator.clone(),
            self.pools.clone(),
            self.pump_stats.clone(),
        );
        // The pump tick doubles as the dashboard refresh rate; both default
        // to 100 ms.
        let tick = if self.config.display.refresh_rate.is_zero() {
            pump::TICK
        } else {
            self.config.display.refresh_rate
        };
        self.tasks.push(tokio::spawn(pump.run(
            lifecycle_ring,
            network_ring,
            tick,
            shutdown_rx.clone(),
        )));

        self.tasks.push(tokio::spawn(aggregator_loop(
            self.aggregator.clone(),
            kernel_maps.clone(),
            self.pools.clone(),
            self.budget.clone(),
            self.pump_stats.clone(),
            self.config.clone(),
            shutdown_rx.clone(),
        )));

        let reaper = Reaper::new(self.aggregator.clone(), self.pools.clone());
        self.tasks.push(tokio::spawn(reaper_loop(
            reaper,
            kernel_maps,
            shutdown_rx.clone(),
        )));

        self.tasks.push(tokio::spawn(budget_loop(
            self.budget.clone(),
            self.pools.clone(),
            self.aggregator.clone(),
            shutdown_rx,
        )));

        self.shutdown = Some(shutdown_tx);
        self.transition(LoaderState::Running)?;
        info!(
            "agent running: {} programs attached, {} degraded",
            self.attached.len(),
            self.degraded.len()
        );
        Ok(())
    }

    /// Cooperative shutdown: signal, wait out the grace period, abort
    /// stragglers, detach in reverse order. Stop when not running succeeds
    /// as a no-op.
    pub async fn stop(&mut self) -> Result<(), Error> {
        if self.state != LoaderState::Running {
            return Ok(());
        }
        self.transition(LoaderState::Stopping)?;

        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        for task in self.tasks.drain(..) {
            // Dropping a timed-out JoinHandle would leave the task running
            // detached, still holding its map handles; abort it for real.
            let abort = task.abort_handle();
            match tokio::time::timeout(self.grace, task).await {
                Ok(_) => {}
                Err(_) => {
                    abort.abort();
                    warn!("task did not stop within grace period, aborting");
                }
            }
        }

        // Dropping the objects closes every attachment and map fd.
        self.network_obj = None;
        self.lifecycle_obj = None;
        self.attached.clear();
        self.degraded.clear();
        self.transition(LoaderState::Unloaded)?;
        info!("agent stopped, probes detached");
        Ok(())
    }
}

async fn aggregator_loop(
    aggregator: Arc<Aggregator>,
    kernel_maps: Arc<Mutex<KernelMaps>>,
    pools: Arc<PoolSet>,
    budget: Arc<MemoryBudget>,
    pump_stats: Arc<PumpStats>,
    config: Config,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut resolver = CgroupResolver::new(
        config.system.max_containers,
        config.runtime_filter(),
    );
    let mut sampler = ProcSampler::new();
    let throttle = LogThrottle::per_minute();
    let mut interval = tokio::time::interval(config.sampling_rate());
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let targets = aggregator.sampling_targets();
                let now_ns = maps::monotonic_now_ns();
                for event in sampler.sample(&targets, now_ns, &pools) {
                    aggregator.handle_event(&event);
                }

                let memory_usage = budget.current_bytes();
                let decode_failures = pump_stats.decode_failures();
                let result = {
                    let Ok(mut maps_guard) = kernel_maps.lock() else {
                        continue;
                    };
                    aggregator.poll_cycle(
                        &mut *maps_guard,
                        &mut resolver,
                        &pools,
                        decode_failures,
                        memory_usage,
                    )
                };
                if let Err(err) = result {
                    // A failed map iteration invalidates this cycle only.
                    if throttle.should_log(err.kind()) {
                        warn!("aggregation cycle skipped: {err}");
                    }
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

async fn reaper_loop(
    reaper: Reaper,
    kernel_maps: Arc<Mutex<KernelMaps>>,
    shutdown: watch::Receiver<bool>,
) {
    struct SharedSource(Arc<Mutex<KernelMaps>>);

    impl TelemetrySource for SharedSource {
        fn containers_into(
            &mut self,
            out: &mut Vec<(u64, microradar_common::ContainerInfo)>,
        ) -> Result<(), Error> {
            match self.0.lock() {
                Ok(mut maps) => maps.containers_into(out),
                Err(_) => Err(poisoned()),
            }
        }

        fn flows_into(
            &mut self,
            out: &mut Vec<(microradar_common::FlowKey, microradar_common::FlowStats)>,
        ) -> Result<(), Error> {
            match self.0.lock() {
                Ok(mut maps) => maps.flows_into(out),
                Err(_) => Err(poisoned()),
            }
        }

        fn dropped_events(&mut self) -> u64 {
            self.0.lock().map(|mut m| m.dropped_events()).unwrap_or(0)
        }

        fn remove_container(&mut self, cgroup_id: u64) {
            if let Ok(mut maps) = self.0.lock() {
                maps.remove_container(cgroup_id);
            }
        }

        fn remove_flow(&mut self, key: &microradar_common::FlowKey) {
            if let Ok(mut maps) = self.0.lock() {
                maps.remove_flow(key);
            }
        }

        fn map_count(&self) -> usize {
            maps::MAP_SPECS.len()
        }

        fn prune_pending(&mut self, now_ns: u64, horizon_ns: u64) {
            if let Ok(mut maps) = self.0.lock() {
                maps.prune_pending(now_ns, horizon_ns);
            }
        }
    }

    fn poisoned() -> Error {
        Error::MapAccess {
            context: "kernel map lock poisoned".into(),
        }
    }

    reaper
        .run(SharedSource(kernel_maps), maps::monotonic_now_ns, shutdown)
        .await;
}

async fn budget_loop(
    budget: Arc<MemoryBudget>,
    pools: Arc<PoolSet>,
    aggregator: Arc<Aggregator>,
    mut shutdown: watch::Receiver<bool>,
) {
    let static_bytes = maps::static_map_bytes();
    let throttle = LogThrottle::per_minute();
    let mut interval = tokio::time::interval(BUDGET_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                supervise(
                    &budget,
                    &pools,
                    static_bytes,
                    aggregator.approx_bytes(),
                    &throttle,
                );
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn raise_memlock() {
    #[cfg(target_os = "linux")]
    {
        use nix::sys::resource::{Resource, setrlimit};
        if let Err(err) = setrlimit(
            Resource::RLIMIT_MEMLOCK,
            nix::sys::resource::RLIM_INFINITY,
            nix::sys::resource::RLIM_INFINITY,
        ) {
            warn!("could not raise RLIMIT_MEMLOCK: {err}; map creation may fail");
        }
    }
}

fn load_object(path: PathBuf, object: &str) -> Result<Ebpf, Error> {
    Ebpf::load_file(&path).map_err(|err| {
        let reason = err.to_string();
        if reason.contains("not permitted") || reason.contains("EPERM") {
            Error::Permission(format!("loading {object} from {}", path.display()))
        } else {
            Error::ProbeLoad {
                object: object.to_string(),
                reason,
            }
        }
    })
}

fn attach_tracepoint(obj: &mut Ebpf, name: &str, category: &str, event: &str) -> Result<(), Error> {
    let hook = format!("{category}/{event}");
    let program: &mut TracePoint = obj
        .program_mut(name)
        .ok_or_else(|| missing_program(name, &hook))?
        .try_into()
        .map_err(|e: aya::programs::ProgramError| attach_error(name, &hook, &e))?;
    program
        .load()
        .map_err(|e| attach_error(name, &hook, &e))?;
    program
        .attach(category, event)
        .map_err(|e| attach_error(name, &hook, &e))?;
    Ok(())
}

fn attach_kprobe(obj: &mut Ebpf, name: &str, target: &str) -> Result<(), Error> {
    let program: &mut KProbe = obj
        .program_mut(name)
        .ok_or_else(|| missing_program(name, target))?
        .try_into()
        .map_err(|e: aya::programs::ProgramError| attach_error(name, target, &e))?;
    program
        .load()
        .map_err(|e| attach_error(name, target, &e))?;
    program
        .attach(target, 0)
        .map_err(|e| attach_error(name, target, &e))?;
    Ok(())
}

fn attach_tc(obj: &mut Ebpf, name: &str, iface: &str, kind: TcAttachType) -> Result<(), Error> {
    let hook = format!("tc/{iface}");
    let program: &mut SchedClassifier = obj
        .program_mut(name)
        .ok_or_else(|| missing_program(name, &hook))?
        .try_into()
        .map_err(|e: aya::programs::ProgramError| attach_error(name, &hook, &e))?;
    program
        .load()
        .map_err(|e| attach_error(name, &hook, &e))?;
    program
        .attach(iface, kind)
        .map_err(|e| attach_error(name, &hook, &e))?;
    Ok(())
}

fn missing_program(program: &str, hook: &str) -> Error {
    Error::ProbeAttach {
        program: program.to_string(),
        hook: hook.to_string(),
        reason: "program not found in object".to_string(),
    }
}

fn attach_error(program: &str, hook: &str, err: &dyn fmt::Display) -> Error {
    Error::ProbeAttach {
        program: program.to_string(),
        hook: hook.to_string(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::aggregate::DEFAULT_TOTAL_MEMORY_BYTES;

    fn test_loader() -> Loader {
        let store = Arc::new(crate::snapshot::SnapshotStore::new());
        let aggregator = Arc::new(Aggregator::new(store, DEFAULT_TOTAL_MEMORY_BYTES, 100));
        Loader::new(
            Config::default(),
            aggregator,
            Arc::new(PoolSet::new()),
            Arc::new(MemoryBudget::new(48 * 1024 * 1024)),
        )
    }

    #[test]
    fn test_transition_table() {
        use LoaderState::*;
        assert!(Unloaded.can_transition_to(Loaded));
        assert!(Loaded.can_transition_to(Attached));
        assert!(Attached.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Unloaded));
        // Unwind paths.
        assert!(Loaded.can_transition_to(Unloaded));
        assert!(Attached.can_transition_to(Unloaded));
        // No skipping ahead.
        assert!(!Unloaded.can_transition_to(Running));
        assert!(!Running.can_transition_to(Unloaded));
        assert!(!Attached.can_transition_to(Stopping));
    }

    #[test]
    fn test_start_from_unloaded_is_invalid() {
        let mut loader = test_loader();
        let err = loader.start().unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
        assert_eq!(loader.status().state, LoaderState::Unloaded);
    }

    #[test]
    fn test_start_while_running_errors_without_state_change() {
        let mut loader = test_loader();
        loader.state = LoaderState::Running;
        loader.status.set(LoaderState::Running);
        let err = loader.start().unwrap_err();
        assert_eq!(err.kind(), "already_running");
        assert_eq!(loader.status().state, LoaderState::Running);
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_noop_success() {
        let mut loader = test_loader();
        loader.stop().await.unwrap();
        loader.stop().await.unwrap();
        assert_eq!(loader.status().state, LoaderState::Unloaded);
    }

    #[tokio::test]
    async fn test_stop_aborts_tasks_that_ignore_shutdown() {
        let mut loader = test_loader();
        loader.grace = Duration::from_millis(50);

        // A task that never looks at the shutdown channel.
        let stubborn = tokio::spawn(async {
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        });
        let probe = stubborn.abort_handle();
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        loader.tasks.push(stubborn);
        loader.shutdown = Some(shutdown_tx);
        loader.state = LoaderState::Running;
        loader.status.set(LoaderState::Running);

        let started = std::time::Instant::now();
        loader.stop().await.unwrap();
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "stop() must return promptly once the grace period expires"
        );
        assert_eq!(loader.status().state, LoaderState::Unloaded);

        // The straggler was force-terminated, not left running detached.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(probe.is_finished());
    }

    #[test]
    fn test_status_reports_maps() {
        let loader = test_loader();
        let status = loader.status();
        assert_eq!(status.maps.len(), 8);
        assert!(status.attached.is_empty());
        assert!(!loader.status_handle().is_healthy());
    }
}
