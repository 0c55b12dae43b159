// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Prometheus exposition rendering.
//!
//! Output is deterministic: HELP and TYPE precede each block and container
//! lines are ordered by cgroup id numerically ascending, so two renders of
//! the same snapshot are byte-identical and scrapes diff cleanly.

use std::fmt::Write;

use crate::snapshot::Snapshot;

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn container_block<F>(out: &mut String, snapshot: &Snapshot, name: &str, help: &str, kind: &str, value: F)
where
    F: Fn(&crate::snapshot::ContainerMetrics) -> f64,
{
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    for container in &snapshot.containers {
        let _ = writeln!(
            out,
            "{name}{{container_id=\"{}\",container_name=\"{}\"}} {}",
            escape_label(&container.container_id),
            escape_label(&container.name),
            value(container)
        );
    }
}

fn gauge(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

/// Render a snapshot as Prometheus text. With no snapshot published yet the
/// agent reports itself down and nothing else.
pub fn render_prometheus(snapshot: Option<&Snapshot>, uptime_seconds: u64) -> String {
    let Some(snapshot) = snapshot else {
        return "microradar_up 0\n".to_string();
    };

    let mut out = String::with_capacity(4 * 1024);
    gauge(&mut out, "microradar_up", "Whether the agent is running.", 1);
    gauge(
        &mut out,
        "microradar_containers_total",
        "Containers currently monitored.",
        snapshot.containers.len(),
    );
    gauge(
        &mut out,
        "microradar_ebpf_maps_count",
        "Kernel maps owned by the agent.",
        snapshot.kernel_maps_count,
    );
    gauge(
        &mut out,
        "microradar_memory_usage_bytes",
        "Agent memory in use against the soft cap.",
        snapshot.memory_usage_bytes,
    );
    gauge(
        &mut out,
        "microradar_events_dropped_total",
        "Ring buffer records dropped at reservation or decode.",
        snapshot.events_dropped,
    );
    gauge(
        &mut out,
        "microradar_decode_failures_total",
        "Ring buffer records that failed to decode.",
        snapshot.decode_failures,
    );

    container_block(
        &mut out,
        snapshot,
        "microradar_container_cpu_percent",
        "Container CPU usage percent.",
        "gauge",
        |c| c.cpu_percent,
    );
    container_block(
        &mut out,
        snapshot,
        "microradar_container_memory_percent",
        "Container memory usage percent of host total.",
        "gauge",
        |c| c.memory_percent,
    );
    container_block(
        &mut out,
        snapshot,
        "microradar_container_memory_bytes",
        "Container memory usage in bytes.",
        "gauge",
        |c| c.memory_bytes as f64,
    );
    container_block(
        &mut out,
        snapshot,
        "microradar_container_network_latency_ms",
        "Mean TCP round-trip latency in milliseconds.",
        "gauge",
        |c| c.network_latency_ms,
    );
    container_block(
        &mut out,
        snapshot,
        "microradar_container_tcp_retransmits",
        "TCP retransmissions observed for the container.",
        "counter",
        |c| c.tcp_retransmits as f64,
    );

    let _ = writeln!(
        &mut out,
        "# HELP microradar_uptime_seconds Agent uptime in seconds."
    );
    let _ = writeln!(&mut out, "# TYPE microradar_uptime_seconds counter");
    let _ = writeln!(&mut out, "microradar_uptime_seconds {uptime_seconds}");
    out
}
