// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::path::PathBuf;

use clap::Parser;

/// Lightweight container observability agent.
#[derive(Parser, Debug, Clone)]
#[command(name = "microradar", version)]
#[command(about = "Kernel-telemetry container monitoring with Prometheus exposition")]
pub struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Write a PID file at this path
    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// HTTP listen address, overrides system.http_listen
    #[arg(long)]
    pub listen: Option<String>,

    /// Interface for the TC programs, overrides system.network_interface
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Directory holding the compiled probe objects, overrides
    /// system.probe_dir
    #[arg(long)]
    pub probe_dir: Option<PathBuf>,
}
