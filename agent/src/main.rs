// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

// Correctness
#![deny(clippy::indexing_slicing)]
#![deny(clippy::string_slice)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::undocumented_unsafe_blocks)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unimplemented)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

use microradar::aggregate::Aggregator;
use microradar::budget::{MemoryBudget, PoolSet};
use microradar::cli::Args;
use microradar::config::Config;
use microradar::loader::Loader;
use microradar::server::{self, ServerContext};
use microradar::snapshot::SnapshotStore;

fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("failed to create PID file parent directory")?;
    }
    fs::write(path, std::process::id().to_string()).context("failed to write PID file")?;
    info!("created PID file at {}", path.display());
    Ok(())
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        error!("failed to remove PID file: {e}");
    }
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(listen) = &args.listen {
        config.system.http_listen = listen.clone();
    }
    if let Some(interface) = &args.interface {
        config.system.network_interface = Some(interface.clone());
    }
    if let Some(probe_dir) = &args.probe_dir {
        config.system.probe_dir = probe_dir.clone();
    }
}

async fn run(config: Config) -> Result<()> {
    let started_at = Instant::now();

    let runtimes = microradar::resolver::detect_runtimes(Path::new("/proc"));
    if runtimes.is_empty() {
        log::warn!("no container runtime detected; containers will carry kernel-derived ids only");
    }
    for descriptor in &runtimes {
        info!(
            "detected runtime {} (socket: {:?}, pid: {:?})",
            descriptor.runtime, descriptor.socket_path, descriptor.pid
        );
    }

    let total_memory = Aggregator::host_total_memory(Path::new("/proc"));
    let store = Arc::new(SnapshotStore::new());
    let pools = Arc::new(PoolSet::new());
    let budget = Arc::new(MemoryBudget::new(config.system.memory_limit));
    let aggregator = Arc::new(Aggregator::new(
        store.clone(),
        total_memory,
        config.system.max_containers,
    ));

    let mut loader = Loader::new(config.clone(), aggregator, pools, budget);
    loader.load()?;
    loader.attach()?;
    loader.start()?;

    let listener = TcpListener::bind(&config.system.http_listen)
        .await
        .with_context(|| format!("failed to bind {}", config.system.http_listen))?;
    let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
    let server_ctx = ServerContext {
        store,
        status: loader.status_handle(),
        started_at,
    };
    let server_task = tokio::spawn(async move {
        if let Err(e) = server::serve(listener, server_ctx, server_shutdown_rx).await {
            error!("http server exited: {e}");
        }
    });

    let mut sigterm = signal(SignalKind::terminate()).context("failed to set up SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to set up SIGINT")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }

    loader.stop().await?;
    let _ = server_shutdown_tx.send(true);
    let _ = server_task.await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    simple_logger::init_with_level(config.system.log_level.to_level())
        .context("failed to initialize logging")?;
    info!(
        "starting microradar {} (sampling every {:?}, cap {} bytes)",
        env!("CARGO_PKG_VERSION"),
        config.sampling_rate(),
        config.system.memory_limit,
    );

    if let Some(path) = &args.pid_file {
        write_pid_file(path)?;
    }

    let result = run(config).await;

    if let Some(path) = &args.pid_file {
        remove_pid_file(path);
    }
    result
}
