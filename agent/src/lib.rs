// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! MicroRadar: a lightweight container observability agent.
//!
//! Kernel probes capture container lifecycle events and per-flow network
//! telemetry into bounded shared maps; a userspace pipeline (pump,
//! aggregator, reaper, budget supervisor) folds them into immutable
//! snapshots exposed over HTTP in Prometheus format. Docker, containerd and
//! CRI-O workloads are identified uniformly through their kernel cgroup ids.

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

pub mod aggregate;
pub mod budget;
pub mod cli;
pub mod config;
pub mod errors;
pub mod events;
pub mod loader;
pub mod maps;
pub mod pump;
pub mod reaper;
pub mod render;
pub mod resolver;
pub mod sampler;
pub mod server;
pub mod snapshot;

// Re-export the public API
pub use aggregate::Aggregator;
pub use config::Config;
pub use errors::Error;
pub use loader::{Loader, LoaderState};
pub use snapshot::{Snapshot, SnapshotStore};
