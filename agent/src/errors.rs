// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A probe object could not be loaded. Fatal at startup.
    #[error("could not load probe object {object}: {reason}")]
    ProbeLoad { object: String, reason: String },

    /// A program could not be attached to its hook point. Fatal only for
    /// lifecycle tracepoints; everything else degrades the metric set.
    #[error("could not attach {program} to {hook}: {reason}")]
    ProbeAttach {
        program: String,
        hook: String,
        reason: String,
    },

    /// Transient failure iterating a kernel map. The cycle is skipped.
    #[error("kernel map access failed: {context}")]
    MapAccess { context: String },

    /// A ring-buffer record with an unknown tag or bad length.
    #[error("could not decode event record: {reason}")]
    Decode { reason: String },

    /// Current allocation exceeds the soft cap even after a sweep.
    #[error("memory budget exceeded: {current} of {cap} bytes in use")]
    BudgetExceeded { current: u64, cap: u64 },

    /// Configuration validation failure. Fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Insufficient privileges for eBPF operations.
    #[error("insufficient privileges: {0}; run as root or grant CAP_BPF")]
    Permission(String),

    /// start() while already running.
    #[error("agent is already running")]
    AlreadyRunning,

    /// A lifecycle operation requested from the wrong state.
    #[error("invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

impl Error {
    /// Stable kind label, used for log throttling and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ProbeLoad { .. } => "probe_load",
            Error::ProbeAttach { .. } => "probe_attach",
            Error::MapAccess { .. } => "map_access",
            Error::Decode { .. } => "decode",
            Error::BudgetExceeded { .. } => "budget_exceeded",
            Error::Config(_) => "config",
            Error::Permission(_) => "permission",
            Error::AlreadyRunning => "already_running",
            Error::InvalidTransition { .. } => "invalid_transition",
        }
    }
}

/// Rate limiter for task-level error logging: at most one log line per
/// unique kind per window, so a wedged map or a flood of bad records does
/// not turn into a log storm.
pub struct LogThrottle {
    window: Duration,
    last: Mutex<HashMap<&'static str, Instant>>,
}

impl LogThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Default once-per-minute policy.
    pub fn per_minute() -> Self {
        Self::new(Duration::from_secs(60))
    }

    /// Returns true when the caller should emit a log line for this kind.
    pub fn should_log(&self, kind: &'static str) -> bool {
        let Ok(mut last) = self.last.lock() else {
            return true;
        };
        let now = Instant::now();
        match last.get(kind) {
            Some(at) if now.duration_since(*at) < self.window => false,
            _ => {
                last.insert(kind, now);
                true
            }
        }
    }
}
