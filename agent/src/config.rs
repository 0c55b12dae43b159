// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Agent configuration.
//!
//! Loaded from YAML; every section and field has a default so an absent file
//! yields a runnable configuration. Validation failures are fatal at startup.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::errors::Error;

const DEFAULT_CONFIG_PATH: &str = "/etc/microradar/config.yaml";
const DEFAULT_PROBE_DIR: &str = "/usr/lib/microradar";
const DEFAULT_HTTP_LISTEN: &str = "0.0.0.0:9102";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub system: SystemConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitoringConfig {
    /// Which runtimes to monitor. Empty means every detected runtime.
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub alert_thresholds: AlertThresholds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub name: String,
    pub runtime: RuntimeKind,
    #[serde(default = "default_metrics")]
    pub metrics: Vec<MetricKind>,
    #[serde(default = "default_sampling_rate", with = "duration_str")]
    pub sampling_rate: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Containerd,
    #[serde(rename = "cri-o")]
    CriO,
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeKind::Docker => write!(f, "docker"),
            RuntimeKind::Containerd => write!(f, "containerd"),
            RuntimeKind::CriO => write!(f, "cri-o"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Cpu,
    Memory,
    NetworkLatency,
    TcpRetransmits,
    DiskIo,
    NetworkIo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertThresholds {
    /// CPU percent, (0, 100].
    #[serde(default = "default_cpu_threshold")]
    pub cpu: f64,
    /// Memory percent, (0, 100].
    #[serde(default = "default_memory_threshold")]
    pub memory: f64,
    /// Milliseconds, > 0.
    #[serde(default = "default_latency_threshold")]
    pub network_latency: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu: default_cpu_threshold(),
            memory: default_memory_threshold(),
            network_latency: default_latency_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DisplayConfig {
    #[serde(default = "default_refresh_rate", with = "duration_str")]
    pub refresh_rate: Duration,
    #[serde(default = "default_theme")]
    pub theme: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            refresh_rate: default_refresh_rate(),
            theme: default_theme(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemConfig {
    #[serde(default = "default_max_containers")]
    pub max_containers: u32,
    /// Soft memory cap for the whole agent, e.g. "48MB".
    #[serde(default = "default_memory_limit", with = "size_str")]
    pub memory_limit: u64,
    #[serde(default)]
    pub log_level: LogLevel,
    /// Directory holding the compiled probe objects.
    #[serde(default = "default_probe_dir")]
    pub probe_dir: PathBuf,
    /// Interface for the TC programs. None skips TC attachment.
    #[serde(default)]
    pub network_interface: Option<String>,
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            max_containers: default_max_containers(),
            memory_limit: default_memory_limit(),
            log_level: LogLevel::default(),
            probe_dir: default_probe_dir(),
            network_interface: None,
            http_listen: default_http_listen(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_level(self) -> log::Level {
        match self {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

fn default_metrics() -> Vec<MetricKind> {
    vec![
        MetricKind::Cpu,
        MetricKind::Memory,
        MetricKind::NetworkLatency,
        MetricKind::TcpRetransmits,
    ]
}

fn default_sampling_rate() -> Duration {
    Duration::from_secs(2)
}

fn default_refresh_rate() -> Duration {
    Duration::from_millis(100)
}

fn default_theme() -> String {
    "dark".to_string()
}

fn default_cpu_threshold() -> f64 {
    70.0
}

fn default_memory_threshold() -> f64 {
    80.0
}

fn default_latency_threshold() -> f64 {
    10.0
}

fn default_max_containers() -> u32 {
    1_000
}

fn default_memory_limit() -> u64 {
    48 * 1024 * 1024
}

fn default_probe_dir() -> PathBuf {
    PathBuf::from(DEFAULT_PROBE_DIR)
}

fn default_http_listen() -> String {
    DEFAULT_HTTP_LISTEN.to_string()
}

impl Config {
    /// Load from `path`, or from the default location. A missing file is not
    /// an error: defaults apply and a warning is logged.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        if !path.exists() {
            warn!(
                "config file not found at {}, using defaults",
                path.display()
            );
            return Ok(Config::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("could not read {}: {e}", path.display())))?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("could not parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        for target in &self.monitoring.targets {
            if target.name.is_empty() {
                return Err(Error::Config("target name must not be empty".into()));
            }
            if target.sampling_rate < Duration::from_secs(1) {
                return Err(Error::Config(format!(
                    "target {}: sampling_rate must be at least 1s",
                    target.name
                )));
            }
        }
        let thresholds = &self.monitoring.alert_thresholds;
        if !(thresholds.cpu > 0.0 && thresholds.cpu <= 100.0) {
            return Err(Error::Config(
                "alert_thresholds.cpu must be in (0, 100]".into(),
            ));
        }
        if !(thresholds.memory > 0.0 && thresholds.memory <= 100.0) {
            return Err(Error::Config(
                "alert_thresholds.memory must be in (0, 100]".into(),
            ));
        }
        if thresholds.network_latency <= 0.0 {
            return Err(Error::Config(
                "alert_thresholds.network_latency must be positive".into(),
            ));
        }
        if self.system.max_containers == 0 {
            return Err(Error::Config("system.max_containers must be positive".into()));
        }
        if self.system.memory_limit == 0 {
            return Err(Error::Config("system.memory_limit must be positive".into()));
        }
        Ok(())
    }

    /// Effective sampling rate: the fastest configured target, or the 2 s
    /// default when no targets are listed.
    pub fn sampling_rate(&self) -> Duration {
        self.monitoring
            .targets
            .iter()
            .map(|t| t.sampling_rate)
            .min()
            .unwrap_or_else(default_sampling_rate)
    }

    /// Runtimes to monitor; None means all detected runtimes.
    pub fn runtime_filter(&self) -> Option<Vec<RuntimeKind>> {
        if self.monitoring.targets.is_empty() {
            return None;
        }
        let mut runtimes = Vec::new();
        for target in &self.monitoring.targets {
            if !runtimes.contains(&target.runtime) {
                runtimes.push(target.runtime);
            }
        }
        Some(runtimes)
    }
}

/// Duration fields accept "100ms", "2s", "1m" or a bare number of seconds,
/// and serialize back to the smallest exact unit.
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }
        match Raw::deserialize(de)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse(&text).map_err(D::Error::custom),
        }
    }

    pub fn format(value: &Duration) -> String {
        let ms = value.as_millis();
        if ms == 0 {
            return "0s".to_string();
        }
        if ms % 60_000 == 0 {
            format!("{}m", ms / 60_000)
        } else if ms % 1_000 == 0 {
            format!("{}s", ms / 1_000)
        } else {
            format!("{ms}ms")
        }
    }

    pub fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        let (digits, unit) = match text.find(|c: char| !c.is_ascii_digit()) {
            Some(idx) => text.split_at(idx),
            None => (text, "s"),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration {text:?}"))?;
        match unit.trim() {
            "ms" => Ok(Duration::from_millis(value)),
            "s" => Ok(Duration::from_secs(value)),
            "m" => Ok(Duration::from_secs(value * 60)),
            other => Err(format!("unknown duration unit {other:?} in {text:?}")),
        }
    }
}

/// Size fields accept "48MB", "512KB", "1GB" (1024 multipliers, optional B)
/// and serialize back to the largest exact unit.
mod size_str {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    pub fn serialize<S: Serializer>(value: &u64, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(u64),
            Text(String),
        }
        match Raw::deserialize(de)? {
            Raw::Bytes(bytes) => Ok(bytes),
            Raw::Text(text) => parse(&text).map_err(D::Error::custom),
        }
    }

    pub fn format(bytes: u64) -> String {
        if bytes >= GB && bytes % GB == 0 {
            format!("{}GB", bytes / GB)
        } else if bytes >= MB && bytes % MB == 0 {
            format!("{}MB", bytes / MB)
        } else if bytes >= KB && bytes % KB == 0 {
            format!("{}KB", bytes / KB)
        } else {
            format!("{bytes}B")
        }
    }

    pub fn parse(text: &str) -> Result<u64, String> {
        let text = text.trim();
        let (digits, unit) = match text.find(|c: char| !c.is_ascii_digit()) {
            Some(idx) => text.split_at(idx),
            None => (text, "B"),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid size {text:?}"))?;
        match unit.trim().to_ascii_uppercase().as_str() {
            "B" | "" => Ok(value),
            "KB" | "K" => Ok(value * KB),
            "MB" | "M" => Ok(value * MB),
            "GB" | "G" => Ok(value * GB),
            other => Err(format!("unknown size unit {other:?} in {text:?}")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
monitoring:
  targets:
    - name: web
      runtime: docker
      metrics: [cpu, memory, network_latency]
      sampling_rate: 2s
    - name: batch
      runtime: containerd
      sampling_rate: 5s
  alert_thresholds:
    cpu: 75
    memory: 85
    network_latency: 15
display:
  refresh_rate: 100ms
  theme: dark
system:
  max_containers: 500
  memory_limit: 48MB
  log_level: debug
"#;

    #[test]
    fn test_parse_full_config() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.monitoring.targets.len(), 2);
        assert_eq!(config.monitoring.targets[0].runtime, RuntimeKind::Docker);
        assert_eq!(
            config.monitoring.targets[0].metrics,
            vec![
                MetricKind::Cpu,
                MetricKind::Memory,
                MetricKind::NetworkLatency
            ]
        );
        assert_eq!(config.sampling_rate(), Duration::from_secs(2));
        assert_eq!(config.monitoring.alert_thresholds.cpu, 75.0);
        assert_eq!(config.display.refresh_rate, Duration::from_millis(100));
        assert_eq!(config.system.max_containers, 500);
        assert_eq!(config.system.memory_limit, 48 * 1024 * 1024);
        assert_eq!(config.system.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        config.validate().unwrap();
        assert!(config.monitoring.targets.is_empty());
        assert_eq!(config.sampling_rate(), Duration::from_secs(2));
        assert_eq!(config.display.refresh_rate, Duration::from_millis(100));
        assert_eq!(config.system.max_containers, 1_000);
        assert_eq!(config.system.memory_limit, 48 * 1024 * 1024);
        assert_eq!(config.monitoring.alert_thresholds.cpu, 70.0);
        assert_eq!(config.monitoring.alert_thresholds.memory, 80.0);
        assert_eq!(config.monitoring.alert_thresholds.network_latency, 10.0);
        assert!(config.runtime_filter().is_none());
    }

    #[test]
    fn test_roundtrip_is_semantically_equal() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        let reserialized = serde_yaml::to_string(&config).unwrap();
        let reparsed: Config = serde_yaml::from_str(&reserialized).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn test_sampling_rate_below_one_second_rejected() {
        let yaml = r#"
monitoring:
  targets:
    - name: fast
      runtime: docker
      sampling_rate: 500ms
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_threshold_bounds() {
        for (field, yaml) in [
            ("cpu", "monitoring: { alert_thresholds: { cpu: 0 } }"),
            ("cpu", "monitoring: { alert_thresholds: { cpu: 101 } }"),
            ("memory", "monitoring: { alert_thresholds: { memory: -3 } }"),
            (
                "latency",
                "monitoring: { alert_thresholds: { network_latency: 0 } }",
            ),
        ] {
            let config: Config = serde_yaml::from_str(yaml).unwrap();
            assert!(config.validate().is_err(), "{field} bound not enforced");
        }
    }

    #[test]
    fn test_cri_o_runtime_name() {
        let yaml = r#"
monitoring:
  targets:
    - name: k8s
      runtime: cri-o
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.monitoring.targets[0].runtime, RuntimeKind::CriO);
        assert_eq!(RuntimeKind::CriO.to_string(), "cri-o");
    }

    #[test]
    fn test_duration_parsing() {
        assert_eq!(
            duration_str::parse("100ms").unwrap(),
            Duration::from_millis(100)
        );
        assert_eq!(duration_str::parse("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(duration_str::parse("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(duration_str::parse("7").unwrap(), Duration::from_secs(7));
        assert!(duration_str::parse("2h").is_err());
        assert_eq!(duration_str::format(&Duration::from_millis(100)), "100ms");
        assert_eq!(duration_str::format(&Duration::from_secs(120)), "2m");
    }

    #[test]
    fn test_size_parsing() {
        assert_eq!(size_str::parse("48MB").unwrap(), 48 * 1024 * 1024);
        assert_eq!(size_str::parse("512KB").unwrap(), 512 * 1024);
        assert_eq!(size_str::parse("1GB").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(size_str::parse("4096").unwrap(), 4096);
        assert!(size_str::parse("10TB").is_err());
        assert_eq!(size_str::format(48 * 1024 * 1024), "48MB");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = "system: { not_a_field: 1 }";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }
}
