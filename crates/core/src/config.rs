//! Bridge configuration document
//!
//! The document is TOML with one table per concern. Every section is optional and
//! falls back to its defaults. Out-of-range values never fail the load: `validate`
//! corrects them in place and reports each correction as a [`ConfigIssue`].

use crate::error::{BridgeError, Result};
use crate::models::DiscoveryMethod;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Smallest buffer size accepted anywhere in the runtime (ms)
pub const MIN_BUFFER_MS: u32 = 64;
/// Largest buffer size accepted anywhere in the runtime (ms)
pub const MAX_BUFFER_MS: u32 = 2048;
/// Hard ceiling for the worker pool
pub const WORKER_CEILING: usize = 16;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub basic: BasicConfig,
    pub audio: AudioConfig,
    pub performance: PerformanceConfig,
    pub devices: DevicesConfig,
    pub discovery: DiscoveryConfig,
    pub network: NetworkConfig,
    pub tuning: TuningConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicConfig {
    /// Timeout for probes and discovery, in seconds (1-300)
    pub timeout_secs: u64,
    pub verbose: bool,
    /// Local service ports (AirPlay receiver, audio stream server)
    pub ports: Vec<u16>,
}

impl Default for BasicConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5,
            verbose: false,
            ports: vec![5000, 8000],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub adaptive_buffering: bool,
    pub min_buffer_ms: u32,
    pub max_buffer_ms: u32,
    pub buffer_step_ms: u32,
    pub buffer_cooldown_ms: u64,
    pub underrun_threshold: u32,
    pub overrun_threshold: u32,
    /// Reset counters when an adjustment is suppressed by the cooldown
    pub suppressed_resets_counters: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            adaptive_buffering: true,
            min_buffer_ms: 200,
            max_buffer_ms: 500,
            buffer_step_ms: 50,
            buffer_cooldown_ms: 5000,
            underrun_threshold: 3,
            overrun_threshold: 10,
            suppressed_resets_counters: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub worker_threads: bool,
    pub max_workers: usize,
    pub sample_interval_ms: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            worker_threads: true,
            max_workers: 4,
            sample_interval_ms: 1000,
        }
    }
}

/// A speaker entered by hand rather than discovered
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualDevice {
    pub host: String,
    #[serde(default = "default_speaker_port")]
    pub port: u16,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_speaker_port() -> u16 {
    1400
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    pub manual: Vec<ManualDevice>,
    /// Discovered devices silent for longer than this are evicted
    pub silence_window_secs: u64,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            manual: Vec::new(),
            silence_window_secs: 600,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub methods: Vec<DiscoveryMethod>,
    /// Background rediscovery period; 0 disables it
    pub interval_secs: u64,
    pub mdns_service_types: Vec<String>,
    pub ssdp_search_targets: Vec<String>,
    pub scan_ports: Vec<u16>,
    pub scan_concurrency: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            methods: DiscoveryMethod::ALL.to_vec(),
            interval_secs: 300,
            mdns_service_types: vec![
                "_sonos._tcp.local.".to_string(),
                "_raop._tcp.local.".to_string(),
            ],
            ssdp_search_targets: vec![
                "urn:schemas-upnp-org:device:MediaRenderer:1".to_string(),
                "urn:schemas-upnp-org:device:ZonePlayer:1".to_string(),
            ],
            scan_ports: vec![1400],
            scan_concurrency: 64,
        }
    }
}

/// Monotonic latency/jitter/loss cutoffs for network quality tiers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub excellent_latency_ms: f64,
    pub excellent_jitter_ms: f64,
    pub good_latency_ms: f64,
    pub good_jitter_ms: f64,
    pub fair_latency_ms: f64,
    pub fair_jitter_ms: f64,
    pub max_loss_percent: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            excellent_latency_ms: 20.0,
            excellent_jitter_ms: 5.0,
            good_latency_ms: 50.0,
            good_jitter_ms: 15.0,
            fair_latency_ms: 150.0,
            fair_jitter_ms: 30.0,
            max_loss_percent: 2.0,
        }
    }
}

impl QualityThresholds {
    fn is_monotonic(&self) -> bool {
        self.excellent_latency_ms <= self.good_latency_ms
            && self.good_latency_ms <= self.fair_latency_ms
            && self.excellent_jitter_ms <= self.good_jitter_ms
            && self.good_jitter_ms <= self.fair_jitter_ms
            && self.max_loss_percent >= 0.0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Background diagnostics period; 0 disables it
    pub diagnostics_interval_secs: u64,
    pub internet_probe_addrs: Vec<String>,
    pub dns_probe_host: String,
    pub latency_probe_count: u32,
    /// Optional URL downloaded to estimate bandwidth
    pub bandwidth_url: Option<String>,
    pub quality: QualityThresholds,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            diagnostics_interval_secs: 600,
            internet_probe_addrs: vec!["1.1.1.1:53".to_string(), "8.8.8.8:53".to_string()],
            dns_probe_host: "www.apple.com".to_string(),
            latency_probe_count: 5,
            bandwidth_url: None,
            quality: QualityThresholds::default(),
        }
    }
}

/// Policy constants for the monitor and the auto-tuner
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub auto_tuning: bool,
    pub cooldown_ms: u64,
    pub history_limit: usize,
    pub dropout_penalty: f64,
    pub quality_recovery_per_tick: f64,
    pub reliability_error_penalty: f64,
    pub reliability_connect_bonus: f64,
    pub reliability_error_window_secs: u64,
    pub unreliable_threshold: f64,
    pub high_cpu_percent: f64,
    pub high_memory_percent: f64,
    pub dropout_issue_threshold: u64,
    pub low_audio_quality: f64,
    /// Consecutive failed applications before auto-tuning pauses
    pub max_consecutive_failures: u32,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            auto_tuning: true,
            cooldown_ms: 30_000,
            history_limit: 50,
            dropout_penalty: 5.0,
            quality_recovery_per_tick: 1.0,
            reliability_error_penalty: 5.0,
            reliability_connect_bonus: 5.0,
            reliability_error_window_secs: 60,
            unreliable_threshold: 50.0,
            high_cpu_percent: 80.0,
            high_memory_percent: 85.0,
            dropout_issue_threshold: 3,
            low_audio_quality: 70.0,
            max_consecutive_failures: 3,
        }
    }
}

/// A single correction applied by [`BridgeConfig::validate`]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConfigIssue {
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl BridgeConfig {
    /// Parse a TOML document without validating it
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| BridgeError::Configuration(e.to_string()))
    }

    /// Load, parse and validate a config file
    ///
    /// An unreadable or unparsable file is an error; out-of-range values are not.
    pub fn load(path: &Path) -> Result<(Self, Vec<ConfigIssue>)> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&text)?;
        let issues = config.validate();
        info!(
            "Loaded configuration from {} ({} correction(s))",
            path.display(),
            issues.len()
        );
        Ok((config, issues))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| BridgeError::Configuration(e.to_string()))
    }

    /// Clamp or reset out-of-range values, logging every correction
    pub fn validate(&mut self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let defaults = BridgeConfig::default();

        if !(1..=300).contains(&self.basic.timeout_secs) {
            issues.push(ConfigIssue::new(
                "basic.timeout_secs",
                format!("{} outside 1-300, using {}", self.basic.timeout_secs, defaults.basic.timeout_secs),
            ));
            self.basic.timeout_secs = defaults.basic.timeout_secs;
        }

        if self.basic.ports.contains(&0) {
            issues.push(ConfigIssue::new("basic.ports", "port 0 removed"));
            self.basic.ports.retain(|p| *p != 0);
        }

        issues.extend(self.audio.validate(&defaults.audio));

        if self.performance.max_workers == 0 || self.performance.max_workers > WORKER_CEILING {
            issues.push(ConfigIssue::new(
                "performance.max_workers",
                format!(
                    "{} outside 1-{}, using {}",
                    self.performance.max_workers, WORKER_CEILING, defaults.performance.max_workers
                ),
            ));
            self.performance.max_workers = defaults.performance.max_workers;
        }

        if !(100..=60_000).contains(&self.performance.sample_interval_ms) {
            issues.push(ConfigIssue::new(
                "performance.sample_interval_ms",
                format!("{} outside 100-60000, using default", self.performance.sample_interval_ms),
            ));
            self.performance.sample_interval_ms = defaults.performance.sample_interval_ms;
        }

        let before = self.devices.manual.len();
        self.devices.manual.retain(|d| !d.host.trim().is_empty() && d.port != 0);
        if self.devices.manual.len() != before {
            issues.push(ConfigIssue::new(
                "devices.manual",
                format!("{} entries with empty host or port 0 dropped", before - self.devices.manual.len()),
            ));
        }

        if self.discovery.methods.is_empty() {
            issues.push(ConfigIssue::new("discovery.methods", "empty, enabling all methods"));
            self.discovery.methods = defaults.discovery.methods.clone();
        }
        if self.discovery.scan_concurrency == 0 || self.discovery.scan_concurrency > 256 {
            issues.push(ConfigIssue::new("discovery.scan_concurrency", "outside 1-256, using default"));
            self.discovery.scan_concurrency = defaults.discovery.scan_concurrency;
        }

        if !self.network.quality.is_monotonic() {
            issues.push(ConfigIssue::new(
                "network.quality",
                "thresholds are not monotonic, using defaults",
            ));
            self.network.quality = QualityThresholds::default();
        }
        if self.network.latency_probe_count == 0 || self.network.latency_probe_count > 50 {
            issues.push(ConfigIssue::new("network.latency_probe_count", "outside 1-50, using default"));
            self.network.latency_probe_count = defaults.network.latency_probe_count;
        }

        issues.extend(self.tuning.validate(&defaults.tuning));

        for issue in &issues {
            warn!("Config correction [{}]: {}", issue.field, issue.message);
        }
        issues
    }
}

impl AudioConfig {
    fn validate(&mut self, defaults: &AudioConfig) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let range = MIN_BUFFER_MS..=MAX_BUFFER_MS;

        if !range.contains(&self.min_buffer_ms) {
            issues.push(ConfigIssue::new(
                "audio.min_buffer_ms",
                format!("{} outside {}-{}, using {}", self.min_buffer_ms, MIN_BUFFER_MS, MAX_BUFFER_MS, defaults.min_buffer_ms),
            ));
            self.min_buffer_ms = defaults.min_buffer_ms;
        }
        if !range.contains(&self.max_buffer_ms) {
            issues.push(ConfigIssue::new(
                "audio.max_buffer_ms",
                format!("{} outside {}-{}, using {}", self.max_buffer_ms, MIN_BUFFER_MS, MAX_BUFFER_MS, defaults.max_buffer_ms),
            ));
            self.max_buffer_ms = defaults.max_buffer_ms;
        }
        if self.min_buffer_ms > self.max_buffer_ms {
            issues.push(ConfigIssue::new(
                "audio.min_buffer_ms",
                format!("min {} > max {}, swapping", self.min_buffer_ms, self.max_buffer_ms),
            ));
            std::mem::swap(&mut self.min_buffer_ms, &mut self.max_buffer_ms);
        }
        if self.buffer_step_ms == 0 || self.buffer_step_ms > MAX_BUFFER_MS {
            issues.push(ConfigIssue::new("audio.buffer_step_ms", "outside 1-2048, using default"));
            self.buffer_step_ms = defaults.buffer_step_ms;
        }
        if self.buffer_cooldown_ms > 600_000 {
            issues.push(ConfigIssue::new("audio.buffer_cooldown_ms", "above 600000, using default"));
            self.buffer_cooldown_ms = defaults.buffer_cooldown_ms;
        }
        issues
    }
}

impl TuningConfig {
    fn validate(&mut self, defaults: &TuningConfig) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.history_limit == 0 {
            issues.push(ConfigIssue::new("tuning.history_limit", "must be positive, using default"));
            self.history_limit = defaults.history_limit;
        }
        if !(0.0..=100.0).contains(&self.unreliable_threshold) {
            issues.push(ConfigIssue::new("tuning.unreliable_threshold", "outside 0-100, using default"));
            self.unreliable_threshold = defaults.unreliable_threshold;
        }
        for (field, value, default) in [
            ("tuning.dropout_penalty", &mut self.dropout_penalty, defaults.dropout_penalty),
            (
                "tuning.quality_recovery_per_tick",
                &mut self.quality_recovery_per_tick,
                defaults.quality_recovery_per_tick,
            ),
            (
                "tuning.reliability_error_penalty",
                &mut self.reliability_error_penalty,
                defaults.reliability_error_penalty,
            ),
            (
                "tuning.reliability_connect_bonus",
                &mut self.reliability_connect_bonus,
                defaults.reliability_connect_bonus,
            ),
        ] {
            if !value.is_finite() || !(0.0..=100.0).contains(&*value) {
                issues.push(ConfigIssue::new(field, "outside 0-100, using default"));
                *value = default;
            }
        }
        if !(1.0..=100.0).contains(&self.high_cpu_percent) {
            issues.push(ConfigIssue::new("tuning.high_cpu_percent", "outside 1-100, using default"));
            self.high_cpu_percent = defaults.high_cpu_percent;
        }
        if !(1.0..=100.0).contains(&self.high_memory_percent) {
            issues.push(ConfigIssue::new("tuning.high_memory_percent", "outside 1-100, using default"));
            self.high_memory_percent = defaults.high_memory_percent;
        }
        if self.max_consecutive_failures == 0 {
            issues.push(ConfigIssue::new("tuning.max_consecutive_failures", "must be positive, using default"));
            self.max_consecutive_failures = defaults.max_consecutive_failures;
        }
        issues
    }
}
