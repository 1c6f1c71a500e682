use crate::config::QualityThresholds;
use crate::error::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use tokio::time::Instant;

/// Rolling latency samples kept per device
pub const LATENCY_WINDOW: usize = 20;
/// Starting reliability for a freshly discovered device
pub const INITIAL_RELIABILITY: f64 = 100.0;

/// Registry key for a speaker endpoint
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    pub host: String,
    pub port: u16,
}

impl DeviceId {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Error type for unparsable `host:port` strings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseDeviceIdError(pub String);

impl fmt::Display for ParseDeviceIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid device address '{}', expected host:port", self.0)
    }
}

impl std::error::Error for ParseDeviceIdError {}

impl FromStr for DeviceId {
    type Err = ParseDeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseDeviceIdError(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| ParseDeviceIdError(s.to_string()))?;
        if host.is_empty() || port == 0 {
            return Err(ParseDeviceIdError(s.to_string()));
        }
        Ok(DeviceId::new(host, port))
    }
}

/// How a device entered the registry
///
/// Declaration order is priority order: when two methods report the same endpoint,
/// the one declared first wins the metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMethod {
    Manual,
    Standard,
    Ssdp,
    Mdns,
    Scan,
}

impl DiscoveryMethod {
    /// Methods that can be run by the discovery engine
    pub const ALL: [DiscoveryMethod; 4] = [
        DiscoveryMethod::Standard,
        DiscoveryMethod::Ssdp,
        DiscoveryMethod::Mdns,
        DiscoveryMethod::Scan,
    ];

    /// Higher wins on metadata conflicts
    pub fn priority(&self) -> u8 {
        match self {
            DiscoveryMethod::Manual => 5,
            DiscoveryMethod::Standard => 4,
            DiscoveryMethod::Ssdp => 3,
            DiscoveryMethod::Mdns => 2,
            DiscoveryMethod::Scan => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryMethod::Manual => "manual",
            DiscoveryMethod::Standard => "standard",
            DiscoveryMethod::Ssdp => "ssdp",
            DiscoveryMethod::Mdns => "mdns",
            DiscoveryMethod::Scan => "scan",
        }
    }
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audio formats a speaker can pull from the bridge
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Aac,
    Flac,
    Wav,
}

impl AudioFormat {
    /// Match a UPnP protocolInfo / MIME fragment
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.to_ascii_lowercase();
        if mime.contains("audio/mpeg") || mime.contains("audio/mp3") {
            Some(AudioFormat::Mp3)
        } else if mime.contains("audio/aac") || mime.contains("audio/mp4") {
            Some(AudioFormat::Aac)
        } else if mime.contains("audio/flac") || mime.contains("audio/x-flac") {
            Some(AudioFormat::Flac)
        } else if mime.contains("audio/wav") || mime.contains("audio/x-wav") || mime.contains("audio/l16") {
            Some(AudioFormat::Wav)
        } else {
            None
        }
    }
}

/// Functional capability flags reported by probes and compatibility tests
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub volume: bool,
    pub playback: bool,
    pub grouping: bool,
    pub metadata: bool,
    #[serde(default)]
    pub formats: Vec<AudioFormat>,
}

/// A single functional capability checked against a speaker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Volume,
    Playback,
    Grouping,
    Metadata,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Volume,
        Capability::Playback,
        Capability::Grouping,
        Capability::Metadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Volume => "volume",
            Capability::Playback => "playback",
            Capability::Grouping => "grouping",
            Capability::Metadata => "metadata",
        }
    }
}

/// Description returned by a speaker probe
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescription {
    pub name: Option<String>,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub uuid: Option<String>,
    /// UPnP service types or equivalent service tags
    pub services: Vec<String>,
    pub formats: Vec<AudioFormat>,
}

/// Endpoint reported by a discovery method, before merging
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub id: DeviceId,
    pub name: Option<String>,
    pub model: Option<String>,
    pub method: DiscoveryMethod,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl DiscoveredDevice {
    pub fn new(host: impl Into<String>, port: u16, method: DiscoveryMethod) -> Self {
        Self {
            id: DeviceId::new(host, port),
            name: None,
            model: None,
            method,
            capabilities: Capabilities::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Registry entry for a validated speaker endpoint
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub name: Option<String>,
    pub model: Option<String>,
    pub method: DiscoveryMethod,
    pub capabilities: Capabilities,
    /// Rolling health indicator in [0, 100]
    pub reliability: f64,
    pub latency_samples: VecDeque<f64>,
    pub last_seen: DateTime<Utc>,
    #[serde(skip, default = "Instant::now")]
    pub last_seen_at: Instant,
    pub error_count: u64,
    #[serde(skip)]
    pub recent_errors: VecDeque<Instant>,
    pub manual: bool,
    /// Latched while reliability sits below the unreliable threshold
    pub unreliable: bool,
}

impl DeviceRecord {
    pub fn from_discovered(device: DiscoveredDevice, now: Instant) -> Self {
        Self {
            id: device.id,
            name: device.name,
            model: device.model,
            manual: device.method == DiscoveryMethod::Manual,
            method: device.method,
            capabilities: device.capabilities,
            reliability: INITIAL_RELIABILITY,
            latency_samples: VecDeque::with_capacity(LATENCY_WINDOW),
            last_seen: Utc::now(),
            last_seen_at: now,
            error_count: 0,
            recent_errors: VecDeque::new(),
            unreliable: false,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_seen = Utc::now();
        self.last_seen_at = now;
    }

    pub fn push_latency(&mut self, latency_ms: f64) {
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return;
        }
        if self.latency_samples.len() == LATENCY_WINDOW {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_ms);
    }

    pub fn mean_latency_ms(&self) -> Option<f64> {
        if self.latency_samples.is_empty() {
            return None;
        }
        Some(self.latency_samples.iter().sum::<f64>() / self.latency_samples.len() as f64)
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }
}

/// Network quality tier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl NetworkQuality {
    /// Classify latency, jitter and loss into a tier
    ///
    /// Worse inputs never produce a better tier.
    pub fn classify(
        latency_ms: f64,
        jitter_ms: f64,
        loss_percent: f64,
        thresholds: &QualityThresholds,
    ) -> Self {
        if !latency_ms.is_finite() || !jitter_ms.is_finite() || !loss_percent.is_finite() {
            return NetworkQuality::Poor;
        }
        if latency_ms > thresholds.fair_latency_ms || loss_percent > thresholds.max_loss_percent {
            return NetworkQuality::Poor;
        }
        if latency_ms < thresholds.excellent_latency_ms
            && jitter_ms < thresholds.excellent_jitter_ms
            && loss_percent == 0.0
        {
            NetworkQuality::Excellent
        } else if latency_ms < thresholds.good_latency_ms && jitter_ms < thresholds.good_jitter_ms {
            NetworkQuality::Good
        } else if jitter_ms < thresholds.fair_jitter_ms {
            NetworkQuality::Fair
        } else {
            NetworkQuality::Poor
        }
    }

    /// Contribution to the overall performance score
    pub fn score(&self) -> f64 {
        match self {
            NetworkQuality::Excellent => 100.0,
            NetworkQuality::Good => 75.0,
            NetworkQuality::Fair => 50.0,
            NetworkQuality::Poor => 20.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkQuality::Excellent => "excellent",
            NetworkQuality::Good => "good",
            NetworkQuality::Fair => "fair",
            NetworkQuality::Poor => "poor",
        }
    }
}

/// Per-device slice of a metric snapshot
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    pub reliability: f64,
    pub mean_latency_ms: Option<f64>,
    pub error_count: u64,
}

/// Point-in-time view of resource and audio health
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_percent: f64,
    /// Audio quality in [0, 100]
    pub audio_quality: f64,
    pub dropout_count: u64,
    pub underrun_count: u64,
    pub network_quality: NetworkQuality,
    pub devices: HashMap<String, DeviceMetrics>,
}

impl Default for MetricSnapshot {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_percent: 0.0,
            memory_bytes: 0,
            memory_percent: 0.0,
            audio_quality: 100.0,
            dropout_count: 0,
            underrun_count: 0,
            network_quality: NetworkQuality::Good,
            devices: HashMap::new(),
        }
    }
}

impl MetricSnapshot {
    /// Mean reliability across devices, `None` when no device is known
    pub fn mean_reliability(&self) -> Option<f64> {
        if self.devices.is_empty() {
            return None;
        }
        Some(self.devices.values().map(|d| d.reliability).sum::<f64>() / self.devices.len() as f64)
    }
}

/// One resource reading from the host
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceReading {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_total_bytes: u64,
}

impl ResourceReading {
    pub fn memory_percent(&self) -> f64 {
        if self.memory_total_bytes == 0 {
            return 0.0;
        }
        (self.memory_bytes as f64 / self.memory_total_bytes as f64 * 100.0).clamp(0.0, 100.0)
    }
}

/// Host capabilities computed at startup
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemCapabilityProfile {
    pub cores: usize,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub worker_support: bool,
    pub recommended_workers: usize,
    pub recommended_buffer_min_ms: u32,
    pub recommended_buffer_max_ms: u32,
}

impl SystemCapabilityProfile {
    /// Fraction of memory in use, 0.0 when totals are unknown
    pub fn memory_usage_ratio(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            return 0.0;
        }
        let used = self.total_memory_bytes.saturating_sub(self.available_memory_bytes);
        used as f64 / self.total_memory_bytes as f64
    }
}

/// Processing complexity applied to audio transforms
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingQuality {
    Full,
    Reduced,
}

/// Kind of problem detected in a snapshot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    HighCpu,
    HighMemory,
    AudioDropouts,
    BufferUnderruns,
    PoorNetwork,
    UnreliableDevices,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::HighCpu => "high_cpu",
            IssueKind::HighMemory => "high_memory",
            IssueKind::AudioDropouts => "audio_dropouts",
            IssueKind::BufferUnderruns => "buffer_underruns",
            IssueKind::PoorNetwork => "poor_network",
            IssueKind::UnreliableDevices => "unreliable_devices",
        }
    }

    /// Tuning condition this issue maps to
    pub fn condition(&self) -> TuningCondition {
        match self {
            IssueKind::HighCpu => TuningCondition::HighCpu,
            IssueKind::HighMemory => TuningCondition::HighMemory,
            IssueKind::AudioDropouts => TuningCondition::AudioDropouts,
            IssueKind::BufferUnderruns => TuningCondition::BufferUnderruns,
            IssueKind::PoorNetwork => TuningCondition::PoorNetwork,
            IssueKind::UnreliableDevices => TuningCondition::DeviceUnreliable,
        }
    }
}

/// A tagged, severity-ranked problem
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub detail: String,
}

/// Condition that may trigger auto-tuning
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuningCondition {
    HighCpu,
    HighMemory,
    AudioDropouts,
    BufferUnderruns,
    PoorNetwork,
    DeviceUnreliable,
    LowPerformance,
}

impl TuningCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            TuningCondition::HighCpu => "high_cpu",
            TuningCondition::HighMemory => "high_memory",
            TuningCondition::AudioDropouts => "audio_dropouts",
            TuningCondition::BufferUnderruns => "buffer_underruns",
            TuningCondition::PoorNetwork => "poor_network",
            TuningCondition::DeviceUnreliable => "device_unreliable",
            TuningCondition::LowPerformance => "low_performance",
        }
    }
}

/// A configuration delta with absolute targets
///
/// Targets are absolute so applying the same delta twice converges.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Optimization {
    IncreaseBuffer { new_min: u32, new_max: u32 },
    ReduceBuffer { new_min: u32, new_max: u32 },
    SetWorkers { workers: usize },
    SetProcessingQuality { quality: ProcessingQuality },
}

impl Optimization {
    /// Subsystem the delta mutates
    pub fn subsystem(&self) -> &'static str {
        match self {
            Optimization::IncreaseBuffer { .. } | Optimization::ReduceBuffer { .. } => "buffer",
            Optimization::SetWorkers { .. } => "workers",
            Optimization::SetProcessingQuality { .. } => "processing",
        }
    }
}

/// What started a tuning decision
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuningTrigger {
    Auto(TuningCondition),
    Manual,
}

impl TuningTrigger {
    pub fn tag(&self) -> &'static str {
        match self {
            TuningTrigger::Auto(condition) => condition.as_str(),
            TuningTrigger::Manual => "manual",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum DecisionOutcome {
    Applied,
    Failed(String),
}

/// Immutable record of one tuning application
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TuningDecision {
    pub id: u64,
    pub trigger: TuningTrigger,
    pub timestamp: DateTime<Utc>,
    #[serde(skip, default = "Instant::now")]
    pub at: Instant,
    pub deltas: Vec<Optimization>,
    pub outcome: DecisionOutcome,
}

impl TuningDecision {
    pub fn is_applied(&self) -> bool {
        self.outcome == DecisionOutcome::Applied
    }
}
