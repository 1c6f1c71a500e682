//! Performance monitor
//!
//! Owns the live [`MetricSnapshot`] and the one closed at the previous tick. Resource
//! readings arrive once per tick; audio and device notifications are folded in as
//! they arrive.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tunebridge_core::{
    BridgeError, DeviceMetrics, DeviceRecord, Issue, IssueKind, MetricSnapshot, NetworkQuality, ResourceReading, Severity,
    TuningConfig,
};

/// Score weights: cpu headroom, memory headroom, audio quality, network tier, reliability
const WEIGHT_CPU: f64 = 0.25;
const WEIGHT_MEMORY: f64 = 0.15;
const WEIGHT_AUDIO: f64 = 0.30;
const WEIGHT_NETWORK: f64 = 0.15;
const WEIGHT_RELIABILITY: f64 = 0.15;

/// Usage above which a resource issue becomes critical
const CRITICAL_USAGE_PERCENT: f64 = 95.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceUpdate {
    Error,
    Connected,
    Latency(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            HealthStatus::Healthy
        } else if score >= 50.0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        }
    }
}

/// Health band change between two consecutive ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    pub from: HealthStatus,
    pub to: HealthStatus,
}

impl HealthTransition {
    pub fn is_decline(&self) -> bool {
        rank(self.to) < rank(self.from)
    }
}

fn rank(status: HealthStatus) -> u8 {
    match status {
        HealthStatus::Critical => 0,
        HealthStatus::Degraded => 1,
        HealthStatus::Healthy => 2,
    }
}

/// Reliability threshold crossing, reported once per crossing
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReliabilityChange {
    BecameUnreliable { reliability: f64 },
    Recovered { reliability: f64 },
}

pub struct PerformanceMonitor {
    policy: TuningConfig,
    current: MetricSnapshot,
    previous: Option<MetricSnapshot>,
    /// Counters at the last tick
    baseline_dropouts: u64,
    baseline_underruns: u64,
    /// Events seen during the last completed tick
    tick_dropouts: u64,
    tick_underruns: u64,
    failed_samples: u64,
}

impl PerformanceMonitor {
    pub fn new(policy: TuningConfig) -> Self {
        Self {
            policy,
            current: MetricSnapshot::default(),
            previous: None,
            baseline_dropouts: 0,
            baseline_underruns: 0,
            tick_dropouts: 0,
            tick_underruns: 0,
            failed_samples: 0,
        }
    }

    pub fn snapshot(&self) -> &MetricSnapshot {
        &self.current
    }

    /// Fold dropouts into the audio quality score
    ///
    /// `reported_quality` is the endpoint's own score; the lower of the two wins.
    pub fn record_audio_quality(&mut self, reported_quality: Option<f64>, dropouts: u64) {
        let penalty = self.policy.dropout_penalty * dropouts as f64;
        let mut quality = (self.current.audio_quality - penalty).max(0.0);
        if let Some(reported) = reported_quality.filter(|q| q.is_finite()) {
            quality = quality.min(reported.clamp(0.0, 100.0));
        }
        self.current.audio_quality = quality;
        self.current.dropout_count += dropouts;
        if dropouts > 0 {
            debug!("{} dropout(s), audio quality now {:.0}", dropouts, quality);
        }
    }

    pub fn record_underrun(&mut self) {
        self.current.underrun_count += 1;
    }

    pub fn set_network_quality(&mut self, quality: NetworkQuality) {
        if quality != self.current.network_quality {
            info!("Network quality {} -> {}", self.current.network_quality.as_str(), quality.as_str());
        }
        self.current.network_quality = quality;
    }

    pub fn set_device_metrics(&mut self, devices: std::collections::HashMap<String, DeviceMetrics>) {
        self.current.devices = devices;
    }

    /// Close the current tick with a fresh resource reading
    ///
    /// Reports a health band change against the snapshot closed at the previous tick.
    pub fn record_sample(&mut self, reading: ResourceReading) -> Option<HealthTransition> {
        self.tick_dropouts = self.current.dropout_count - self.baseline_dropouts;
        self.tick_underruns = self.current.underrun_count - self.baseline_underruns;
        self.baseline_dropouts = self.current.dropout_count;
        self.baseline_underruns = self.current.underrun_count;

        if self.tick_dropouts == 0 {
            self.current.audio_quality = (self.current.audio_quality + self.policy.quality_recovery_per_tick).min(100.0);
        }
        self.current.timestamp = chrono::Utc::now();
        self.current.cpu_percent = reading.cpu_percent.clamp(0.0, 100.0);
        self.current.memory_bytes = reading.memory_bytes;
        self.current.memory_percent = reading.memory_percent();

        let to = self.health_status();
        let transition = self
            .previous
            .as_ref()
            .map(|previous| HealthStatus::from_score(performance_score(previous)))
            .filter(|from| *from != to)
            .map(|from| HealthTransition { from, to });
        if let Some(HealthTransition { from, to }) = transition {
            info!("Health {} -> {}", from.as_str(), to.as_str());
        }

        self.previous = Some(self.current.clone());
        transition
    }

    pub fn failed_samples(&self) -> u64 {
        self.failed_samples
    }

    /// A reading failed: the tick is skipped and retried on the next one
    pub fn record_sample_failure(&mut self, error: anyhow::Error) -> BridgeError {
        self.failed_samples += 1;
        let error = match error.downcast::<BridgeError>() {
            Ok(error) => error,
            Err(other) => BridgeError::ResourceSampling(format!("{:#}", other)),
        };
        warn!("Skipping tick ({} failed sample(s)): {}", self.failed_samples, error);
        error
    }

    pub fn update_device_metrics(
        &self,
        record: &mut DeviceRecord,
        update: DeviceUpdate,
        now: Instant,
    ) -> Option<ReliabilityChange> {
        match update {
            DeviceUpdate::Error => {
                let window = Duration::from_secs(self.policy.reliability_error_window_secs);
                record.error_count += 1;
                record.recent_errors.push_back(now);
                while record
                    .recent_errors
                    .front()
                    .is_some_and(|t| now.saturating_duration_since(*t) > window)
                {
                    record.recent_errors.pop_front();
                }
                let penalty = self.policy.reliability_error_penalty * record.recent_errors.len() as f64;
                record.reliability = (record.reliability - penalty).max(0.0);
            }
            DeviceUpdate::Connected => {
                record.reliability = (record.reliability + self.policy.reliability_connect_bonus).min(100.0);
            }
            DeviceUpdate::Latency(ms) => record.push_latency(ms),
        }

        let threshold = self.policy.unreliable_threshold;
        if !record.unreliable && record.reliability < threshold {
            record.unreliable = true;
            warn!("{} is unreliable (reliability {:.0})", record.display_name(), record.reliability);
            return Some(ReliabilityChange::BecameUnreliable {
                reliability: record.reliability,
            });
        }
        if record.unreliable && record.reliability > threshold {
            record.unreliable = false;
            info!("{} recovered (reliability {:.0})", record.display_name(), record.reliability);
            return Some(ReliabilityChange::Recovered {
                reliability: record.reliability,
            });
        }
        None
    }

    /// Classify the current snapshot into severity-ranked issues, worst first
    pub fn detect_issues(&self) -> Vec<Issue> {
        let snapshot = &self.current;
        let policy = &self.policy;
        let mut issues = Vec::new();

        if snapshot.cpu_percent > policy.high_cpu_percent {
            issues.push(Issue {
                kind: IssueKind::HighCpu,
                severity: if snapshot.cpu_percent > CRITICAL_USAGE_PERCENT { Severity::Critical } else { Severity::High },
                detail: format!("CPU at {:.0}%", snapshot.cpu_percent),
            });
        }
        if snapshot.memory_percent > policy.high_memory_percent {
            issues.push(Issue {
                kind: IssueKind::HighMemory,
                severity: if snapshot.memory_percent > CRITICAL_USAGE_PERCENT { Severity::Critical } else { Severity::High },
                detail: format!("memory at {:.0}%", snapshot.memory_percent),
            });
        }
        if self.tick_dropouts >= policy.dropout_issue_threshold || snapshot.audio_quality < policy.low_audio_quality {
            issues.push(Issue {
                kind: IssueKind::AudioDropouts,
                severity: if snapshot.audio_quality < policy.low_audio_quality / 2.0 { Severity::High } else { Severity::Medium },
                detail: format!(
                    "{} dropout(s) last tick, audio quality {:.0}",
                    self.tick_dropouts, snapshot.audio_quality
                ),
            });
        }
        if self.tick_underruns >= policy.dropout_issue_threshold {
            issues.push(Issue {
                kind: IssueKind::BufferUnderruns,
                severity: Severity::Medium,
                detail: format!("{} underrun(s) last tick", self.tick_underruns),
            });
        }
        match snapshot.network_quality {
            NetworkQuality::Poor => issues.push(Issue {
                kind: IssueKind::PoorNetwork,
                severity: Severity::High,
                detail: "network quality is poor".to_string(),
            }),
            NetworkQuality::Fair => issues.push(Issue {
                kind: IssueKind::PoorNetwork,
                severity: Severity::Low,
                detail: "network quality is fair".to_string(),
            }),
            _ => {}
        }
        let unreliable = snapshot
            .devices
            .values()
            .filter(|d| d.reliability < policy.unreliable_threshold)
            .count();
        if unreliable > 0 {
            issues.push(Issue {
                kind: IssueKind::UnreliableDevices,
                severity: Severity::Medium,
                detail: format!("{} unreliable device(s)", unreliable),
            });
        }

        issues.sort_by(|a, b| b.severity.cmp(&a.severity));
        issues
    }

    pub fn calculate_overall_performance_score(&self) -> f64 {
        performance_score(&self.current)
    }

    pub fn health_status(&self) -> HealthStatus {
        HealthStatus::from_score(self.calculate_overall_performance_score())
    }

    /// Back to start values; network quality and device metrics are kept
    pub fn reset(&mut self) {
        let network_quality = self.current.network_quality;
        let devices = std::mem::take(&mut self.current.devices);
        *self = Self::new(self.policy.clone());
        self.current.network_quality = network_quality;
        self.current.devices = devices;
    }
}

/// Weighted score in [0, 100]; reliability counts as 100 with no devices known
pub fn performance_score(snapshot: &MetricSnapshot) -> f64 {
    let cpu_headroom = 100.0 - snapshot.cpu_percent.clamp(0.0, 100.0);
    let memory_headroom = 100.0 - snapshot.memory_percent.clamp(0.0, 100.0);
    let reliability = snapshot.mean_reliability().unwrap_or(100.0);

    let score = cpu_headroom * WEIGHT_CPU
        + memory_headroom * WEIGHT_MEMORY
        + snapshot.audio_quality * WEIGHT_AUDIO
        + snapshot.network_quality.score() * WEIGHT_NETWORK
        + reliability * WEIGHT_RELIABILITY;
    score.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tunebridge_core::{DiscoveredDevice, DiscoveryMethod};

    fn record() -> DeviceRecord {
        DeviceRecord::from_discovered(
            DiscoveredDevice::new("192.168.1.20", 1400, DiscoveryMethod::Ssdp),
            Instant::now(),
        )
    }

    fn reading(cpu: f64, memory_percent: f64) -> ResourceReading {
        ResourceReading {
            cpu_percent: cpu,
            memory_bytes: (memory_percent * 100.0) as u64,
            memory_total_bytes: 10_000,
        }
    }

    #[test]
    fn test_reference_score_is_healthy() {
        let mut snapshot = MetricSnapshot {
            cpu_percent: 20.0,
            memory_percent: 30.0,
            audio_quality: 95.0,
            network_quality: NetworkQuality::Excellent,
            ..Default::default()
        };
        snapshot.devices.insert(
            "192.168.1.20:1400".to_string(),
            DeviceMetrics {
                reliability: 90.0,
                mean_latency_ms: None,
                error_count: 0,
            },
        );

        let score = performance_score(&snapshot);
        assert!(score > 80.0 && score <= 100.0, "score {}", score);
        assert_eq!(HealthStatus::from_score(score), HealthStatus::Healthy);
    }

    #[test]
    fn test_dropouts_penalise_then_heal() {
        let mut monitor = PerformanceMonitor::new(TuningConfig::default());

        monitor.record_audio_quality(None, 3);
        assert_eq!(monitor.snapshot().audio_quality, 85.0);
        assert_eq!(monitor.snapshot().dropout_count, 3);

        // The tick that saw dropouts does not heal
        monitor.record_sample(reading(10.0, 10.0));
        assert_eq!(monitor.snapshot().audio_quality, 85.0);

        monitor.record_sample(reading(10.0, 10.0));
        assert_eq!(monitor.snapshot().audio_quality, 86.0);

        monitor.record_audio_quality(Some(40.0), 0);
        assert_eq!(monitor.snapshot().audio_quality, 40.0);

        monitor.record_audio_quality(None, 100);
        assert_eq!(monitor.snapshot().audio_quality, 0.0);
    }

    #[test]
    fn test_unreliable_notice_is_edge_triggered() {
        let monitor = PerformanceMonitor::new(TuningConfig::default());
        let mut device = record();
        let now = Instant::now();

        let mut notices = Vec::new();
        for _ in 0..8 {
            if let Some(change) = monitor.update_device_metrics(&mut device, DeviceUpdate::Error, now) {
                notices.push(change);
            }
        }
        assert_eq!(notices.len(), 1);
        assert!(matches!(notices[0], ReliabilityChange::BecameUnreliable { .. }));
        assert_eq!(device.reliability, 0.0);

        let mut recovered = None;
        for _ in 0..11 {
            if let Some(change) = monitor.update_device_metrics(&mut device, DeviceUpdate::Connected, now) {
                recovered = Some(change);
            }
        }
        assert!(matches!(recovered, Some(ReliabilityChange::Recovered { .. })));
        assert!(!device.unreliable);

        // Re-armed: the next breach is reported again
        let mut again = 0;
        for _ in 0..4 {
            if monitor.update_device_metrics(&mut device, DeviceUpdate::Error, now).is_some() {
                again += 1;
            }
        }
        assert_eq!(again, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_penalty_scales_with_recent_errors() {
        let monitor = PerformanceMonitor::new(TuningConfig::default());
        let mut device = record();

        monitor.update_device_metrics(&mut device, DeviceUpdate::Error, Instant::now());
        monitor.update_device_metrics(&mut device, DeviceUpdate::Error, Instant::now());
        assert_eq!(device.reliability, 85.0);

        tokio::time::advance(Duration::from_secs(120)).await;
        monitor.update_device_metrics(&mut device, DeviceUpdate::Error, Instant::now());
        assert_eq!(device.reliability, 80.0);
        assert_eq!(device.error_count, 3);
    }

    #[test]
    fn test_latency_updates_rolling_window() {
        let monitor = PerformanceMonitor::new(TuningConfig::default());
        let mut device = record();

        monitor.update_device_metrics(&mut device, DeviceUpdate::Latency(10.0), Instant::now());
        monitor.update_device_metrics(&mut device, DeviceUpdate::Latency(20.0), Instant::now());
        assert_eq!(device.mean_latency_ms(), Some(15.0));
        assert_eq!(device.reliability, 100.0);
    }

    #[test]
    fn test_detect_issues() {
        let mut monitor = PerformanceMonitor::new(TuningConfig::default());
        assert!(monitor.detect_issues().is_empty());

        monitor.record_audio_quality(None, 4);
        for _ in 0..3 {
            monitor.record_underrun();
        }
        monitor.set_network_quality(NetworkQuality::Poor);
        monitor.record_sample(reading(97.0, 50.0));

        let issues = monitor.detect_issues();
        let kinds: Vec<IssueKind> = issues.iter().map(|i| i.kind).collect();
        assert_eq!(issues[0].kind, IssueKind::HighCpu);
        assert_eq!(issues[0].severity, Severity::Critical);
        assert!(kinds.contains(&IssueKind::AudioDropouts));
        assert!(kinds.contains(&IssueKind::BufferUnderruns));
        assert!(kinds.contains(&IssueKind::PoorNetwork));
        assert!(!kinds.contains(&IssueKind::HighMemory));
    }

    #[test]
    fn test_reset_restores_start_values() {
        let mut monitor = PerformanceMonitor::new(TuningConfig::default());
        monitor.set_network_quality(NetworkQuality::Fair);
        monitor.record_audio_quality(None, 5);
        monitor.record_sample(reading(50.0, 50.0));

        monitor.reset();
        assert_eq!(monitor.snapshot().audio_quality, 100.0);
        assert_eq!(monitor.snapshot().dropout_count, 0);
        assert_eq!(monitor.snapshot().network_quality, NetworkQuality::Fair);
        // Nothing to compare against until a tick has closed
        assert_eq!(monitor.record_sample(reading(100.0, 100.0)), None);
    }

    #[test]
    fn test_health_transition_between_ticks() {
        let mut monitor = PerformanceMonitor::new(TuningConfig::default());
        assert_eq!(monitor.record_sample(reading(10.0, 10.0)), None);
        assert_eq!(monitor.record_sample(reading(12.0, 10.0)), None);

        monitor.record_audio_quality(Some(0.0), 0);
        let decline = monitor.record_sample(reading(99.0, 99.0)).unwrap();
        assert_eq!(decline.from, HealthStatus::Healthy);
        assert_eq!(decline.to, HealthStatus::Critical);
        assert!(decline.is_decline());

        assert_eq!(monitor.record_sample(reading(99.0, 99.0)), None);
    }

    #[test]
    fn test_sample_failures_are_counted_and_typed() {
        let mut monitor = PerformanceMonitor::new(TuningConfig::default());

        let typed = monitor.record_sample_failure(BridgeError::ResourceSampling("stat unreadable".to_string()).into());
        assert_eq!(typed.to_string(), "Resource sampling error: stat unreadable");

        let foreign = monitor.record_sample_failure(anyhow::anyhow!("sensor offline"));
        assert_eq!(foreign.category(), "resource_sampling");
        assert!(foreign.to_string().contains("sensor offline"));
        assert_eq!(monitor.failed_samples(), 2);
    }

    proptest! {
        #[test]
        fn prop_errors_never_raise_reliability(errors in 1usize..60, gaps in proptest::collection::vec(0u64..120, 60)) {
            let monitor = PerformanceMonitor::new(TuningConfig::default());
            let mut device = record();
            let mut now = Instant::now();
            let mut last = device.reliability;

            for gap in gaps.into_iter().take(errors) {
                now += Duration::from_secs(gap);
                monitor.update_device_metrics(&mut device, DeviceUpdate::Error, now);
                prop_assert!(device.reliability <= last);
                prop_assert!(device.reliability >= 0.0);
                last = device.reliability;
            }
        }

        #[test]
        fn prop_score_is_bounded(
            cpu in -50.0f64..200.0,
            memory in -50.0f64..200.0,
            audio in 0.0f64..=100.0,
            reliability in 0.0f64..=100.0,
        ) {
            let mut snapshot = MetricSnapshot {
                cpu_percent: cpu,
                memory_percent: memory,
                audio_quality: audio,
                ..Default::default()
            };
            snapshot.devices.insert("d".to_string(), DeviceMetrics { reliability, mean_latency_ms: None, error_count: 0 });
            let score = performance_score(&snapshot);
            prop_assert!((0.0..=100.0).contains(&score));
        }
    }
}
