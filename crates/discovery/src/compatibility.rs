//! Speaker compatibility tests
//!
//! Each target gets a connectivity test, a service inspection, an audio format check
//! and one functional check per capability. Every sub-test runs on its own and
//! records a failure as an issue; nothing aborts the report.

use crate::net::{resolve, tcp_connect_time};
use crate::ssdp::capabilities_from;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tunebridge_core::{
    AudioFormat, BridgeError, Capabilities, Capability, DeviceDescription, DeviceId, SpeakerClient,
};

/// Outcome of one sub-test
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubTest {
    pub name: String,
    pub passed: bool,
    pub detail: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompatibilityReport {
    pub target: DeviceId,
    /// Target matches a device from the configuration file
    pub manually_configured: bool,
    /// Tests were not run (manual device, no verification requested)
    pub skipped: bool,
    pub tests: Vec<SubTest>,
    pub description: Option<DeviceDescription>,
    pub capabilities: Capabilities,
    pub latency_ms: Option<f64>,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub compatible: bool,
}

impl CompatibilityReport {
    fn annotated(target: DeviceId) -> Self {
        Self {
            target,
            manually_configured: true,
            skipped: true,
            tests: Vec::new(),
            description: None,
            capabilities: Capabilities::default(),
            latency_ms: None,
            issues: Vec::new(),
            recommendations: vec!["Manually configured; pass verify to re-test".to_string()],
            compatible: true,
        }
    }

    /// The test task died before producing a report
    fn aborted(target: DeviceId, manually_configured: bool, reason: String) -> Self {
        let issue = BridgeError::device(target.to_string(), format!("compatibility test aborted: {}", reason));
        Self {
            target,
            manually_configured,
            skipped: false,
            tests: Vec::new(),
            description: None,
            capabilities: Capabilities::default(),
            latency_ms: None,
            issues: vec![issue.to_string()],
            recommendations: vec!["Re-run the compatibility test".to_string()],
            compatible: false,
        }
    }

    pub fn passed(&self, name: &str) -> Option<bool> {
        self.tests.iter().find(|t| t.name == name).map(|t| t.passed)
    }
}

pub struct CompatibilityTester {
    client: Arc<dyn SpeakerClient>,
    timeout: Duration,
    manual: Vec<DeviceId>,
}

impl CompatibilityTester {
    pub fn new(client: Arc<dyn SpeakerClient>, timeout: Duration, manual: Vec<DeviceId>) -> Self {
        Self {
            client,
            timeout,
            manual,
        }
    }

    /// Test every target concurrently; reports come back in target order
    pub async fn test_device_compatibility(&self, targets: &[DeviceId], verify: bool) -> Vec<CompatibilityReport> {
        let mut tasks = JoinSet::new();
        let mut task_targets = HashMap::new();

        for (index, target) in targets.iter().cloned().enumerate() {
            let manual = self.manual.contains(&target);
            if manual && !verify {
                debug!("{} is manually configured, annotating without probing", target);
                tasks.spawn(async move { (index, CompatibilityReport::annotated(target)) });
                continue;
            }
            let client = self.client.clone();
            let timeout = self.timeout;
            let handle = tasks.spawn({
                let target = target.clone();
                async move {
                    let mut report = test_target(client, target, timeout).await;
                    report.manually_configured = manual;
                    (index, report)
                }
            });
            task_targets.insert(handle.id(), (index, target, manual));
        }

        let mut reports: Vec<(usize, CompatibilityReport)> = Vec::with_capacity(targets.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => reports.push(entry),
                Err(join_error) => {
                    let Some((index, target, manual)) = task_targets.remove(&join_error.id()) else {
                        warn!("Compatibility task failed: {}", join_error);
                        continue;
                    };
                    warn!("Compatibility test of {} failed: {}", target, join_error);
                    reports.push((index, CompatibilityReport::aborted(target, manual, join_error.to_string())));
                }
            }
        }
        reports.sort_by_key(|(index, _)| *index);
        reports.into_iter().map(|(_, report)| report).collect()
    }
}

async fn timed<T, F>(name: &str, limit: Duration, future: F) -> (SubTest, Option<T>)
where
    F: Future<Output = anyhow::Result<T>>,
{
    let start = Instant::now();
    let outcome = tokio::time::timeout(limit, future).await;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let (passed, detail, value) = match outcome {
        Ok(Ok(value)) => (true, None, Some(value)),
        Ok(Err(e)) => (false, Some(e.to_string()), None),
        Err(_) => (false, Some(format!("timed out after {:?}", limit)), None),
    };
    (
        SubTest {
            name: name.to_string(),
            passed,
            detail,
            elapsed_ms,
        },
        value,
    )
}

async fn test_target(client: Arc<dyn SpeakerClient>, target: DeviceId, limit: Duration) -> CompatibilityReport {
    info!("Testing compatibility of {}", target);
    let host = target.host.clone();
    let port = target.port;

    let connectivity = timed("connectivity", limit, async {
        let addr = resolve(&host, port).await?;
        Ok(tcp_connect_time(addr, limit).await?)
    });
    let service = timed("service_inspection", limit, client.probe(&host, port));
    let volume = timed("volume", limit, client.check_capability(&host, port, Capability::Volume));
    let playback = timed("playback", limit, client.check_capability(&host, port, Capability::Playback));
    let grouping = timed("grouping", limit, client.check_capability(&host, port, Capability::Grouping));
    let metadata = timed("metadata", limit, client.check_capability(&host, port, Capability::Metadata));

    let ((connect_test, connect_time), (service_test, description), functional_a, functional_b) = tokio::join!(
        connectivity,
        service,
        async { tokio::join!(volume, playback) },
        async { tokio::join!(grouping, metadata) },
    );
    let functional = [functional_a.0, functional_a.1, functional_b.0, functional_b.1];

    let mut issues = Vec::new();
    let mut recommendations = Vec::new();
    let mut tests = vec![connect_test.clone(), service_test.clone()];

    if !connect_test.passed {
        let detail = connect_test.detail.clone().unwrap_or_default();
        issues.push(BridgeError::device(target.to_string(), format!("connectivity failed: {}", detail)).to_string());
        recommendations.push(format!("Check that {} is powered on and reachable on port {}", host, port));
    }
    if !service_test.passed {
        let detail = service_test.detail.clone().unwrap_or_default();
        issues.push(BridgeError::device(target.to_string(), format!("service inspection failed: {}", detail)).to_string());
    }

    let formats: Vec<AudioFormat> = description.as_ref().map(|d| d.formats.clone()).unwrap_or_default();
    let format_test = SubTest {
        name: "audio_formats".to_string(),
        passed: !formats.is_empty(),
        detail: if formats.is_empty() {
            Some("no supported audio format".to_string())
        } else {
            None
        },
        elapsed_ms: 0,
    };
    if !format_test.passed {
        issues.push("No supported audio format (mp3, aac, flac, wav)".to_string());
        recommendations.push("Use a speaker that can play MP3 or WAV streams".to_string());
    }
    tests.push(format_test.clone());

    let mut capabilities = description.as_ref().map(capabilities_from).unwrap_or_default();
    for (capability, (test, supported)) in Capability::ALL.iter().zip(functional) {
        let works = test.passed && supported == Some(true);
        match capability {
            Capability::Volume => capabilities.volume = works,
            Capability::Playback => capabilities.playback = works,
            Capability::Grouping => capabilities.grouping = works,
            Capability::Metadata => capabilities.metadata = works,
        }
        if !works {
            let reason = test.detail.clone().unwrap_or_else(|| "not supported".to_string());
            issues.push(format!("{} check failed: {}", capability.as_str(), reason));
        }
        tests.push(SubTest { passed: works, ..test });
    }
    if !capabilities.playback {
        recommendations.push("Playback control unavailable; streaming may need manual start".to_string());
    }

    let compatible = connect_test.passed && service_test.passed && format_test.passed;
    CompatibilityReport {
        target,
        manually_configured: false,
        skipped: false,
        tests,
        description,
        capabilities,
        latency_ms: connect_time.map(|d| d.as_secs_f64() * 1000.0),
        issues,
        recommendations,
        compatible,
    }
}
