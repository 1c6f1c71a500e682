//! Network diagnostics
//!
//! Every sub-check runs in its own task under its own timeout. A failing, panicking
//! or slow check shows up as a status in the report and never cancels the others.

use crate::net::{default_gateway_guess, host_answers, local_ipv4, resolve, tcp_connect_time};
use crate::ssdp::create_ssdp_socket;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tunebridge_core::{NetworkConfig, NetworkQuality};

/// Ports tried on the gateway when checking the local network
const GATEWAY_PORTS: [u16; 3] = [80, 443, 53];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub detail: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl CheckResult {
    pub fn skipped(reason: &str) -> Self {
        Self {
            status: CheckStatus::Skipped,
            detail: Some(reason.to_string()),
            error: None,
            duration_ms: 0,
        }
    }

    pub fn is_pass(&self) -> bool {
        self.status == CheckStatus::Pass
    }
}

/// Latency, jitter and loss measured over a series of connects
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyMeasurement {
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub loss_percent: f64,
    pub bandwidth_mbps: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub timestamp: DateTime<Utc>,
    pub internet: CheckResult,
    pub local_network: CheckResult,
    pub multicast: CheckResult,
    pub ports: CheckResult,
    pub dns: CheckResult,
    pub latency: CheckResult,
    pub bandwidth: CheckResult,
    pub measurement: Option<LatencyMeasurement>,
    pub quality: NetworkQuality,
    pub recommendations: Vec<String>,
}

/// A check that completed: whether it passed and what it saw
struct Finding {
    passed: bool,
    detail: String,
}

impl Finding {
    fn new(passed: bool, detail: impl Into<String>) -> Self {
        Self {
            passed,
            detail: detail.into(),
        }
    }
}

pub struct NetworkDiagnostics {
    config: NetworkConfig,
    ports: Vec<u16>,
    timeout: Duration,
}

impl NetworkDiagnostics {
    pub fn new(config: NetworkConfig, ports: Vec<u16>, timeout: Duration) -> Self {
        Self { config, ports, timeout }
    }

    pub async fn run_diagnostics(&self) -> DiagnosticsReport {
        info!("Running network diagnostics");
        let limit = self.timeout;
        let probe_addrs = self.config.internet_probe_addrs.clone();
        let latency_target = probe_addrs.first().cloned();
        let samples = self.config.latency_probe_count.max(1);

        let internet = async {
            if probe_addrs.is_empty() {
                return CheckResult::skipped("no probe addresses configured");
            }
            let addrs = probe_addrs.clone();
            finding_check(limit, check_internet(addrs, limit)).await
        };
        let local_network = async { finding_check(limit, check_local_network(limit)).await };
        let multicast = async { finding_check(limit, async { check_multicast() }).await };
        let ports = async {
            if self.ports.is_empty() {
                return CheckResult::skipped("no service ports configured");
            }
            finding_check(limit, check_ports(self.ports.clone())).await
        };
        let dns = async {
            let host = self.config.dns_probe_host.clone();
            finding_check(limit, check_dns(host)).await
        };
        let latency = async {
            let Some(target) = latency_target.clone() else {
                return (CheckResult::skipped("no latency target configured"), None);
            };
            // Leave headroom so the sampling loop finishes inside the check's own limit
            let per_sample = limit.mul_f64(0.9) / samples;
            let (result, value) = guarded(limit, measure_latency(target, samples, per_sample)).await;
            match value {
                Some(measurement) => {
                    let detail = format!(
                        "{:.1}ms latency, {:.1}ms jitter, {:.0}% loss",
                        measurement.latency_ms, measurement.jitter_ms, measurement.loss_percent
                    );
                    (status_result(result, CheckStatus::Pass, Some(detail)), Some(measurement))
                }
                None => (status_result(result, CheckStatus::Error, None), None),
            }
        };
        let bandwidth = async {
            let Some(url) = self.config.bandwidth_url.clone() else {
                return (CheckResult::skipped("no bandwidth URL configured"), None);
            };
            let (result, value) = guarded(limit, measure_bandwidth(url, limit)).await;
            match value {
                Some(mbps) => (status_result(result, CheckStatus::Pass, Some(format!("{:.1} Mbit/s", mbps))), Some(mbps)),
                None => (status_result(result, CheckStatus::Error, None), None),
            }
        };

        let (internet, local_network, multicast, ports, dns, (latency, measurement), (bandwidth, mbps)) =
            tokio::join!(internet, local_network, multicast, ports, dns, latency, bandwidth);

        let measurement = measurement.map(|m| LatencyMeasurement {
            bandwidth_mbps: mbps,
            ..m
        });
        let quality = match &measurement {
            Some(m) => NetworkQuality::classify(m.latency_ms, m.jitter_ms, m.loss_percent, &self.config.quality),
            None if local_network.is_pass() => NetworkQuality::Fair,
            None => NetworkQuality::Poor,
        };

        let mut report = DiagnosticsReport {
            timestamp: Utc::now(),
            internet,
            local_network,
            multicast,
            ports,
            dns,
            latency,
            bandwidth,
            measurement,
            quality,
            recommendations: Vec::new(),
        };
        report.recommendations = recommendations(&report);
        info!("Network diagnostics complete, quality {}", report.quality.as_str());
        report
    }
}

/// Run `future` in its own task under `limit`; errors, timeouts and panics become strings
async fn guarded<T, F>(limit: Duration, future: F) -> (CheckResult, Option<T>)
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let start = Instant::now();
    let outcome = tokio::spawn(tokio::time::timeout(limit, future)).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    let (value, error) = match outcome {
        Ok(Ok(Ok(value))) => (Some(value), None),
        Ok(Ok(Err(e))) => (None, Some(e.to_string())),
        Ok(Err(_)) => (None, Some(format!("timed out after {:?}", limit))),
        Err(join_error) => (None, Some(format!("check task failed: {}", join_error))),
    };
    if let Some(error) = &error {
        debug!("Diagnostic check failed: {}", error);
    }

    let result = CheckResult {
        status: if error.is_some() { CheckStatus::Error } else { CheckStatus::Pass },
        detail: None,
        error,
        duration_ms,
    };
    (result, value)
}

fn status_result(mut result: CheckResult, status: CheckStatus, detail: Option<String>) -> CheckResult {
    if result.error.is_none() {
        result.status = status;
        result.detail = detail;
    }
    result
}

async fn finding_check<F>(limit: Duration, future: F) -> CheckResult
where
    F: Future<Output = Result<Finding>> + Send + 'static,
{
    let (result, finding) = guarded(limit, future).await;
    match finding {
        Some(finding) => {
            let status = if finding.passed { CheckStatus::Pass } else { CheckStatus::Fail };
            status_result(result, status, Some(finding.detail))
        }
        None => result,
    }
}

async fn check_internet(addrs: Vec<String>, limit: Duration) -> Result<Finding> {
    let mut reached = Vec::new();
    let mut failed = Vec::new();

    for addr in &addrs {
        let Ok(socket) = addr.parse::<SocketAddr>() else {
            failed.push(format!("{} (invalid address)", addr));
            continue;
        };
        match tcp_connect_time(socket, limit / 2).await {
            Ok(_) => reached.push(addr.clone()),
            Err(e) => failed.push(format!("{} ({})", addr, e)),
        }
    }

    if reached.is_empty() {
        Ok(Finding::new(false, format!("unreachable: {}", failed.join(", "))))
    } else {
        Ok(Finding::new(true, format!("reached {}", reached.join(", "))))
    }
}

async fn check_local_network(limit: Duration) -> Result<Finding> {
    let local = local_ipv4()?;
    let gateway = default_gateway_guess(local);

    for port in GATEWAY_PORTS {
        if host_answers(SocketAddr::from((gateway, port)), limit / 4).await.is_ok() {
            return Ok(Finding::new(true, format!("{} on {}, gateway {} answers", local, subnet_of(local), gateway)));
        }
    }
    Ok(Finding::new(false, format!("{} on {}, gateway {} did not answer", local, subnet_of(local), gateway)))
}

fn subnet_of(ip: Ipv4Addr) -> String {
    let [a, b, c, _] = ip.octets();
    format!("{}.{}.{}.0/24", a, b, c)
}

fn check_multicast() -> Result<Finding> {
    let socket = create_ssdp_socket()?;
    drop(socket);
    Ok(Finding::new(true, "joined SSDP multicast group"))
}

async fn check_ports(ports: Vec<u16>) -> Result<Finding> {
    let mut blocked = Vec::new();
    for port in &ports {
        match TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, *port))).await {
            Ok(listener) => drop(listener),
            Err(e) => blocked.push(format!("{} ({})", port, e)),
        }
    }

    if blocked.is_empty() {
        Ok(Finding::new(true, format!("ports {:?} available", ports)))
    } else {
        Ok(Finding::new(false, format!("unavailable: {}", blocked.join(", "))))
    }
}

async fn check_dns(host: String) -> Result<Finding> {
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 443)).await?.collect();
    if resolved.is_empty() {
        Ok(Finding::new(false, format!("{} resolved to nothing", host)))
    } else {
        Ok(Finding::new(true, format!("{} resolved to {}", host, resolved[0].ip())))
    }
}

async fn measure_latency(target: String, samples: u32, per_sample: Duration) -> Result<LatencyMeasurement> {
    let (host, port) = target
        .rsplit_once(':')
        .and_then(|(host, port)| port.parse::<u16>().ok().map(|port| (host.to_string(), port)))
        .ok_or_else(|| anyhow!("invalid latency target {}", target))?;
    let addr = resolve(&host, port).await?;

    let mut readings = Vec::with_capacity(samples as usize);
    for _ in 0..samples {
        let reading = tcp_connect_time(addr, per_sample)
            .await
            .ok()
            .map(|d| d.as_secs_f64() * 1000.0);
        readings.push(reading);
    }

    latency_stats(&readings).ok_or_else(|| anyhow!("no connect to {} succeeded", target))
}

/// Summarise connect samples; `None` entries are lost probes
pub fn latency_stats(readings: &[Option<f64>]) -> Option<LatencyMeasurement> {
    let ok: Vec<f64> = readings.iter().flatten().copied().collect();
    if ok.is_empty() {
        return None;
    }

    let latency_ms = ok.iter().sum::<f64>() / ok.len() as f64;
    let jitter_ms = if ok.len() < 2 {
        0.0
    } else {
        ok.windows(2).map(|w| (w[1] - w[0]).abs()).sum::<f64>() / (ok.len() - 1) as f64
    };
    let lost = readings.len() - ok.len();
    let loss_percent = lost as f64 / readings.len() as f64 * 100.0;

    Some(LatencyMeasurement {
        latency_ms,
        jitter_ms,
        loss_percent,
        bandwidth_mbps: None,
    })
}

async fn measure_bandwidth(url: String, limit: Duration) -> Result<f64> {
    let client = reqwest::Client::builder().timeout(limit).build()?;
    let start = Instant::now();
    let bytes = client.get(&url).send().await?.error_for_status()?.bytes().await?;
    let secs = start.elapsed().as_secs_f64().max(0.001);
    Ok(bytes.len() as f64 * 8.0 / secs / 1_000_000.0)
}

fn recommendations(report: &DiagnosticsReport) -> Vec<String> {
    let mut out = Vec::new();
    let failing = |check: &CheckResult| matches!(check.status, CheckStatus::Fail | CheckStatus::Error);

    if failing(&report.internet) {
        out.push("Internet is unreachable; streaming services will not work".to_string());
    }
    if failing(&report.local_network) {
        out.push("Check the local network connection and that the bridge is on the speakers' subnet".to_string());
    }
    if failing(&report.multicast) {
        out.push("Multicast is blocked; enable IGMP snooping support or add speakers manually".to_string());
    }
    if failing(&report.ports) {
        out.push("Free the configured service ports or choose different ones".to_string());
    }
    if failing(&report.dns) {
        out.push("DNS resolution failed; check the configured name servers".to_string());
    }
    if failing(&report.latency) {
        out.push("Latency probe failed; network quality could not be measured".to_string());
    }
    match report.quality {
        NetworkQuality::Poor => out.push("Network quality is poor; use a wired connection or move closer to the access point".to_string()),
        NetworkQuality::Fair => out.push("Network quality is fair; larger audio buffers will reduce dropouts".to_string()),
        _ => {}
    }
    if out.len() > 2 {
        warn!("Network diagnostics found {} problem(s)", out.len());
    }
    out
}
