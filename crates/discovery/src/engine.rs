//! Discovery engine
//!
//! Runs the requested discovery methods side by side. Each method is a separate
//! task bounded by the shared timeout; a failing, panicking or slow method yields
//! an empty result for itself and never affects its siblings.

use crate::registry::dedupe_by_priority;
use crate::{mdns, scan, ssdp};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};
use tunebridge_core::{BridgeError, DiscoveredDevice, DiscoveryConfig, DiscoveryMethod, SpeakerClient};

/// Result of a single method within one discovery round
#[derive(Debug, Clone, Serialize)]
pub struct MethodOutcome {
    pub method: DiscoveryMethod,
    pub devices: usize,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// Merged output of one discovery round
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    pub devices: Vec<DiscoveredDevice>,
    pub outcomes: Vec<MethodOutcome>,
}

impl DiscoveryReport {
    pub fn failed_methods(&self) -> Vec<DiscoveryMethod> {
        self.outcomes
            .iter()
            .filter(|o| o.error.is_some())
            .map(|o| o.method)
            .collect()
    }
}

#[derive(Clone)]
pub struct DiscoveryEngine {
    client: Arc<dyn SpeakerClient>,
    config: DiscoveryConfig,
}

impl DiscoveryEngine {
    pub fn new(client: Arc<dyn SpeakerClient>, config: DiscoveryConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> Arc<dyn SpeakerClient> {
        self.client.clone()
    }

    /// Run the configured methods
    pub async fn discover_configured(&self, timeout: Duration) -> DiscoveryReport {
        let methods = self.config.methods.clone();
        self.discover(&methods, timeout).await
    }

    /// Run `methods` concurrently and merge their results by (host, port)
    pub async fn discover(&self, methods: &[DiscoveryMethod], timeout: Duration) -> DiscoveryReport {
        let mut requested: Vec<DiscoveryMethod> = Vec::new();
        for method in methods {
            if *method == DiscoveryMethod::Manual {
                warn!("Manual devices come from configuration, not discovery; skipping");
                continue;
            }
            if !requested.contains(method) {
                requested.push(*method);
            }
        }

        info!("Discovery round: {:?} ({:?} timeout)", requested, timeout);
        let started = Instant::now();
        let mut tasks = JoinSet::new();
        let mut task_methods = HashMap::new();

        for method in requested {
            let engine = self.clone();
            let handle = tasks.spawn(async move {
                let result = match tokio::time::timeout(timeout, engine.run_method(method, timeout)).await {
                    Ok(result) => result,
                    Err(_) => Err(BridgeError::discovery(method.as_str(), "timed out")),
                };
                (method, result)
            });
            task_methods.insert(handle.id(), method);
        }

        let mut all_devices = Vec::new();
        let mut outcomes = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match joined {
                Ok((method, Ok(devices))) => {
                    info!("{} discovery returned {} device(s)", method, devices.len());
                    outcomes.push(MethodOutcome {
                        method,
                        devices: devices.len(),
                        error: None,
                        elapsed_ms,
                    });
                    all_devices.extend(devices.into_iter().map(|mut d| {
                        d.method = method;
                        d
                    }));
                }
                Ok((method, Err(e))) => {
                    warn!("{}", e);
                    let error = match e {
                        BridgeError::Discovery { message, .. } => message,
                        other => other.to_string(),
                    };
                    outcomes.push(MethodOutcome {
                        method,
                        devices: 0,
                        error: Some(error),
                        elapsed_ms,
                    });
                }
                Err(join_error) => {
                    let Some(method) = task_methods.get(&join_error.id()).copied() else {
                        warn!("Discovery task failed: {}", join_error);
                        continue;
                    };
                    warn!("{} discovery task failed: {}", method, join_error);
                    outcomes.push(MethodOutcome {
                        method,
                        devices: 0,
                        error: Some(join_error.to_string()),
                        elapsed_ms,
                    });
                }
            }
        }

        outcomes.sort_by_key(|o| std::cmp::Reverse(o.method.priority()));
        DiscoveryReport {
            devices: dedupe_by_priority(all_devices),
            outcomes,
        }
    }

    async fn run_method(&self, method: DiscoveryMethod, timeout: Duration) -> Result<Vec<DiscoveredDevice>, BridgeError> {
        // Listening methods stop early enough to resolve what they heard
        let listen = timeout.mul_f64(0.6);
        let result = match method {
            DiscoveryMethod::Standard => self.client.discover(listen).await,
            DiscoveryMethod::Ssdp => ssdp::discover(&self.config.ssdp_search_targets, listen, DiscoveryMethod::Ssdp).await,
            DiscoveryMethod::Mdns => mdns::discover_devices(&self.config.mdns_service_types, listen).await,
            DiscoveryMethod::Scan => {
                scan::scan_subnet(self.client.clone(), &self.config.scan_ports, self.config.scan_concurrency).await
            }
            DiscoveryMethod::Manual => Ok(Vec::new()),
        };
        result.map_err(|e| BridgeError::discovery(method.as_str(), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use tunebridge_core::DeviceDescription;

    enum Behaviour {
        Devices(Vec<DiscoveredDevice>),
        Fail,
        Hang,
    }

    struct MockClient {
        behaviour: Behaviour,
    }

    #[async_trait]
    impl SpeakerClient for MockClient {
        fn name(&self) -> &str {
            "mock"
        }

        async fn discover(&self, _timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
            match &self.behaviour {
                Behaviour::Devices(devices) => Ok(devices.clone()),
                Behaviour::Fail => Err(anyhow!("announce listener unavailable")),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Vec::new())
                }
            }
        }

        async fn probe(&self, _host: &str, _port: u16) -> Result<DeviceDescription> {
            Err(anyhow!("no probe"))
        }
    }

    fn engine(behaviour: Behaviour) -> DiscoveryEngine {
        DiscoveryEngine::new(Arc::new(MockClient { behaviour }), DiscoveryConfig::default())
    }

    #[tokio::test]
    async fn test_standard_results_are_tagged() {
        let engine = engine(Behaviour::Devices(vec![
            DiscoveredDevice::new("192.168.1.100", 1400, DiscoveryMethod::Scan).with_name("Kitchen"),
        ]));

        let report = engine.discover(&[DiscoveryMethod::Standard], Duration::from_secs(1)).await;
        assert_eq!(report.devices.len(), 1);
        assert_eq!(report.devices[0].method, DiscoveryMethod::Standard);
        assert!(report.failed_methods().is_empty());
    }

    #[tokio::test]
    async fn test_failing_method_is_isolated() {
        let engine = engine(Behaviour::Fail);

        let report = engine
            .discover(&[DiscoveryMethod::Standard, DiscoveryMethod::Standard], Duration::from_secs(1))
            .await;
        assert!(report.devices.is_empty());
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.failed_methods(), vec![DiscoveryMethod::Standard]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_method_times_out() {
        let engine = engine(Behaviour::Hang);

        let report = engine.discover(&[DiscoveryMethod::Standard], Duration::from_secs(2)).await;
        assert!(report.devices.is_empty());
        let error = report.outcomes[0].error.clone().unwrap();
        assert!(error.contains("timed out"), "{}", error);
    }

    #[tokio::test]
    async fn test_failing_sibling_keeps_other_results() {
        let config = DiscoveryConfig {
            mdns_service_types: vec!["not a service type".to_string()],
            ..DiscoveryConfig::default()
        };
        let client = MockClient {
            behaviour: Behaviour::Devices(vec![
                DiscoveredDevice::new("192.168.1.100", 1400, DiscoveryMethod::Scan).with_name("Kitchen"),
                DiscoveredDevice::new("192.168.1.101", 1400, DiscoveryMethod::Scan).with_name("Office"),
            ]),
        };
        let engine = DiscoveryEngine::new(Arc::new(client), config);

        let report = engine
            .discover(&[DiscoveryMethod::Standard, DiscoveryMethod::Mdns], Duration::from_secs(1))
            .await;

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.failed_methods(), vec![DiscoveryMethod::Mdns]);
        let standard = report
            .outcomes
            .iter()
            .find(|o| o.method == DiscoveryMethod::Standard)
            .unwrap();
        assert_eq!(standard.devices, 2);
        assert!(standard.error.is_none());
        assert_eq!(report.devices.len(), 2);
        assert!(report.devices.iter().all(|d| d.method == DiscoveryMethod::Standard));
    }

    #[tokio::test]
    async fn test_manual_method_is_skipped() {
        let engine = engine(Behaviour::Devices(Vec::new()));
        let report = engine.discover(&[DiscoveryMethod::Manual], Duration::from_secs(1)).await;
        assert!(report.outcomes.is_empty());
    }
}
