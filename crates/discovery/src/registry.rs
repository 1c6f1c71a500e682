//! Device registry
//!
//! Holds every validated speaker endpoint keyed by (host, port), together with its
//! live reliability metrics. The registry is owned by the control task; nothing else
//! mutates it.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use tunebridge_core::{
    Capabilities, DeviceId, DeviceMetrics, DeviceRecord, DiscoveredDevice, DiscoveryMethod,
    ManualDevice,
};

/// Counts from one merge pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub added: usize,
    pub updated: usize,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, DeviceRecord>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, id: &DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(id)
    }

    pub fn get_mut(&mut self, id: &DeviceId) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(id)
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    /// Records sorted by id, for stable output
    pub fn records(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = self.devices.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// All endpoints on a host, whatever the port
    pub fn ids_for_host(&self, host: &str) -> Vec<DeviceId> {
        self.devices
            .keys()
            .filter(|id| id.host == host)
            .cloned()
            .collect()
    }

    pub fn is_manual(&self, id: &DeviceId) -> bool {
        self.devices.get(id).map(|d| d.manual).unwrap_or(false)
    }

    /// Register hand-configured speakers; they are never evicted
    pub fn add_manual(&mut self, devices: &[ManualDevice], now: Instant) -> MergeSummary {
        let discovered = devices
            .iter()
            .map(|d| DiscoveredDevice {
                id: DeviceId::new(d.host.trim(), d.port),
                name: d.name.clone(),
                model: None,
                method: DiscoveryMethod::Manual,
                capabilities: Capabilities::default(),
            })
            .collect();
        self.merge(discovered, now)
    }

    /// Merge discovery results into the registry
    ///
    /// Existing entries keep their reliability history. Metadata is overwritten only
    /// by a method of equal or higher priority.
    pub fn merge(&mut self, devices: Vec<DiscoveredDevice>, now: Instant) -> MergeSummary {
        let mut summary = MergeSummary::default();

        for device in devices {
            match self.devices.get_mut(&device.id) {
                Some(existing) => {
                    existing.touch(now);
                    if device.method.priority() >= existing.method.priority() {
                        if device.name.is_some() {
                            existing.name = device.name;
                        }
                        if device.model.is_some() {
                            existing.model = device.model;
                        }
                        if device.capabilities != Capabilities::default() {
                            existing.capabilities = device.capabilities;
                        }
                        existing.method = device.method;
                    }
                    existing.manual |= device.method == DiscoveryMethod::Manual;
                    summary.updated += 1;
                }
                None => {
                    debug!("Registry add: {} via {}", device.id, device.method);
                    let id = device.id.clone();
                    self.devices.insert(id, DeviceRecord::from_discovered(device, now));
                    summary.added += 1;
                }
            }
        }

        if summary.added > 0 {
            info!(
                "Registry merge: {} added, {} updated, {} total",
                summary.added,
                summary.updated,
                self.devices.len()
            );
        }
        summary
    }

    /// Drop discovered devices silent for longer than `window`
    pub fn evict_stale(&mut self, now: Instant, window: Duration) -> Vec<DeviceId> {
        let stale: Vec<DeviceId> = self
            .devices
            .values()
            .filter(|d| !d.manual && now.saturating_duration_since(d.last_seen_at) > window)
            .map(|d| d.id.clone())
            .collect();

        for id in &stale {
            self.devices.remove(id);
            info!("Evicted silent device {}", id);
        }
        stale
    }

    /// Per-device metrics keyed by `host:port`
    pub fn metrics(&self) -> HashMap<String, DeviceMetrics> {
        self.devices
            .values()
            .map(|d| {
                (
                    d.id.to_string(),
                    DeviceMetrics {
                        reliability: d.reliability,
                        mean_latency_ms: d.mean_latency_ms(),
                        error_count: d.error_count,
                    },
                )
            })
            .collect()
    }
}

/// Deduplicate one discovery round by (host, port)
///
/// When several methods report the same endpoint the highest-priority report is
/// kept, with missing metadata filled from the others.
pub fn dedupe_by_priority(devices: Vec<DiscoveredDevice>) -> Vec<DiscoveredDevice> {
    let mut merged: HashMap<DeviceId, DiscoveredDevice> = HashMap::new();

    for device in devices {
        match merged.remove(&device.id) {
            Some(current) => {
                let (mut winner, loser) = if device.method.priority() > current.method.priority() {
                    (device, current)
                } else {
                    (current, device)
                };
                if winner.name.is_none() {
                    winner.name = loser.name;
                }
                if winner.model.is_none() {
                    winner.model = loser.model;
                }
                if winner.capabilities == Capabilities::default() {
                    winner.capabilities = loser.capabilities;
                }
                merged.insert(winner.id.clone(), winner);
            }
            None => {
                merged.insert(device.id.clone(), device);
            }
        }
    }

    let mut result: Vec<DiscoveredDevice> = merged.into_values().collect();
    result.sort_by(|a, b| a.id.cmp(&b.id));
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_distinct_hosts_keeps_method_tags() {
        let now = Instant::now();
        let mut registry = DeviceRegistry::new();

        let standard = vec![DiscoveredDevice::new("192.168.1.100", 1400, DiscoveryMethod::Standard)];
        let ssdp = vec![DiscoveredDevice::new("192.168.1.101", 1400, DiscoveryMethod::Ssdp)];

        registry.merge(dedupe_by_priority([standard, ssdp].concat()), now);

        assert_eq!(registry.len(), 2);
        let a = registry.get(&DeviceId::new("192.168.1.100", 1400)).unwrap();
        let b = registry.get(&DeviceId::new("192.168.1.101", 1400)).unwrap();
        assert_eq!(a.method, DiscoveryMethod::Standard);
        assert_eq!(b.method, DiscoveryMethod::Ssdp);
    }

    #[test]
    fn test_dedupe_prefers_higher_priority_metadata() {
        let devices = vec![
            DiscoveredDevice::new("10.0.0.5", 1400, DiscoveryMethod::Scan).with_name("scan-name"),
            DiscoveredDevice::new("10.0.0.5", 1400, DiscoveryMethod::Mdns)
                .with_name("Living Room")
                .with_model("Play:5"),
            DiscoveredDevice::new("10.0.0.5", 1400, DiscoveryMethod::Ssdp).with_name("Living Room (SSDP)"),
        ];

        let merged = dedupe_by_priority(devices);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].method, DiscoveryMethod::Ssdp);
        assert_eq!(merged[0].name.as_deref(), Some("Living Room (SSDP)"));
        assert_eq!(merged[0].model.as_deref(), Some("Play:5"));
    }

    #[test]
    fn test_merge_lower_priority_does_not_overwrite() {
        let now = Instant::now();
        let mut registry = DeviceRegistry::new();
        registry.merge(
            vec![DiscoveredDevice::new("10.0.0.5", 1400, DiscoveryMethod::Standard).with_name("Kitchen")],
            now,
        );
        registry.merge(
            vec![DiscoveredDevice::new("10.0.0.5", 1400, DiscoveryMethod::Scan).with_name("10.0.0.5")],
            now,
        );

        let record = registry.get(&DeviceId::new("10.0.0.5", 1400)).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(record.name.as_deref(), Some("Kitchen"));
        assert_eq!(record.method, DiscoveryMethod::Standard);
    }

    #[test]
    fn test_merge_preserves_reliability_history() {
        let now = Instant::now();
        let mut registry = DeviceRegistry::new();
        let id = DeviceId::new("10.0.0.7", 1400);
        registry.merge(vec![DiscoveredDevice::new("10.0.0.7", 1400, DiscoveryMethod::Mdns)], now);
        registry.get_mut(&id).unwrap().reliability = 42.0;

        let summary = registry.merge(vec![DiscoveredDevice::new("10.0.0.7", 1400, DiscoveryMethod::Ssdp)], now);
        assert_eq!(summary, MergeSummary { added: 0, updated: 1 });
        assert_eq!(registry.get(&id).unwrap().reliability, 42.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_stale_skips_manual_devices() {
        let start = Instant::now();
        let mut registry = DeviceRegistry::new();
        registry.add_manual(
            &[ManualDevice {
                host: "10.0.0.2".to_string(),
                port: 1400,
                name: Some("Office".to_string()),
            }],
            start,
        );
        registry.merge(vec![DiscoveredDevice::new("10.0.0.3", 1400, DiscoveryMethod::Scan)], start);

        tokio::time::advance(Duration::from_secs(120)).await;
        let evicted = registry.evict_stale(Instant::now(), Duration::from_secs(60));

        assert_eq!(evicted, vec![DeviceId::new("10.0.0.3", 1400)]);
        assert_eq!(registry.len(), 1);
        assert!(registry.is_manual(&DeviceId::new("10.0.0.2", 1400)));
    }
}
