use crate::models::{Capability, DeviceDescription, DiscoveredDevice, ResourceReading};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Speaker-control client (Sonos, UPnP renderers, etc.)
///
/// The bridge only probes through this trait. Playback, volume and transport
/// commands belong to the implementation, not to the bridge.
#[async_trait]
pub trait SpeakerClient: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Announce-based discovery native to the speaker family
    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>>;

    /// Fetch identity and service information for one endpoint
    async fn probe(&self, host: &str, port: u16) -> Result<DeviceDescription>;

    /// Check whether a functional capability works on the endpoint
    async fn check_capability(&self, host: &str, port: u16, capability: Capability) -> Result<bool> {
        let _ = (host, port);
        Err(anyhow!("{} check not supported by {}", capability.as_str(), self.name()))
    }
}

/// Source of host resource readings
pub trait ResourceSampler: Send {
    /// Take one reading; failures skip the current tick only
    fn sample(&mut self) -> Result<ResourceReading>;
}
