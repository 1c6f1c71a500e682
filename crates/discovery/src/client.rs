use crate::description::supports_capability;
use crate::ssdp;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use tunebridge_core::{Capability, DeviceDescription, DiscoveredDevice, DiscoveryMethod, SpeakerClient};

/// Description paths tried in order when probing an endpoint
const DESCRIPTION_PATHS: [&str; 3] = ["/xml/device_description.xml", "/description.xml", "/DeviceDescription.xml"];

/// Speaker client that answers probes from UPnP device descriptions
///
/// It reads what speakers publish about themselves and never issues transport or
/// volume commands. Capability checks are answered from the advertised services.
pub struct UpnpDescriptionClient {
    client: Client,
    search_targets: Vec<String>,
}

impl UpnpDescriptionClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            search_targets: vec!["urn:schemas-upnp-org:device:ZonePlayer:1".to_string()],
        })
    }
}

#[async_trait]
impl SpeakerClient for UpnpDescriptionClient {
    fn name(&self) -> &str {
        "upnp-description"
    }

    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        ssdp::discover(&self.search_targets, timeout, DiscoveryMethod::Standard).await
    }

    async fn probe(&self, host: &str, port: u16) -> Result<DeviceDescription> {
        let mut last_error = None;

        for path in DESCRIPTION_PATHS {
            let url = format!("http://{}:{}{}", host, port, path);
            debug!("Probing {}", url);
            match ssdp::fetch_description(&self.client, &url).await {
                Ok(description) => return Ok(description),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("no description path answered")))
    }

    async fn check_capability(&self, host: &str, port: u16, capability: Capability) -> Result<bool> {
        let description = self.probe(host, port).await?;
        Ok(supports_capability(&description, capability))
    }
}
