//! Subnet scan: TCP sweep of the local /24 on speaker ports
//!
//! Every host that accepts a connection is confirmed through the speaker client's
//! probe before it is reported.

use crate::net::{local_ipv4, subnet_hosts, tcp_connect_time};
use crate::ssdp::capabilities_from;
use anyhow::Result;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};
use tunebridge_core::{DiscoveredDevice, DiscoveryMethod, SpeakerClient};

/// Per-connection limit; the engine's shared timeout bounds the whole sweep
const CONNECT_TIMEOUT: Duration = Duration::from_millis(400);

pub async fn scan_subnet(
    client: Arc<dyn SpeakerClient>,
    ports: &[u16],
    concurrency: usize,
) -> Result<Vec<DiscoveredDevice>> {
    let local = local_ipv4()?;
    scan_hosts(client, subnet_hosts(local), ports, concurrency).await
}

/// Sweep an explicit host list
pub async fn scan_hosts(
    client: Arc<dyn SpeakerClient>,
    hosts: Vec<Ipv4Addr>,
    ports: &[u16],
    concurrency: usize,
) -> Result<Vec<DiscoveredDevice>> {
    info!("Scanning {} host(s) on ports {:?}", hosts.len(), ports);

    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for host in hosts {
        for &port in ports {
            let permits = permits.clone();
            let client = client.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                let addr = SocketAddr::from((host, port));
                tcp_connect_time(addr, CONNECT_TIMEOUT).await.ok()?;

                let host = host.to_string();
                match client.probe(&host, port).await {
                    Ok(description) => {
                        let mut device = DiscoveredDevice::new(host, port, DiscoveryMethod::Scan);
                        device.name = description.name.clone();
                        device.model = description.model.clone();
                        device.capabilities = capabilities_from(&description);
                        Some(device)
                    }
                    Err(e) => {
                        debug!("{} accepted a connection but failed the probe: {}", addr, e);
                        None
                    }
                }
            });
        }
    }

    let mut devices = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        if let Ok(Some(device)) = joined {
            devices.push(device);
        }
    }

    info!("Subnet scan complete, {} speaker(s) confirmed", devices.len());
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use tokio::net::TcpListener;
    use tunebridge_core::DeviceDescription;

    struct MockClient {
        accept: bool,
    }

    #[async_trait]
    impl SpeakerClient for MockClient {
        fn name(&self) -> &str {
            "mock"
        }

        async fn discover(&self, _timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
            Ok(Vec::new())
        }

        async fn probe(&self, _host: &str, _port: u16) -> Result<DeviceDescription> {
            if self.accept {
                Ok(DeviceDescription {
                    name: Some("Test Speaker".to_string()),
                    ..Default::default()
                })
            } else {
                Err(anyhow!("not a speaker"))
            }
        }
    }

    #[tokio::test]
    async fn test_scan_confirms_listening_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let client: Arc<dyn SpeakerClient> = Arc::new(MockClient { accept: true });
        let devices = scan_hosts(client, vec![Ipv4Addr::LOCALHOST], &[port], 4).await.unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].method, DiscoveryMethod::Scan);
        assert_eq!(devices[0].name.as_deref(), Some("Test Speaker"));
    }

    #[tokio::test]
    async fn test_scan_drops_hosts_failing_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let client: Arc<dyn SpeakerClient> = Arc::new(MockClient { accept: false });
        let devices = scan_hosts(client, vec![Ipv4Addr::LOCALHOST], &[port], 4).await.unwrap();
        assert!(devices.is_empty());
    }
}
