use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::time::Duration;
use tracing::{debug, info};
use tunebridge_core::{DiscoveredDevice, DiscoveryMethod};

/// Discover speakers advertising any of `service_types` via multicast DNS
///
/// All service types are browsed at once and share the timeout. A device seen under
/// several service types on the same host and port is reported once.
pub async fn discover_devices(service_types: &[String], timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
    info!("Starting mDNS discovery for {} service type(s)", service_types.len());

    let mdns = ServiceDaemon::new().context("Failed to create mDNS service daemon")?;

    let mut receivers = Vec::new();
    for service_type in service_types {
        debug!("Browsing for service type: {}", service_type);
        match mdns.browse(service_type) {
            Ok(receiver) => receivers.push(receiver),
            Err(e) => {
                // Stop the daemon thread before bailing out
                let _ = mdns.shutdown();
                return Err(e).with_context(|| format!("Failed to browse for service: {}", service_type));
            }
        }
    }

    let mut discovered: Vec<DiscoveredDevice> = Vec::new();
    let start = std::time::Instant::now();

    while start.elapsed() < timeout {
        let mut idle = true;
        for receiver in &receivers {
            let event = tokio::task::spawn_blocking({
                let receiver = receiver.clone();
                move || receiver.recv_timeout(Duration::from_millis(50))
            })
            .await;

            if let Ok(Ok(event)) = event {
                idle = false;
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        if let Some(device) = device_from_service(&info) {
                            info!("mDNS found {} at {}", device.name.as_deref().unwrap_or("?"), device.id);
                            if !discovered.iter().any(|d| d.id == device.id) {
                                discovered.push(device);
                            }
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        debug!("mDNS service removed: {}", fullname);
                    }
                    _ => {}
                }
            }
        }
        if idle {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // Shutdown may log a harmless "sending on a closed channel" error
    if let Err(e) = mdns.shutdown() {
        debug!("mDNS shutdown error (harmless): {}", e);
    }

    info!("mDNS discovery complete. Found {} device(s)", discovered.len());
    Ok(discovered)
}

fn device_from_service(info: &ServiceInfo) -> Option<DiscoveredDevice> {
    // Prefer IPv4
    let addr = info
        .get_addresses()
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| info.get_addresses().iter().next())?;

    let properties = info.get_properties();
    let name = properties
        .get("fn")
        .map(|v| v.val_str().to_string())
        .unwrap_or_else(|| instance_name(info.get_fullname()));
    let model = properties
        .get("am")
        .or_else(|| properties.get("model"))
        .map(|v| v.val_str().to_string());

    let mut device = DiscoveredDevice::new(addr.to_string(), info.get_port(), DiscoveryMethod::Mdns).with_name(name);
    device.model = model;
    Some(device)
}

/// Human part of an mDNS full name
///
/// `000E58A01234@Living Room._raop._tcp.local.` becomes `Living Room`.
pub fn instance_name(fullname: &str) -> String {
    let instance = fullname.split("._").next().unwrap_or(fullname);
    match instance.split_once('@') {
        Some((_, name)) if !name.is_empty() => name.to_string(),
        _ => instance.to_string(),
    }
}
