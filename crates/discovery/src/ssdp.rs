/// SSDP (Simple Service Discovery Protocol) search for UPnP speakers
///
/// Sends M-SEARCH requests to the SSDP multicast group, collects the unicast
/// responses until the deadline and resolves each LOCATION to a device description.

use crate::description::parse_device_description;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Url;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tunebridge_core::{Capabilities, DeviceDescription, DiscoveredDevice, DiscoveryMethod};

pub const SSDP_ADDR: &str = "239.255.255.250:1900";
pub const SSDP_MULTICAST: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const SSDP_MX: u8 = 2;
/// Consecutive receive errors tolerated before a search gives up
const MAX_SOCKET_ERRORS: u32 = 5;
const SOCKET_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// One parsed M-SEARCH response
#[derive(Debug, Clone, PartialEq)]
pub struct SsdpResponse {
    pub location: String,
    pub search_target: Option<String>,
    pub server: Option<String>,
    pub usn: Option<String>,
    pub source: SocketAddr,
}

/// Search for the given targets and return unique responses (by LOCATION)
pub async fn search(targets: &[String], timeout: Duration) -> Result<Vec<SsdpResponse>> {
    info!("Starting SSDP search for {} target(s) ({:?} timeout)", targets.len(), timeout);

    let socket = create_ssdp_socket()?;
    send_msearch(&socket, targets).await?;

    let responses = collect_responses(&socket, Instant::now() + timeout).await;
    info!("SSDP search complete, {} unique response(s)", responses.len());
    Ok(responses.into_values().collect())
}

/// Source of raw SSDP datagrams
#[async_trait]
trait DatagramSource: Send + Sync {
    async fn recv_datagram(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl DatagramSource for UdpSocket {
    async fn recv_datagram(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.recv_from(buf).await
    }
}

/// Read responses until the deadline, keyed by LOCATION
///
/// Socket errors back off briefly; a run of them ends the search early with
/// whatever was collected.
async fn collect_responses(source: &dyn DatagramSource, deadline: Instant) -> HashMap<String, SsdpResponse> {
    let mut responses: HashMap<String, SsdpResponse> = HashMap::new();
    let mut buf = [0u8; 2048];
    let mut errors = 0;

    loop {
        match tokio::time::timeout_at(deadline, source.recv_datagram(&mut buf)).await {
            Ok(Ok((len, addr))) => {
                errors = 0;
                let text = String::from_utf8_lossy(&buf[..len]);
                debug!("SSDP response from {} ({} bytes)", addr, len);
                if let Some(response) = parse_response(&text, addr) {
                    responses.entry(response.location.clone()).or_insert(response);
                }
            }
            Ok(Err(e)) => {
                errors += 1;
                warn!("Socket error during SSDP search: {}", e);
                if errors >= MAX_SOCKET_ERRORS {
                    warn!("Abandoning SSDP search after {} consecutive socket errors", errors);
                    break;
                }
                tokio::time::sleep_until((Instant::now() + SOCKET_ERROR_BACKOFF).min(deadline)).await;
            }
            Err(_) => break,
        }
    }
    responses
}

/// Search and resolve every response to a discovered device
pub async fn discover(
    targets: &[String],
    timeout: Duration,
    method: DiscoveryMethod,
) -> Result<Vec<DiscoveredDevice>> {
    let responses = search(targets, timeout).await?;
    let client = reqwest::Client::builder().timeout(timeout).build()?;

    let mut devices = Vec::new();
    for response in responses {
        let Some((host, port)) = host_port_from_location(&response.location) else {
            warn!("Ignoring SSDP response with bad LOCATION: {}", response.location);
            continue;
        };

        let mut device = DiscoveredDevice::new(host, port, method);
        match fetch_description(&client, &response.location).await {
            Ok(description) => apply_description(&mut device, &description),
            Err(e) => debug!("Description fetch failed for {}: {}", response.location, e),
        }
        devices.push(device);
    }
    Ok(devices)
}

/// Copy identity and capabilities from a description onto a discovered device
pub fn apply_description(device: &mut DiscoveredDevice, description: &DeviceDescription) {
    device.name = description.name.clone().or(device.name.take());
    device.model = description.model.clone().or(device.model.take());
    device.capabilities = capabilities_from(description);
}

pub fn capabilities_from(description: &DeviceDescription) -> Capabilities {
    use crate::description::supports_capability;
    use tunebridge_core::Capability;

    Capabilities {
        volume: supports_capability(description, Capability::Volume),
        playback: supports_capability(description, Capability::Playback),
        grouping: supports_capability(description, Capability::Grouping),
        metadata: supports_capability(description, Capability::Metadata),
        formats: description.formats.clone(),
    }
}

/// Fetch and parse a UPnP device description
pub async fn fetch_description(client: &reqwest::Client, location: &str) -> Result<DeviceDescription> {
    let response = client.get(location).send().await?;
    if !response.status().is_success() {
        return Err(anyhow!("description request returned {}", response.status()));
    }
    let xml = response.text().await?;
    parse_device_description(&xml)
}

/// Create a UDP socket joined to the SSDP multicast group
pub fn create_ssdp_socket() -> Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    // Coexist with other UPnP stacks on the host
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
    socket.bind(&addr.into())?;
    socket.join_multicast_v4(&SSDP_MULTICAST, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(2)?;
    socket.set_nonblocking(true)?;

    let socket: std::net::UdpSocket = socket.into();
    debug!("SSDP socket bound to {}", socket.local_addr()?);
    Ok(UdpSocket::from_std(socket)?)
}

async fn send_msearch(socket: &UdpSocket, targets: &[String]) -> Result<()> {
    let mut sent = 0;
    for st in targets {
        let msearch = build_msearch(st);
        match socket.send_to(msearch.as_bytes(), SSDP_ADDR).await {
            Ok(bytes) => {
                debug!("Sent M-SEARCH for {} ({} bytes)", st, bytes);
                sent += 1;
            }
            Err(e) => warn!("Failed to send M-SEARCH for {}: {}", st, e),
        }
    }

    if sent == 0 {
        return Err(anyhow!("no M-SEARCH request could be sent"));
    }
    Ok(())
}

fn build_msearch(search_target: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\
         ST: {}\r\n\
         \r\n",
        SSDP_ADDR, SSDP_MX, search_target
    )
}

/// Parse the headers of an SSDP response; `None` without a LOCATION
pub fn parse_response(text: &str, source: SocketAddr) -> Option<SsdpResponse> {
    let mut headers: HashMap<String, String> = HashMap::new();
    for line in text.lines().skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    Some(SsdpResponse {
        location: headers.remove("location")?,
        search_target: headers.remove("st").or_else(|| headers.remove("nt")),
        server: headers.remove("server"),
        usn: headers.remove("usn"),
        source,
    })
}

/// Extract host and port from a description URL
pub fn host_port_from_location(location: &str) -> Option<(String, u16)> {
    let url = Url::parse(location).ok()?;
    let host = url.host_str()?.to_string();
    let port = url.port_or_known_default()?;
    Some((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Socket whose every receive fails
    struct BrokenSocket {
        calls: AtomicU32,
    }

    #[async_trait]
    impl DatagramSource for BrokenSocket {
        async fn recv_datagram(&self, _buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "network down"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_socket_errors_back_off_and_end_search() {
        let socket = BrokenSocket {
            calls: AtomicU32::new(0),
        };
        let started = Instant::now();

        let responses = collect_responses(&socket, started + Duration::from_secs(60)).await;

        assert!(responses.is_empty());
        assert_eq!(socket.calls.load(Ordering::SeqCst), MAX_SOCKET_ERRORS);
        let waited = started.elapsed();
        assert!(waited >= SOCKET_ERROR_BACKOFF * (MAX_SOCKET_ERRORS - 1));
        assert!(waited < Duration::from_secs(60));
    }

    #[test]
    fn test_parse_response_headers() {
        let text = "HTTP/1.1 200 OK\r\n\
                    CACHE-CONTROL: max-age = 1800\r\n\
                    LOCATION: http://192.168.1.100:1400/xml/device_description.xml\r\n\
                    SERVER: Linux UPnP/1.0 Sonos/70.3-35220 (ZPS1)\r\n\
                    ST: urn:schemas-upnp-org:device:ZonePlayer:1\r\n\
                    USN: uuid:RINCON_000E58A0123401400::urn:schemas-upnp-org:device:ZonePlayer:1\r\n\r\n";
        let source: SocketAddr = "192.168.1.100:1900".parse().unwrap();

        let response = parse_response(text, source).unwrap();
        assert_eq!(response.location, "http://192.168.1.100:1400/xml/device_description.xml");
        assert_eq!(
            response.search_target.as_deref(),
            Some("urn:schemas-upnp-org:device:ZonePlayer:1")
        );
        assert!(response.server.unwrap().contains("Sonos"));
    }

    #[test]
    fn test_response_without_location_is_ignored() {
        let source: SocketAddr = "192.168.1.100:1900".parse().unwrap();
        assert!(parse_response("HTTP/1.1 200 OK\r\nST: ssdp:all\r\n\r\n", source).is_none());
    }

    #[test]
    fn test_host_port_from_location() {
        assert_eq!(
            host_port_from_location("http://192.168.1.100:1400/xml/device_description.xml"),
            Some(("192.168.1.100".to_string(), 1400))
        );
        assert_eq!(
            host_port_from_location("http://10.0.0.4/description.xml"),
            Some(("10.0.0.4".to_string(), 80))
        );
        assert_eq!(host_port_from_location("not a url"), None);
    }

    #[test]
    fn test_msearch_format() {
        let request = build_msearch("ssdp:all");
        assert!(request.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(request.contains("MAN: \"ssdp:discover\""));
        assert!(request.ends_with("ST: ssdp:all\r\n\r\n"));
    }

    #[tokio::test]
    #[ignore] // Requires multicast and UPnP devices on the network
    async fn test_live_search() {
        let targets = vec!["ssdp:all".to_string()];
        let responses = search(&targets, Duration::from_secs(3)).await.unwrap();
        println!("Found {} responses", responses.len());
    }
}
