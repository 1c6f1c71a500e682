/// UPnP device description parsing using quick-xml
///
/// Extracts identity and the advertised service list from a device description
/// document, then derives audio format support from the device family.
use anyhow::{anyhow, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use tunebridge_core::{AudioFormat, Capability, DeviceDescription};

pub const AV_TRANSPORT: &str = "urn:schemas-upnp-org:service:AVTransport";
pub const RENDERING_CONTROL: &str = "urn:schemas-upnp-org:service:RenderingControl";
pub const ZONE_GROUP_TOPOLOGY: &str = "urn:schemas-upnp-org:service:ZoneGroupTopology";
pub const CONNECTION_MANAGER: &str = "urn:schemas-upnp-org:service:ConnectionManager";

/// Parse a UPnP device description document
///
/// Embedded devices (`deviceList`) contribute their services to the result; the
/// identity fields come from the root device.
pub fn parse_device_description(xml: &str) -> Result<DeviceDescription> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut description = DeviceDescription::default();
    let mut device_depth = 0usize;
    let mut in_service = false;
    let mut current_text = String::new();
    let mut saw_device = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                match e.name().as_ref() {
                    b"device" => {
                        device_depth += 1;
                        saw_device = true;
                    }
                    b"service" => in_service = true,
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::End(e)) => {
                let text = current_text.trim().to_string();
                let root_device = device_depth == 1 && !in_service;

                match e.name().as_ref() {
                    b"friendlyName" if root_device => description.name = non_empty(text),
                    b"modelName" if root_device => description.model = non_empty(text),
                    b"manufacturer" if root_device => description.manufacturer = non_empty(text),
                    b"UDN" if root_device => {
                        description.uuid = non_empty(text.strip_prefix("uuid:").unwrap_or(&text).to_string())
                    }
                    b"serviceType" if in_service => {
                        if !text.is_empty() && !description.services.contains(&text) {
                            description.services.push(text);
                        }
                    }
                    b"service" => in_service = false,
                    b"device" => device_depth = device_depth.saturating_sub(1),
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Text(e)) => {
                current_text.push_str(&e.unescape().unwrap_or_default());
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(anyhow!("XML parsing error at position {}: {}", reader.buffer_position(), e));
            }
            _ => {}
        }
    }

    if !saw_device {
        return Err(anyhow!("document has no <device> element"));
    }

    description.formats = infer_formats(&description);
    Ok(description)
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Audio formats supported by the device family
///
/// Sonos and WiiM players decode all four formats; generic renderers with an
/// AVTransport service are assumed to take MP3 and WAV.
pub fn infer_formats(description: &DeviceDescription) -> Vec<AudioFormat> {
    let family = format!(
        "{} {}",
        description.manufacturer.as_deref().unwrap_or_default(),
        description.model.as_deref().unwrap_or_default()
    )
    .to_lowercase();

    if family.contains("sonos") || family.contains("wiim") || family.contains("linkplay") {
        return vec![AudioFormat::Mp3, AudioFormat::Aac, AudioFormat::Flac, AudioFormat::Wav];
    }
    if has_service(description, AV_TRANSPORT) {
        return vec![AudioFormat::Mp3, AudioFormat::Wav];
    }
    Vec::new()
}

pub fn has_service(description: &DeviceDescription, prefix: &str) -> bool {
    description.services.iter().any(|s| s.starts_with(prefix))
}

/// Whether the advertised services cover a functional capability
pub fn supports_capability(description: &DeviceDescription, capability: Capability) -> bool {
    match capability {
        Capability::Volume => has_service(description, RENDERING_CONTROL),
        Capability::Playback => has_service(description, AV_TRANSPORT),
        Capability::Grouping => has_service(description, ZONE_GROUP_TOPOLOGY),
        Capability::Metadata => {
            has_service(description, AV_TRANSPORT) && has_service(description, CONNECTION_MANAGER)
        }
    }
}
