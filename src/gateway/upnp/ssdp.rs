//! SSDP discovery and IGD device description parsing
//!
//! Discovery multicasts an M-SEARCH, takes the `LOCATION` of each response,
//! fetches the device description found there and looks for a WAN IP (or
//! PPP) connection service. The first device exposing one wins.

use crate::gateway::types::{GatewayError, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;
use xmltree::{Element, XMLNode};

/// Search targets, most specific first
pub(crate) const SEARCH_TARGETS: &[&str] = &[
    "urn:schemas-upnp-org:service:WANIPConnection:1",
    "urn:schemas-upnp-org:device:InternetGatewayDevice:1",
];

/// The SOAP control point of a WAN connection service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPoint {
    /// Absolute URL accepting SOAP requests
    pub control_url: Url,
    /// Full service type, used as the SOAP action namespace
    pub service_type: String,
}

/// Build an M-SEARCH request for `target`
pub(crate) fn build_search_request(ssdp_addr: SocketAddr, target: &str, mx_secs: u64) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}\r\n\
         ST: {}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\r\n",
        ssdp_addr, target, mx_secs
    )
}

/// Extract the `LOCATION` header of a positive search response
///
/// Responses announcing an unrelated search target are skipped.
pub(crate) fn parse_search_response(response: &str) -> Option<Url> {
    let mut lines = response.lines();
    let status = lines.next()?;
    if !status.to_ascii_uppercase().starts_with("HTTP/1.1 200") {
        return None;
    }

    let mut location = None;
    let mut target = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "location" => location = Some(value.trim()),
            "st" => target = Some(value.trim()),
            _ => {}
        }
    }

    if let Some(st) = target {
        let wanted = SEARCH_TARGETS.iter().any(|t| st.eq_ignore_ascii_case(t))
            || st.contains("WANIPConnection")
            || st.contains("WANPPPConnection");
        if !wanted {
            return None;
        }
    }

    Url::parse(location?).ok()
}

/// Find the WAN connection service in a device description
///
/// The control URL is resolved against `URLBase` when the description carries
/// one, and against the description's own location otherwise.
pub(crate) fn parse_device_description(xml: &str, location: &Url) -> Result<ControlPoint> {
    let root = Element::parse(xml.as_bytes())
        .map_err(|e| GatewayError::Parse(format!("device description: {}", e)))?;

    let base = root
        .get_child("URLBase")
        .and_then(|b| b.get_text())
        .and_then(|text| Url::parse(text.trim()).ok())
        .unwrap_or_else(|| location.clone());

    let device = root
        .get_child("device")
        .ok_or_else(|| GatewayError::Parse("device description has no device".to_string()))?;

    let (service_type, control_path) = find_service(device, "WANIPConnection")
        .or_else(|| find_service(device, "WANPPPConnection"))
        .ok_or_else(|| {
            GatewayError::Parse("no WAN IP connection service in device description".to_string())
        })?;

    let control_url = base
        .join(&control_path)
        .map_err(|e| GatewayError::Parse(format!("invalid control URL {}: {}", control_path, e)))?;

    Ok(ControlPoint {
        control_url,
        service_type,
    })
}

/// Depth-first search for a service whose type contains `kind`
fn find_service(device: &Element, kind: &str) -> Option<(String, String)> {
    if let Some(services) = device.get_child("serviceList") {
        for service in child_elements(services, "service") {
            let Some(service_type) = service.get_child("serviceType").and_then(|t| t.get_text()) else {
                continue;
            };
            if !service_type.contains(kind) {
                continue;
            }
            if let Some(control) = service.get_child("controlURL").and_then(|c| c.get_text()) {
                return Some((service_type.trim().to_string(), control.trim().to_string()));
            }
        }
    }

    let embedded = device.get_child("deviceList")?;
    child_elements(embedded, "device").find_map(|d| find_service(d, kind))
}

fn child_elements<'a>(parent: &'a Element, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
    parent.children.iter().filter_map(move |child| match child {
        XMLNode::Element(e) if e.name == name => Some(e),
        _ => None,
    })
}

/// Fetch and parse the device description at `location`
pub(crate) async fn fetch_control_point(
    client: &reqwest::Client,
    location: &Url,
) -> Result<ControlPoint> {
    let response = client
        .get(location.clone())
        .send()
        .await
        .map_err(|e| GatewayError::GatewayUnreachable(format!("fetching {}: {}", location, e)))?;

    if !response.status().is_success() {
        return Err(GatewayError::GatewayUnreachable(format!(
            "fetching {}: HTTP {}",
            location,
            response.status()
        )));
    }

    let xml = response
        .text()
        .await
        .map_err(|e| GatewayError::GatewayUnreachable(format!("reading {}: {}", location, e)))?;

    parse_device_description(&xml, location)
}

/// Search for an IGD and return its WAN connection control point
///
/// Responses are processed as they arrive until one leads to a usable device
/// description or `window` elapses.
/// Unwrap one receive result, logging errors instead of ending the search
///
/// Windows reports an earlier ICMP port unreachable as a receive error on
/// the next `recv_from`; later responses can still arrive.
pub(crate) fn accept_datagram(
    received: std::io::Result<(usize, SocketAddr)>,
) -> Option<(usize, SocketAddr)> {
    match received {
        Ok(datagram) => Some(datagram),
        Err(e) => {
            warn!("SSDP receive failed, still listening: {}", e);
            None
        }
    }
}

pub(crate) async fn discover(
    client: &reqwest::Client,
    ssdp_addr: SocketAddr,
    window: Duration,
) -> Result<ControlPoint> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    if ssdp_addr.ip().is_multicast() {
        socket.set_multicast_ttl_v4(2)?;
    }

    let mx_secs = window.as_secs().clamp(1, 5);
    for target in SEARCH_TARGETS {
        let request = build_search_request(ssdp_addr, target, mx_secs);
        socket.send_to(request.as_bytes(), ssdp_addr).await?;
    }
    debug!("Sent SSDP M-SEARCH to {} (window {:?})", ssdp_addr, window);

    let deadline = Instant::now() + window;
    let mut buf = vec![0u8; 2048];
    let mut tried = Vec::new();

    loop {
        let received = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(received) => received,
            Err(_) => break,
        };
        let Some((len, from)) = accept_datagram(received) else {
            continue;
        };

        let response = String::from_utf8_lossy(&buf[..len]);
        let Some(location) = parse_search_response(&response) else {
            debug!("Ignoring SSDP datagram from {}", from);
            continue;
        };
        if tried.contains(&location) {
            continue;
        }
        debug!("SSDP response from {}: {}", from, location);

        match tokio::time::timeout_at(deadline, fetch_control_point(client, &location)).await {
            Ok(Ok(control_point)) => {
                info!(
                    "Found UPnP gateway at {} (control URL {})",
                    location, control_point.control_url
                );
                return Ok(control_point);
            }
            Ok(Err(e)) => debug!("Unusable device description at {}: {}", location, e),
            Err(_) => break,
        }
        tried.push(location);
    }

    debug!("No usable SSDP response within {:?}", window);
    Err(GatewayError::NoGatewayFound)
}
