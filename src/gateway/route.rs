//! Default gateway and local address lookup for different platforms

use super::types::{GatewayError, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::debug;

/// Find the default gateway's IPv4 address
///
/// On Linux this reads the kernel routing table, on macOS and Windows it asks
/// the platform's route tooling.
pub async fn find_default_gateway() -> Result<Ipv4Addr> {
    #[cfg(target_os = "linux")]
    {
        find_gateway_linux().await
    }

    #[cfg(target_os = "macos")]
    {
        find_gateway_macos().await
    }

    #[cfg(target_os = "windows")]
    {
        find_gateway_windows().await
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        Err(GatewayError::NoGatewayFound)
    }
}

/// Local IPv4 address the host uses to reach `peer`
///
/// Connecting a UDP socket only selects a route; no packet is sent.
pub async fn local_ip_for(peer: Ipv4Addr) -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(SocketAddr::new(IpAddr::V4(peer), 9)).await?;

    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) => {
            debug!("Local address towards {} is {}", peer, ip);
            Ok(ip)
        }
        IpAddr::V6(ip) => Err(GatewayError::GatewayUnreachable(format!(
            "route to {} uses IPv6 source {}",
            peer, ip
        ))),
    }
}

/// Local IPv4 address of the interface facing the default gateway
pub async fn local_ipv4() -> Result<Ipv4Addr> {
    let gateway = find_default_gateway().await?;
    local_ip_for(gateway).await
}

/// Parse the default route out of `/proc/net/route` contents
///
/// Addresses are printed as host-order integers of network-order bytes.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn parse_proc_net_route(table: &str) -> Option<Ipv4Addr> {
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields[1] != "00000000" {
            continue;
        }

        if let Ok(gateway) = u32::from_str_radix(fields[2], 16) {
            if gateway == 0 {
                continue;
            }
            return Some(Ipv4Addr::from(gateway.to_ne_bytes()));
        }
    }

    None
}

#[cfg(target_os = "linux")]
async fn find_gateway_linux() -> Result<Ipv4Addr> {
    let table = tokio::fs::read_to_string("/proc/net/route")
        .await
        .map_err(|e| GatewayError::GatewayUnreachable(format!("Failed to read route table: {}", e)))?;

    parse_proc_net_route(&table).ok_or(GatewayError::NoGatewayFound)
}

#[cfg(target_os = "macos")]
async fn find_gateway_macos() -> Result<Ipv4Addr> {
    use tokio::process::Command;

    let output = Command::new("netstat")
        .args(["-rn", "-f", "inet"])
        .output()
        .await
        .map_err(|e| GatewayError::GatewayUnreachable(format!("Failed to run netstat: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    for line in stdout.lines() {
        if line.starts_with("default") {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if let Some(Ok(ip)) = fields.get(1).map(|f| f.parse::<Ipv4Addr>()) {
                return Ok(ip);
            }
        }
    }

    Err(GatewayError::NoGatewayFound)
}

#[cfg(target_os = "windows")]
async fn find_gateway_windows() -> Result<Ipv4Addr> {
    use tokio::process::Command;

    let output = Command::new("route")
        .args(["print", "0.0.0.0"])
        .output()
        .await
        .map_err(|e| GatewayError::GatewayUnreachable(format!("Failed to run route: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    for line in stdout.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("0.0.0.0") {
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            if let Some(Ok(ip)) = fields.get(2).map(|f| f.parse::<Ipv4Addr>()) {
                return Ok(ip);
            }
        }
    }

    Err(GatewayError::NoGatewayFound)
}
