//! Common types for the gateway module

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TCP mapping
    #[serde(rename = "TCP")]
    Tcp,
    /// UDP mapping
    #[serde(rename = "UDP")]
    Udp,
}

impl Protocol {
    /// Wire name used in UPnP `NewProtocol` arguments
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gateway control protocol spoken by a [`Gateway`](super::Gateway) handle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GatewayProtocol {
    /// UPnP Internet Gateway Device (SSDP + SOAP)
    Upnp,
    /// NAT Port Mapping Protocol (RFC 6886)
    NatPmp,
}

impl fmt::Display for GatewayProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upnp => f.write_str("UPnP"),
            Self::NatPmp => f.write_str("NAT-PMP"),
        }
    }
}

/// A requested port forwarding
///
/// Mappings are keyed by (protocol, external port) on the router. Adding the
/// same key again overwrites the previous mapping. Expiry is tracked by the
/// router only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    /// Transport protocol
    pub protocol: Protocol,
    /// Address of the internal host receiving the traffic
    pub internal_ip: Ipv4Addr,
    /// Port on the internal host
    pub internal_port: u16,
    /// Port opened on the gateway's external address
    pub external_port: u16,
    /// Requested lease in seconds (0 = indefinite / router default)
    pub lease_secs: u32,
}

impl PortMapping {
    /// Validate caller-supplied values and build a mapping request
    ///
    /// Ports outside `1..=65535` are refused with
    /// [`GatewayError::MappingRejected`]: port 0 would let the router pick a
    /// port, and this crate never substitutes ports behind the caller's back.
    pub fn new(
        protocol: Protocol,
        internal_ip: Ipv4Addr,
        internal_port: i32,
        external_port: i32,
        lease: Duration,
    ) -> Result<Self> {
        let internal_port = u16::try_from(internal_port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                GatewayError::MappingRejected(format!("invalid internal port {}", internal_port))
            })?;
        let external_port = u16::try_from(external_port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                GatewayError::MappingRejected(format!("invalid external port {}", external_port))
            })?;

        Ok(Self {
            protocol,
            internal_ip,
            internal_port,
            external_port,
            lease_secs: lease_secs(lease),
        })
    }
}

/// Whole seconds of `lease`, rounded up so a short lease never becomes 0
fn lease_secs(lease: Duration) -> u32 {
    let secs = lease.as_secs() + u64::from(lease.subsec_nanos() > 0);
    u32::try_from(secs).unwrap_or(u32::MAX)
}

/// Validate an external port passed to a removal
pub(crate) fn removal_port(external_port: i32) -> Result<u16> {
    u16::try_from(external_port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or(GatewayError::InvalidPort(external_port))
}

/// Errors that can occur while controlling a gateway
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// No IGD or NAT-PMP gateway could be discovered
    #[error("No gateway found")]
    NoGatewayFound,

    /// Transport failure (timeout, connection refused) after the retry budget
    #[error("Gateway unreachable: {0}")]
    GatewayUnreachable(String),

    /// The gateway explicitly refused the mapping
    #[error("Mapping rejected: {0}")]
    MappingRejected(String),

    /// Port outside the valid range was passed by the caller
    #[error("Invalid port: {0}")]
    InvalidPort(i32),

    /// The gateway answered with an error that is not a mapping refusal
    #[error("Gateway error {code}: {description}")]
    Fault {
        /// UPnP error code or NAT-PMP result code
        code: u16,
        /// Error description reported by the gateway
        description: String,
    },

    /// Malformed or unexpected response body
    #[error("Invalid response: {0}")]
    Parse(String),

    /// Operation aborted by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Caller-supplied deadline elapsed
    #[error("Operation timed out")]
    Timeout,

    /// The handle was closed
    #[error("Gateway handle is closed")]
    Closed,

    /// IO error while setting up sockets
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl GatewayError {
    /// Whether this failure means the cached endpoint may have moved
    ///
    /// Only transport-level failures and garbage responses qualify. A SOAP
    /// fault or NAT-PMP result code proves the endpoint is alive.
    pub fn is_stale_signal(&self) -> bool {
        matches!(self, Self::GatewayUnreachable(_) | Self::Parse(_))
    }

    /// Whether retrying the same request later may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::GatewayUnreachable(_)
                | Self::Parse(_)
                | Self::Fault { .. }
                | Self::Timeout
                | Self::Io(_)
        )
    }
}
