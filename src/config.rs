//! Gateway control configuration
//!
//! Every timeout and retry budget used by the backends lives here, so tests
//! and embedders can point discovery at non-standard addresses.

use crate::gateway::GatewayProtocol;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// How a zero lease is sent to a UPnP gateway
///
/// IGD v1 defines `NewLeaseDuration = 0` as "no expiry", but vendors differ:
/// some treat it as "router default", some IGD v2 devices reject it. This is
/// a known variance point, so the behaviour is configurable.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum ZeroLeasePolicy {
    /// Send 0 and let the router apply its "permanent" semantics
    #[default]
    Indefinite,
    /// Send this many seconds instead of 0
    Substitute {
        /// Lease sent in place of 0
        secs: u32,
    },
}

impl ZeroLeasePolicy {
    /// Lease to put on the wire for a requested lease of `secs`
    pub fn resolve(&self, secs: u32) -> u32 {
        match (secs, self) {
            (0, Self::Substitute { secs }) => *secs,
            (requested, _) => requested,
        }
    }
}

/// Gateway control settings
///
/// Settings can be stored in JSON format and loaded from disk. Missing fields
/// take their default values.
///
/// # Example
/// ```rust,no_run
/// use igdctl::GatewayConfig;
///
/// let config = GatewayConfig::load("gateway.json").expect("Failed to load");
/// println!("SSDP window: {:?}", config.ssdp_search_window());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Backends tried by [`Gateway::discover`](crate::Gateway::discover), in order
    pub prefer: Vec<GatewayProtocol>,
    /// Destination of SSDP M-SEARCH requests
    pub ssdp_addr: SocketAddr,
    /// How long to wait for SSDP responses in milliseconds
    pub ssdp_search_window_ms: u64,
    /// Timeout for each HTTP request to the gateway in milliseconds
    pub http_timeout_ms: u64,
    /// NAT-PMP gateway address; the default route is used when unset
    pub natpmp_gateway: Option<Ipv4Addr>,
    /// NAT-PMP server port
    pub natpmp_port: u16,
    /// First NAT-PMP response timeout in milliseconds, doubled per retry
    pub natpmp_initial_timeout_ms: u64,
    /// Number of NAT-PMP transmissions before giving up
    pub natpmp_max_attempts: u32,
    /// Treatment of zero leases on UPnP gateways
    pub zero_lease_policy: ZeroLeasePolicy,
    /// Description attached to UPnP port mappings
    pub mapping_description: String,
}

impl GatewayConfig {
    /// Load settings from a JSON file
    ///
    /// Returns the defaults if the file doesn't exist or is empty.
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;

        Ok(config)
    }

    /// Save settings to a JSON file
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
        }

        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Check that the retry budget and protocol list are usable
    pub fn validate(&self) -> Result<()> {
        if self.prefer.is_empty() {
            return Err(Error::Config("prefer must list at least one protocol".to_string()));
        }
        if self.natpmp_max_attempts == 0 {
            return Err(Error::Config("natpmp_max_attempts must be at least 1".to_string()));
        }
        if self.natpmp_initial_timeout_ms == 0 || self.http_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    /// SSDP response window
    pub fn ssdp_search_window(&self) -> Duration {
        Duration::from_millis(self.ssdp_search_window_ms)
    }

    /// Per-request HTTP timeout
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    /// First NAT-PMP response timeout
    pub fn natpmp_initial_timeout(&self) -> Duration {
        Duration::from_millis(self.natpmp_initial_timeout_ms)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            prefer: vec![GatewayProtocol::Upnp, GatewayProtocol::NatPmp],
            ssdp_addr: SocketAddr::from(([239, 255, 255, 250], 1900)),
            ssdp_search_window_ms: 3000,
            http_timeout_ms: 5000,
            natpmp_gateway: None,
            natpmp_port: crate::gateway::natpmp::NATPMP_SERVER_PORT,
            // RFC 6886 starts at 250ms and doubles; four sends give up after 3.75s
            natpmp_initial_timeout_ms: 250,
            natpmp_max_attempts: 4,
            zero_lease_policy: ZeroLeasePolicy::default(),
            mapping_description: "igdctl".to_string(),
        }
    }
}
