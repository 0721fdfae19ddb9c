//! Protocol selection - one handle over whichever gateway answers

use super::control::GatewayControl;
use super::natpmp::NatPmpGateway;
use super::session::SessionState;
use super::types::{GatewayError, GatewayProtocol, Protocol, Result};
use super::upnp::UpnpGateway;
use crate::config::GatewayConfig;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, error, info};

/// A discovered gateway, controlled over UPnP IGD or NAT-PMP
pub enum Gateway {
    /// UPnP IGD backend
    Upnp(UpnpGateway),
    /// NAT-PMP backend
    NatPmp(NatPmpGateway),
}

impl Gateway {
    /// Find a gateway, trying the protocols in `config.prefer` order
    ///
    /// Each candidate is probed by asking for the external address. The
    /// first backend that answers is returned with its discovery cached.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use igdctl::{Gateway, GatewayConfig, GatewayControl};
    ///
    /// # async fn example() -> igdctl::Result<()> {
    /// let gateway = Gateway::discover(&GatewayConfig::default()).await?;
    /// println!("{} says we are {}", gateway.protocol(), gateway.external_ip().await?);
    /// gateway.close().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn discover(config: &GatewayConfig) -> Result<Self> {
        info!(
            "Discovering gateway (trying {})",
            config
                .prefer
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" → ")
        );

        let mut failures = Vec::new();
        for protocol in &config.prefer {
            info!("Attempting {} discovery...", protocol);
            let candidate = match protocol {
                GatewayProtocol::Upnp => Self::Upnp(UpnpGateway::new(config)?),
                GatewayProtocol::NatPmp => Self::NatPmp(NatPmpGateway::new(config)),
            };

            match candidate.external_ip().await {
                Ok(ip) => {
                    info!("{} gateway found (external address {})", protocol, ip);
                    return Ok(candidate);
                }
                Err(e) => {
                    debug!("{} failed: {}", protocol, e);
                    failures.push(format!("{}: {}", protocol, e));
                    // Release whatever the probe opened before moving on
                    let _ = candidate.close().await;
                }
            }
        }

        error!("No gateway found. Summary: {}", failures.join(", "));
        Err(GatewayError::NoGatewayFound)
    }

    /// Protocol this handle speaks
    pub fn protocol(&self) -> GatewayProtocol {
        match self {
            Self::Upnp(_) => GatewayProtocol::Upnp,
            Self::NatPmp(_) => GatewayProtocol::NatPmp,
        }
    }

    /// Lifecycle state of the discovery cache
    pub fn state(&self) -> SessionState {
        match self {
            Self::Upnp(g) => g.state(),
            Self::NatPmp(g) => g.state(),
        }
    }

    /// Number of discovery attempts this handle has made
    pub fn discoveries(&self) -> u64 {
        match self {
            Self::Upnp(g) => g.discoveries(),
            Self::NatPmp(g) => g.discoveries(),
        }
    }

    /// Local address used to reach the gateway
    pub async fn internal_ip(&self) -> Option<Ipv4Addr> {
        match self {
            Self::Upnp(g) => g.internal_ip().await,
            Self::NatPmp(g) => g.internal_ip().await,
        }
    }
}

impl GatewayControl for Gateway {
    async fn external_ip(&self) -> Result<Ipv4Addr> {
        match self {
            Self::Upnp(g) => g.external_ip().await,
            Self::NatPmp(g) => g.external_ip().await,
        }
    }

    async fn add_port_mapping(
        &self,
        protocol: Protocol,
        internal_ip: Ipv4Addr,
        internal_port: i32,
        external_port: i32,
        lease: Duration,
    ) -> Result<()> {
        match self {
            Self::Upnp(g) => {
                g.add_port_mapping(protocol, internal_ip, internal_port, external_port, lease)
                    .await
            }
            Self::NatPmp(g) => {
                g.add_port_mapping(protocol, internal_ip, internal_port, external_port, lease)
                    .await
            }
        }
    }

    async fn remove_port_mapping(&self, protocol: Protocol, external_port: i32) -> Result<()> {
        match self {
            Self::Upnp(g) => g.remove_port_mapping(protocol, external_port).await,
            Self::NatPmp(g) => g.remove_port_mapping(protocol, external_port).await,
        }
    }

    async fn close(&self) -> Result<()> {
        match self {
            Self::Upnp(g) => g.close().await,
            Self::NatPmp(g) => g.close().await,
        }
    }
}

/// Discover a gateway with the default configuration
pub async fn new_gateway_control() -> Result<Gateway> {
    Gateway::discover(&GatewayConfig::default()).await
}
