//! UPnP IGD (Internet Gateway Device) backend
//!
//! Discovery uses SSDP to find the gateway's device description, which names
//! the control URL of its WAN IP connection service. Control actions are SOAP
//! requests over HTTP to that URL.
//!
//! The control URL is cached. When a request to the cached URL fails at the
//! connection level the cache is dropped and discovery runs once more before
//! the error is returned.

pub mod soap;
pub mod ssdp;

use self::soap::{
    parse_external_ip, parse_fault, Action, SoapFault, ONLY_PERMANENT_LEASES_SUPPORTED,
};
use self::ssdp::ControlPoint;
use super::control::GatewayControl;
use super::route::local_ip_for;
use super::session::{Session, SessionCache, SessionState};
use super::types::{removal_port, GatewayError, PortMapping, Protocol, Result};
use crate::config::{GatewayConfig, ZeroLeasePolicy};
use reqwest::header::CONTENT_TYPE;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// UPnP IGD gateway handle
pub struct UpnpGateway {
    /// Pooled HTTP client; `None` once closed
    client: RwLock<Option<reqwest::Client>>,
    ssdp_addr: SocketAddr,
    search_window: Duration,
    zero_lease_policy: ZeroLeasePolicy,
    description: String,
    session: Session<ControlPoint>,
}

impl UpnpGateway {
    /// Create an undiscovered handle; discovery runs on first use
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        // Gateways live on the local network, never behind a proxy
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .no_proxy()
            .build()
            .map_err(|e| GatewayError::GatewayUnreachable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client: RwLock::new(Some(client)),
            ssdp_addr: config.ssdp_addr,
            search_window: config.ssdp_search_window(),
            zero_lease_policy: config.zero_lease_policy,
            description: config.mapping_description.clone(),
            session: Session::new(),
        })
    }

    /// Lifecycle state of the discovery cache
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Number of discovery attempts so far
    pub fn discoveries(&self) -> u64 {
        self.session.discoveries()
    }

    /// Local address used to reach the gateway, once discovered
    pub async fn internal_ip(&self) -> Option<Ipv4Addr> {
        self.session.snapshot().await.and_then(|c| c.internal_ip)
    }

    /// Control point in use, once discovered
    pub async fn control_point(&self) -> Option<ControlPoint> {
        self.session.snapshot().await.map(|c| c.endpoint)
    }

    async fn client(&self) -> Result<reqwest::Client> {
        self.client.read().await.clone().ok_or(GatewayError::Closed)
    }

    async fn discover(&self) -> Result<SessionCache<ControlPoint>> {
        let client = self.client().await?;
        debug!("Searching for UPnP IGD gateway...");
        let control_point = ssdp::discover(&client, self.ssdp_addr, self.search_window).await?;

        let external_ip = self.query_external_ip(&client, &control_point).await?;

        let gateway_ip: Option<Ipv4Addr> = control_point
            .control_url
            .host_str()
            .and_then(|host| host.parse().ok());
        let internal_ip = match gateway_ip {
            Some(ip) => local_ip_for(ip).await.ok(),
            None => None,
        };

        info!(
            "UPnP gateway {} reports external address {}",
            control_point.control_url, external_ip
        );
        Ok(SessionCache {
            endpoint: control_point,
            internal_ip,
            external_ip: Some(external_ip),
        })
    }

    /// POST one SOAP action
    ///
    /// Transport failures are the outer error; a SOAP fault is returned as
    /// the inner error so callers can react to specific codes.
    async fn invoke(
        &self,
        client: &reqwest::Client,
        control_point: &ControlPoint,
        action: &Action<'_>,
    ) -> Result<std::result::Result<String, SoapFault>> {
        debug!("SOAP {} -> {}", action.name(), control_point.control_url);

        let response = client
            .post(control_point.control_url.clone())
            .header(CONTENT_TYPE, "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", action.soap_action(&control_point.service_type))
            .body(action.envelope(&control_point.service_type))
            .send()
            .await
            .map_err(|e| {
                GatewayError::GatewayUnreachable(format!("{} request failed: {}", action.name(), e))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            GatewayError::GatewayUnreachable(format!("reading {} response: {}", action.name(), e))
        })?;

        if status.is_success() {
            return Ok(Ok(body));
        }

        match parse_fault(&body) {
            Some(fault) => {
                warn!("UPnP {} failed: {}", action.name(), fault);
                Ok(Err(fault))
            }
            None => Err(GatewayError::GatewayUnreachable(format!(
                "{} failed with HTTP {}",
                action.name(),
                status
            ))),
        }
    }

    async fn call(
        &self,
        client: &reqwest::Client,
        control_point: &ControlPoint,
        action: &Action<'_>,
    ) -> Result<String> {
        self.invoke(client, control_point, action)
            .await?
            .map_err(GatewayError::from)
    }

    async fn query_external_ip(
        &self,
        client: &reqwest::Client,
        control_point: &ControlPoint,
    ) -> Result<Ipv4Addr> {
        let body = self
            .call(client, control_point, &Action::GetExternalIpAddress)
            .await?;
        parse_external_ip(&body)
    }

    async fn add_mapping(
        &self,
        control_point: &ControlPoint,
        mapping: &PortMapping,
        lease_secs: u32,
    ) -> Result<()> {
        let client = self.client().await?;
        let action = |lease_secs| Action::AddPortMapping {
            protocol: mapping.protocol,
            external_port: mapping.external_port,
            internal_client: mapping.internal_ip,
            internal_port: mapping.internal_port,
            lease_secs,
            description: &self.description,
        };

        match self.invoke(&client, control_point, &action(lease_secs)).await? {
            Ok(_) => Ok(()),
            Err(fault) if fault.code == ONLY_PERMANENT_LEASES_SUPPORTED && lease_secs != 0 => {
                info!("Gateway only supports permanent leases, retrying with lease 0");
                self.call(&client, control_point, &action(0)).await.map(|_| ())
            }
            Err(fault) => Err(fault.into()),
        }
    }
}

impl GatewayControl for UpnpGateway {
    async fn external_ip(&self) -> Result<Ipv4Addr> {
        self.session
            .run(
                || self.discover(),
                |acquired| async move {
                    if acquired.discovered {
                        if let Some(ip) = acquired.cache.external_ip {
                            return Ok(ip);
                        }
                    }
                    let client = self.client().await?;
                    let control_point = acquired.cache.endpoint;
                    let ip = self.query_external_ip(&client, &control_point).await?;
                    self.session.record_external_ip(&control_point, ip).await;
                    Ok(ip)
                },
            )
            .await
    }

    async fn add_port_mapping(
        &self,
        protocol: Protocol,
        internal_ip: Ipv4Addr,
        internal_port: i32,
        external_port: i32,
        lease: Duration,
    ) -> Result<()> {
        self.client().await?;
        let mapping = PortMapping::new(protocol, internal_ip, internal_port, external_port, lease)?;
        let lease_secs = self.zero_lease_policy.resolve(mapping.lease_secs);

        info!(
            "Adding UPnP mapping {} {} -> {}:{} (lease: {}s)",
            protocol, mapping.external_port, internal_ip, mapping.internal_port, lease_secs
        );

        let mapping = &mapping;
        self.session
            .run(
                || self.discover(),
                |acquired| async move {
                    self.add_mapping(&acquired.cache.endpoint, mapping, lease_secs)
                        .await
                },
            )
            .await?;

        info!("UPnP mapping {} {} added", protocol, mapping.external_port);
        Ok(())
    }

    async fn remove_port_mapping(&self, protocol: Protocol, external_port: i32) -> Result<()> {
        self.client().await?;
        let external_port = removal_port(external_port)?;

        info!("Removing UPnP mapping {} {}", protocol, external_port);

        self.session
            .run(
                || self.discover(),
                |acquired| async move {
                    let client = self.client().await?;
                    let action = Action::DeletePortMapping {
                        protocol,
                        external_port,
                    };
                    self.call(&client, &acquired.cache.endpoint, &action)
                        .await
                        .map(|_| ())
                },
            )
            .await?;

        info!("UPnP mapping {} {} removed", protocol, external_port);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Dropping the client releases its pooled connections
        if self.client.write().await.take().is_some() {
            debug!("Closing UPnP gateway handle");
            self.session.clear().await;
        }
        Ok(())
    }
}
