//! NAT-PMP (NAT Port Mapping Protocol) backend - RFC 6886
//!
//! NAT-PMP is supported by older routers, particularly Apple AirPort devices
//! and some Cisco routers. The gateway's address comes from the routing table
//! and all requests go over UDP to port 5351.
//!
//! # Surprising contract
//!
//! NAT-PMP routers may map a different external port than the one requested.
//! When that happens the mapping the router created is removed again and the
//! call fails with [`GatewayError::MappingRejected`]: a port is never
//! substituted silently.

pub mod codec;

pub use codec::NATPMP_SERVER_PORT;

use self::codec::{DecodeError, Request, Response};
use super::control::GatewayControl;
use super::route::{find_default_gateway, local_ip_for};
use super::session::{Session, SessionCache, SessionState};
use super::types::{removal_port, GatewayError, PortMapping, Protocol, Result};
use crate::config::GatewayConfig;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// NAT-PMP gateway handle
pub struct NatPmpGateway {
    gateway_override: Option<Ipv4Addr>,
    port: u16,
    initial_timeout: Duration,
    max_attempts: u32,
    session: Session<SocketAddrV4>,
    /// Internal ports of mappings created through this handle, keyed by
    /// (protocol, external port); deletions are keyed by internal port on the wire
    internal_ports: Mutex<HashMap<(Protocol, u16), u16>>,
    closed: AtomicBool,
}

impl NatPmpGateway {
    /// Create an undiscovered handle; discovery runs on first use
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            gateway_override: config.natpmp_gateway,
            port: config.natpmp_port,
            initial_timeout: config.natpmp_initial_timeout(),
            max_attempts: config.natpmp_max_attempts.max(1),
            session: Session::new(),
            internal_ports: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
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

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::Closed);
        }
        Ok(())
    }

    async fn discover(&self) -> Result<SessionCache<SocketAddrV4>> {
        let gateway_ip = match self.gateway_override {
            Some(ip) => ip,
            None => find_default_gateway().await?,
        };
        let gateway = SocketAddrV4::new(gateway_ip, self.port);
        debug!("Using NAT-PMP gateway {}", gateway);

        let external_ip = self.query_external_ip(gateway).await?;
        let internal_ip = match local_ip_for(gateway_ip).await {
            Ok(ip) => Some(ip),
            Err(e) => {
                debug!("Could not determine local address towards {}: {}", gateway_ip, e);
                None
            }
        };

        info!("NAT-PMP gateway {} reports external address {}", gateway, external_ip);
        Ok(SessionCache {
            endpoint: gateway,
            internal_ip,
            external_ip: Some(external_ip),
        })
    }

    async fn query_external_ip(&self, gateway: SocketAddrV4) -> Result<Ipv4Addr> {
        match self.exchange(gateway, Request::ExternalAddress).await? {
            Response::ExternalAddress {
                epoch_secs,
                external_ip,
            } => {
                debug!("External address {} (gateway epoch {}s)", external_ip, epoch_secs);
                Ok(external_ip)
            }
            other => Err(GatewayError::Parse(format!(
                "unexpected response to external address request: {:?}",
                other
            ))),
        }
    }

    /// Send `request` and wait for the matching response
    ///
    /// The timeout starts at the configured initial value and doubles after
    /// every unanswered transmission.
    async fn exchange(&self, gateway: SocketAddrV4, request: Request) -> Result<Response> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(SocketAddr::V4(gateway)).await?;

        let frame = request.encode();
        let mut wait = self.initial_timeout;
        let mut buf = [0u8; 64];

        for attempt in 1..=self.max_attempts {
            socket.send(&frame).await.map_err(|e| {
                GatewayError::GatewayUnreachable(format!("send to {} failed: {}", gateway, e))
            })?;
            debug!(
                "Sent NAT-PMP {:?} request to {} (attempt {}/{}, waiting {:?})",
                request.opcode(),
                gateway,
                attempt,
                self.max_attempts,
                wait
            );

            let deadline = tokio::time::Instant::now() + wait;
            loop {
                let received = match tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await {
                    Ok(received) => received,
                    Err(_) => break,
                };
                let len = received.map_err(|e| {
                    GatewayError::GatewayUnreachable(format!("receive from {} failed: {}", gateway, e))
                })?;

                match Response::decode(&buf[..len]) {
                    Ok(response) if response.opcode() == request.opcode() => return Ok(response),
                    Ok(response) => {
                        debug!("Ignoring NAT-PMP response for {:?}", response.opcode());
                    }
                    Err(DecodeError::Refused(code)) => {
                        warn!("NAT-PMP gateway {} refused request: {}", gateway, code.to_error_message());
                        return Err(DecodeError::Refused(code).into());
                    }
                    Err(e) => {
                        warn!("Malformed NAT-PMP response from {}: {}", gateway, e);
                        return Err(e.into());
                    }
                }
            }

            wait *= 2;
        }

        Err(GatewayError::GatewayUnreachable(format!(
            "no NAT-PMP response from {} after {} attempts",
            gateway, self.max_attempts
        )))
    }

    async fn map(
        &self,
        gateway: SocketAddrV4,
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        lifetime_secs: u32,
    ) -> Result<(u16, u32)> {
        let request = Request::Map {
            protocol,
            internal_port,
            external_port,
            lifetime_secs,
        };

        match self.exchange(gateway, request).await? {
            Response::Map {
                internal_port: mapped_internal,
                external_port: mapped_external,
                lifetime_secs: granted,
                epoch_secs,
                ..
            } => {
                debug!(
                    "NAT-PMP mapped {} {} -> {} for {}s (gateway epoch {}s)",
                    protocol, mapped_external, mapped_internal, granted, epoch_secs
                );
                Ok((mapped_external, granted))
            }
            other => Err(GatewayError::Parse(format!(
                "unexpected response to map request: {:?}",
                other
            ))),
        }
    }

    /// Delete the mapping for `internal_port`
    ///
    /// RFC 6886 section 3.4: a deletion carries a zero lifetime and a zero
    /// suggested external port; the router finds the mapping by internal port.
    async fn unmap(&self, gateway: SocketAddrV4, protocol: Protocol, internal_port: u16) -> Result<()> {
        self.map(gateway, protocol, internal_port, 0, 0).await?;
        Ok(())
    }
}

impl GatewayControl for NatPmpGateway {
    async fn external_ip(&self) -> Result<Ipv4Addr> {
        self.ensure_open()?;

        self.session
            .run(
                || self.discover(),
                |acquired| async move {
                    if acquired.discovered {
                        if let Some(ip) = acquired.cache.external_ip {
                            return Ok(ip);
                        }
                    }
                    let gateway = acquired.cache.endpoint;
                    let ip = self.query_external_ip(gateway).await?;
                    self.session.record_external_ip(&gateway, ip).await;
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
        self.ensure_open()?;
        let mapping = PortMapping::new(protocol, internal_ip, internal_port, external_port, lease)?;
        let (internal_port, external_port) = (mapping.internal_port, mapping.external_port);
        // 0 on the wire deletes the mapping, so "indefinite" is the largest lease
        let lifetime_secs = match mapping.lease_secs {
            0 => u32::MAX,
            secs => secs,
        };

        info!(
            "Adding NAT-PMP mapping {} {} -> {}:{} (lifetime: {}s)",
            protocol, external_port, internal_ip, internal_port, lifetime_secs
        );

        self.session
            .run(
                || self.discover(),
                |acquired| async move {
                    let gateway = acquired.cache.endpoint;
                    let (mapped_port, _) = self
                        .map(gateway, protocol, internal_port, external_port, lifetime_secs)
                        .await?;

                    if mapped_port != external_port {
                        warn!(
                            "NAT-PMP gateway mapped port {} instead of {}, removing it",
                            mapped_port, external_port
                        );
                        if let Err(e) = self.unmap(gateway, protocol, internal_port).await {
                            warn!("Failed to remove unwanted mapping {}: {}", mapped_port, e);
                        }
                        return Err(GatewayError::MappingRejected(format!(
                            "gateway mapped port {} instead of requested {}",
                            mapped_port, external_port
                        )));
                    }

                    self.internal_ports
                        .lock()
                        .await
                        .insert((protocol, external_port), internal_port);
                    info!("NAT-PMP mapping {} {} added", protocol, external_port);
                    Ok(())
                },
            )
            .await
    }

    async fn remove_port_mapping(&self, protocol: Protocol, external_port: i32) -> Result<()> {
        self.ensure_open()?;
        let external_port = removal_port(external_port)?;

        // The router ignores the value for mappings it doesn't know; the same
        // port is the usual internal port for mappings created elsewhere
        let internal_port = self
            .internal_ports
            .lock()
            .await
            .get(&(protocol, external_port))
            .copied()
            .unwrap_or(external_port);

        info!("Removing NAT-PMP mapping {} {}", protocol, external_port);

        self.session
            .run(
                || self.discover(),
                |acquired| async move {
                    self.unmap(acquired.cache.endpoint, protocol, internal_port).await
                },
            )
            .await?;

        self.internal_ports.lock().await.remove(&(protocol, external_port));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closing NAT-PMP gateway handle");
            self.session.clear().await;
            self.internal_ports.lock().await.clear();
        }
        Ok(())
    }
}
