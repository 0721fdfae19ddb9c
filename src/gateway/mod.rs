//! Gateway control over UPnP IGD and NAT-PMP
//!
//! This module gives one control surface over the two common home-router
//! port-mapping protocols:
//! - UPnP IGD: SSDP discovery and SOAP control actions
//! - NAT-PMP (RFC 6886): binary UDP requests to the default gateway
//!
//! [`Gateway::discover`] picks whichever protocol the local router answers.
//! Both backends cache what discovery learned and rediscover once when the
//! cached endpoint stops responding.

mod control;
pub mod natpmp;
pub(crate) mod route;
mod selector;
pub mod session;
pub(crate) mod types;
pub mod upnp;

pub use control::{with_cancel, with_deadline, GatewayControl};
pub use natpmp::NatPmpGateway;
pub use route::{find_default_gateway, local_ip_for, local_ipv4};
pub use selector::{new_gateway_control, Gateway};
pub use session::SessionState;
pub use types::{GatewayError, GatewayProtocol, PortMapping, Protocol, Result};
pub use upnp::UpnpGateway;
