//! SOAP envelopes for the WAN connection service actions

use crate::gateway::types::{GatewayError, Protocol, Result};
use std::fmt;
use std::net::Ipv4Addr;
use xmltree::{Element, XMLNode};

/// UPnP error code for an `AddPortMapping` lease the router won't accept
pub(crate) const ONLY_PERMANENT_LEASES_SUPPORTED: u16 = 725;

/// UPnP error codes that mean "this mapping request is refused"
///
/// 402 InvalidArgs, 606 ActionNotAuthorized, 714 NoSuchEntryInArray,
/// 715/716 wildcard not permitted, 718 ConflictInMappingEntry,
/// 724 SamePortValuesRequired, 725 OnlyPermanentLeasesSupported,
/// 726/727 wildcard only, 728 NoPortMapsAvailable,
/// 729 ConflictWithOtherMechanisms, 732 WildCardNotPermittedInIntPort.
const REJECTION_CODES: &[u16] = &[402, 606, 714, 715, 716, 718, 724, 725, 726, 727, 728, 729, 732];

/// A control action on a WANIPConnection service
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action<'a> {
    GetExternalIpAddress,
    AddPortMapping {
        protocol: Protocol,
        external_port: u16,
        internal_client: Ipv4Addr,
        internal_port: u16,
        lease_secs: u32,
        description: &'a str,
    },
    DeletePortMapping {
        protocol: Protocol,
        external_port: u16,
    },
}

impl Action<'_> {
    /// Action name as used in the SOAPAction header and body element
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::GetExternalIpAddress => "GetExternalIPAddress",
            Self::AddPortMapping { .. } => "AddPortMapping",
            Self::DeletePortMapping { .. } => "DeletePortMapping",
        }
    }

    /// Value of the `SOAPAction` header
    pub(crate) fn soap_action(&self, service_type: &str) -> String {
        format!("\"{}#{}\"", service_type, self.name())
    }

    /// SOAP request body
    pub(crate) fn envelope(&self, service_type: &str) -> String {
        let arguments = match self {
            Self::GetExternalIpAddress => String::new(),
            Self::AddPortMapping {
                protocol,
                external_port,
                internal_client,
                internal_port,
                lease_secs,
                description,
            } => format!(
                "<NewRemoteHost></NewRemoteHost>\
                 <NewExternalPort>{}</NewExternalPort>\
                 <NewProtocol>{}</NewProtocol>\
                 <NewInternalPort>{}</NewInternalPort>\
                 <NewInternalClient>{}</NewInternalClient>\
                 <NewEnabled>1</NewEnabled>\
                 <NewPortMappingDescription>{}</NewPortMappingDescription>\
                 <NewLeaseDuration>{}</NewLeaseDuration>",
                external_port,
                protocol.as_str(),
                internal_port,
                internal_client,
                escape(description),
                lease_secs
            ),
            Self::DeletePortMapping {
                protocol,
                external_port,
            } => format!(
                "<NewRemoteHost></NewRemoteHost>\
                 <NewExternalPort>{}</NewExternalPort>\
                 <NewProtocol>{}</NewProtocol>",
                external_port,
                protocol.as_str()
            ),
        };

        format!(
            "<?xml version=\"1.0\"?>\r\n\
             <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
             s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
             <s:Body><u:{name} xmlns:u=\"{service}\">{arguments}</u:{name}></s:Body>\
             </s:Envelope>\r\n",
            name = self.name(),
            service = escape(service_type),
            arguments = arguments
        )
    }
}

/// A UPnP error returned inside a SOAP fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapFault {
    /// UPnP error code (`errorCode`)
    pub code: u16,
    /// Error description (`errorDescription`)
    pub description: String,
}

impl SoapFault {
    /// Whether the gateway refused the request itself, as opposed to failing
    pub fn is_mapping_rejection(&self) -> bool {
        REJECTION_CODES.contains(&self.code)
    }
}

impl fmt::Display for SoapFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UPnP error {}: {}", self.code, self.description)
    }
}

impl From<SoapFault> for GatewayError {
    fn from(fault: SoapFault) -> Self {
        if fault.is_mapping_rejection() {
            GatewayError::MappingRejected(fault.to_string())
        } else {
            GatewayError::Fault {
                code: fault.code,
                description: fault.description,
            }
        }
    }
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn soap_body(xml: &str) -> Result<Element> {
    let root = Element::parse(xml.as_bytes())
        .map_err(|e| GatewayError::Parse(format!("SOAP response: {}", e)))?;
    if root.name != "Envelope" {
        return Err(GatewayError::Parse(format!(
            "expected SOAP Envelope, found {}",
            root.name
        )));
    }
    root.get_child("Body")
        .cloned()
        .ok_or_else(|| GatewayError::Parse("SOAP envelope has no Body".to_string()))
}

fn first_child_element(parent: &Element) -> Option<&Element> {
    parent.children.iter().find_map(|child| match child {
        XMLNode::Element(e) => Some(e),
        _ => None,
    })
}

/// Parse the body of a successful response to `action`
///
/// Returns the `<{action}Response>` element.
pub(crate) fn parse_action_response(xml: &str, action: &Action<'_>) -> Result<Element> {
    let body = soap_body(xml)?;
    let expected = format!("{}Response", action.name());

    match first_child_element(&body) {
        Some(response) if response.name == expected => Ok(response.clone()),
        Some(other) => Err(GatewayError::Parse(format!(
            "expected {}, found {}",
            expected, other.name
        ))),
        None => Err(GatewayError::Parse(format!("empty SOAP body, expected {}", expected))),
    }
}

/// Extract `NewExternalIPAddress` from a `GetExternalIPAddress` response
pub(crate) fn parse_external_ip(xml: &str) -> Result<Ipv4Addr> {
    let response = parse_action_response(xml, &Action::GetExternalIpAddress)?;
    let text = response
        .get_child("NewExternalIPAddress")
        .and_then(|e| e.get_text())
        .ok_or_else(|| GatewayError::Parse("gateway reported no external address".to_string()))?;

    text.trim()
        .parse()
        .map_err(|e| GatewayError::Parse(format!("invalid external address {:?}: {}", text, e)))
}

/// Extract the UPnP error from a SOAP fault body
pub(crate) fn parse_fault(xml: &str) -> Option<SoapFault> {
    let body = soap_body(xml).ok()?;
    let fault = body.get_child("Fault")?;

    let upnp_error = fault
        .get_child("detail")
        .and_then(|d| d.get_child("UPnPError"));

    let code = upnp_error
        .and_then(|e| e.get_child("errorCode"))
        .and_then(|c| c.get_text())
        .and_then(|c| c.trim().parse().ok())?;

    let description = upnp_error
        .and_then(|e| e.get_child("errorDescription"))
        .and_then(|d| d.get_text())
        .or_else(|| fault.get_child("faultstring").and_then(|s| s.get_text()))
        .map(|d| d.trim().to_string())
        .unwrap_or_default();

    Some(SoapFault { code, description })
}
