// Loopback stand-ins for home routers: a NAT-PMP server, an SSDP responder
// and a UPnP IGD speaking HTTP/SOAP.

use crate::config::GatewayConfig;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use xmltree::{Element, XMLNode};

pub const EXTERNAL_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);
pub const LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Config pointing both backends at nothing, with short timeouts
pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        ssdp_search_window_ms: 300,
        http_timeout_ms: 1000,
        natpmp_initial_timeout_ms: 20,
        natpmp_max_attempts: 3,
        ..GatewayConfig::default()
    }
}

// ========================================================================
// NAT-PMP
// ========================================================================

/// How the mock NAT-PMP server answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatPmpBehavior {
    /// Answer every request
    Normal,
    /// Drop everything
    Silent,
    /// Map `external + 1` instead of the requested port
    Mismatch,
    /// Answer map requests with this result code
    Refuse(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    pub opcode: u8,
    pub internal_port: u16,
    pub external_port: u16,
    pub lifetime_secs: u32,
}

pub struct NatPmpState {
    pub behavior: Mutex<NatPmpBehavior>,
    /// Requests to ignore before answering
    pub drop_first: AtomicUsize,
    pub received: AtomicUsize,
    pub maps: Mutex<Vec<MapRequest>>,
}

pub struct MockNatPmp {
    pub addr: SocketAddr,
    pub state: Arc<NatPmpState>,
    task: JoinHandle<()>,
}

impl MockNatPmp {
    pub async fn start(behavior: NatPmpBehavior) -> Self {
        let socket = UdpSocket::bind((LOOPBACK, 0)).await.unwrap();
        let addr = socket.local_addr().unwrap();
        let state = Arc::new(NatPmpState {
            behavior: Mutex::new(behavior),
            drop_first: AtomicUsize::new(0),
            received: AtomicUsize::new(0),
            maps: Mutex::new(Vec::new()),
        });

        let shared = state.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                shared.received.fetch_add(1, Ordering::SeqCst);
                if let Some(reply) = shared.answer(&buf[..len]) {
                    let _ = socket.send_to(&reply, from).await;
                }
            }
        });

        Self { addr, state, task }
    }

    pub fn config(&self) -> GatewayConfig {
        GatewayConfig {
            natpmp_gateway: Some(LOOPBACK),
            natpmp_port: self.addr.port(),
            ..test_config()
        }
    }

    pub fn set_behavior(&self, behavior: NatPmpBehavior) {
        *self.state.behavior.lock().unwrap() = behavior;
    }

    pub fn received(&self) -> usize {
        self.state.received.load(Ordering::SeqCst)
    }

    pub fn maps(&self) -> Vec<MapRequest> {
        self.state.maps.lock().unwrap().clone()
    }
}

impl Drop for MockNatPmp {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl NatPmpState {
    fn answer(&self, request: &[u8]) -> Option<Vec<u8>> {
        let behavior = *self.behavior.lock().unwrap();
        if behavior == NatPmpBehavior::Silent {
            return None;
        }
        let pending = self.drop_first.load(Ordering::SeqCst);
        if pending > 0 {
            self.drop_first.store(pending - 1, Ordering::SeqCst);
            return None;
        }

        let opcode = *request.get(1)?;
        let mut reply = vec![0u8, 0x80 | opcode];
        match opcode {
            0 => {
                reply.extend_from_slice(&0u16.to_be_bytes());
                reply.extend_from_slice(&1234u32.to_be_bytes());
                reply.extend_from_slice(&EXTERNAL_IP.octets());
            }
            1 | 2 if request.len() >= 12 => {
                let map = MapRequest {
                    opcode,
                    internal_port: u16::from_be_bytes([request[4], request[5]]),
                    external_port: u16::from_be_bytes([request[6], request[7]]),
                    lifetime_secs: u32::from_be_bytes([request[8], request[9], request[10], request[11]]),
                };
                self.maps.lock().unwrap().push(map);

                let (code, external_port) = match behavior {
                    NatPmpBehavior::Refuse(code) => (code, map.external_port),
                    NatPmpBehavior::Mismatch if map.lifetime_secs != 0 => {
                        (0, map.external_port.wrapping_add(1))
                    }
                    _ => (0, map.external_port),
                };
                reply.extend_from_slice(&code.to_be_bytes());
                reply.extend_from_slice(&1234u32.to_be_bytes());
                reply.extend_from_slice(&map.internal_port.to_be_bytes());
                reply.extend_from_slice(&external_port.to_be_bytes());
                reply.extend_from_slice(&map.lifetime_secs.min(7200).to_be_bytes());
            }
            _ => return None,
        }
        Some(reply)
    }
}

// ========================================================================
// UPnP IGD (HTTP + SOAP)
// ========================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgdMapping {
    pub internal_client: Ipv4Addr,
    pub internal_port: u16,
    pub description: String,
}

#[derive(Default)]
pub struct IgdState {
    pub mappings: Mutex<HashMap<(String, u16), IgdMapping>>,
    /// Lease of every AddPortMapping request, in arrival order
    pub leases: Mutex<Vec<u32>>,
    /// Reject non-zero leases with fault 725
    pub permanent_only: Mutex<bool>,
    /// Fail AddPortMapping with this fault code
    pub add_fault: Mutex<Option<u16>>,
    pub description_fetches: AtomicUsize,
    pub soap_calls: AtomicUsize,
}

impl IgdState {
    pub fn leases(&self) -> Vec<u32> {
        self.leases.lock().unwrap().clone()
    }

    pub fn has_mapping(&self, protocol: &str, external_port: u16) -> bool {
        self.mappings
            .lock()
            .unwrap()
            .contains_key(&(protocol.to_string(), external_port))
    }
}

pub struct MockIgd {
    pub addr: SocketAddr,
    pub state: Arc<IgdState>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

const SERVICE_TYPE: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";

impl MockIgd {
    pub async fn start() -> Self {
        let listener = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(IgdState::default());
        let tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let shared = state.clone();
        let connections = tasks.clone();
        let accept = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let io = TokioIo::new(stream);
                let state = shared.clone();
                let connection = tokio::spawn(async move {
                    let service = service_fn(move |req| handle_igd_request(req, state.clone()));
                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
                connections.lock().unwrap().push(connection);
            }
        });
        tasks.lock().unwrap().push(accept);

        Self { addr, state, tasks }
    }

    pub fn location(&self) -> String {
        format!("http://{}/rootDesc.xml", self.addr)
    }

    /// Stop accepting and drop every open connection
    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for MockIgd {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub fn device_description(control_url: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:1</deviceType>
    <friendlyName>Mock Router</friendlyName>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:Layer3Forwarding:1</serviceType>
        <controlURL>/ctl/L3F</controlURL>
      </service>
    </serviceList>
    <deviceList>
      <device>
        <deviceType>urn:schemas-upnp-org:device:WANDevice:1</deviceType>
        <deviceList>
          <device>
            <deviceType>urn:schemas-upnp-org:device:WANConnectionDevice:1</deviceType>
            <serviceList>
              <service>
                <serviceType>{}</serviceType>
                <controlURL>{}</controlURL>
              </service>
            </serviceList>
          </device>
        </deviceList>
      </device>
    </deviceList>
  </device>
</root>"#,
        SERVICE_TYPE, control_url
    )
}

pub fn soap_response(action: &str, arguments: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body><u:{action}Response xmlns:u="{service}">{arguments}</u:{action}Response></s:Body>
</s:Envelope>"#,
        action = action,
        service = SERVICE_TYPE,
        arguments = arguments
    )
}

pub fn soap_fault(code: u16, description: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body><s:Fault><faultcode>s:Client</faultcode><faultstring>UPnPError</faultstring>
<detail><UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
<errorCode>{}</errorCode><errorDescription>{}</errorDescription>
</UPnPError></detail></s:Fault></s:Body>
</s:Envelope>"#,
        code, description
    )
}

fn xml_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/xml; charset=\"utf-8\"")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn argument(action: &Element, name: &str) -> String {
    action
        .get_child(name)
        .and_then(|e| e.get_text())
        .map(|t| t.trim().to_string())
        .unwrap_or_default()
}

async fn handle_igd_request(
    req: Request<Incoming>,
    state: Arc<IgdState>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/rootDesc.xml") => {
            state.description_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(xml_response(StatusCode::OK, device_description("/ctl/IPConn")))
        }
        (&Method::POST, "/ctl/IPConn") => {
            state.soap_calls.fetch_add(1, Ordering::SeqCst);
            let soap_action = req
                .headers()
                .get("SOAPAction")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .trim_matches('"')
                .to_string();
            let body = req.into_body().collect().await?.to_bytes();
            let envelope = Element::parse(body.as_ref()).unwrap();
            let action = envelope
                .get_child("Body")
                .and_then(|b| {
                    b.children.iter().find_map(|c| match c {
                        XMLNode::Element(e) => Some(e),
                        _ => None,
                    })
                })
                .unwrap()
                .clone();

            Ok(match soap_action.rsplit('#').next().unwrap_or_default() {
                "GetExternalIPAddress" => xml_response(
                    StatusCode::OK,
                    soap_response(
                        "GetExternalIPAddress",
                        &format!("<NewExternalIPAddress>{}</NewExternalIPAddress>", EXTERNAL_IP),
                    ),
                ),
                "AddPortMapping" => add_port_mapping(&state, &action),
                "DeletePortMapping" => {
                    let external_port: u16 = argument(&action, "NewExternalPort").parse().unwrap_or(0);
                    let key = (argument(&action, "NewProtocol"), external_port);
                    if state.mappings.lock().unwrap().remove(&key).is_some() {
                        xml_response(StatusCode::OK, soap_response("DeletePortMapping", ""))
                    } else {
                        xml_response(StatusCode::INTERNAL_SERVER_ERROR, soap_fault(714, "NoSuchEntryInArray"))
                    }
                }
                _ => xml_response(StatusCode::INTERNAL_SERVER_ERROR, soap_fault(401, "Invalid Action")),
            })
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .unwrap()),
    }
}

fn add_port_mapping(state: &IgdState, action: &Element) -> Response<Full<Bytes>> {
    let external_port: u16 = argument(action, "NewExternalPort").parse().unwrap_or(0);
    let lease: u32 = argument(action, "NewLeaseDuration").parse().unwrap_or(0);
    state.leases.lock().unwrap().push(lease);

    if let Some(code) = *state.add_fault.lock().unwrap() {
        return xml_response(StatusCode::INTERNAL_SERVER_ERROR, soap_fault(code, "ActionFailed"));
    }
    if external_port == 0 {
        return xml_response(StatusCode::INTERNAL_SERVER_ERROR, soap_fault(716, "WildCardNotPermittedInExtPort"));
    }
    if lease != 0 && *state.permanent_only.lock().unwrap() {
        return xml_response(StatusCode::INTERNAL_SERVER_ERROR, soap_fault(725, "OnlyPermanentLeasesSupported"));
    }

    let mapping = IgdMapping {
        internal_client: argument(action, "NewInternalClient").parse().unwrap_or(Ipv4Addr::UNSPECIFIED),
        internal_port: argument(action, "NewInternalPort").parse().unwrap_or(0),
        description: argument(action, "NewPortMappingDescription"),
    };
    let key = (argument(action, "NewProtocol"), external_port);

    let mut mappings = state.mappings.lock().unwrap();
    if let Some(existing) = mappings.get(&key) {
        if existing.internal_client != mapping.internal_client {
            return xml_response(StatusCode::INTERNAL_SERVER_ERROR, soap_fault(718, "ConflictInMappingEntry"));
        }
    }
    mappings.insert(key, mapping);
    xml_response(StatusCode::OK, soap_response("AddPortMapping", ""))
}

// ========================================================================
// SSDP
// ========================================================================

pub struct MockSsdp {
    pub addr: SocketAddr,
    /// Advertised LOCATION; `None` keeps the responder quiet
    pub location: Arc<Mutex<Option<String>>>,
    pub searches: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockSsdp {
    pub async fn start(location: Option<String>) -> Self {
        let socket = UdpSocket::bind((LOOPBACK, 0)).await.unwrap();
        let addr = socket.local_addr().unwrap();
        let location = Arc::new(Mutex::new(location));
        let searches = Arc::new(AtomicUsize::new(0));

        let advertised = location.clone();
        let counter = searches.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let request = String::from_utf8_lossy(&buf[..len]).to_string();
                if !request.starts_with("M-SEARCH") {
                    continue;
                }
                counter.fetch_add(1, Ordering::SeqCst);

                let target = request
                    .lines()
                    .find_map(|l| l.strip_prefix("ST: "))
                    .unwrap_or("ssdp:all")
                    .to_string();
                let Some(location) = advertised.lock().unwrap().clone() else {
                    continue;
                };
                let reply = format!(
                    "HTTP/1.1 200 OK\r\n\
                     CACHE-CONTROL: max-age=120\r\n\
                     ST: {}\r\n\
                     USN: uuid:mock-igd::{}\r\n\
                     EXT:\r\n\
                     SERVER: Mock/1.0 UPnP/1.1 MockIGD/1.0\r\n\
                     LOCATION: {}\r\n\r\n",
                    target, target, location
                );
                let _ = socket.send_to(reply.as_bytes(), from).await;
            }
        });

        Self {
            addr,
            location,
            searches,
            task,
        }
    }

    pub fn config(&self) -> GatewayConfig {
        GatewayConfig {
            ssdp_addr: self.addr,
            ..test_config()
        }
    }

    pub fn advertise(&self, location: Option<String>) {
        *self.location.lock().unwrap() = location;
    }

    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

impl Drop for MockSsdp {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A running IGD plus the SSDP responder advertising it
pub async fn start_upnp() -> (MockIgd, MockSsdp) {
    let igd = MockIgd::start().await;
    let ssdp = MockSsdp::start(Some(igd.location())).await;
    (igd, ssdp)
}
