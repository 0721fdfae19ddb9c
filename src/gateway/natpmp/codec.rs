//! NAT-PMP wire format (RFC 6886)
//!
//! Requests and responses are fixed-size big-endian frames:
//!
//! ```text
//! external address request:  version(1) opcode(1)
//! map request:               version(1) opcode(1) reserved(2) internal(2) external(2) lifetime(4)
//! external address response: version(1) opcode(1) result(2) epoch(4) address(4)
//! map response:              version(1) opcode(1) result(2) epoch(4) internal(2) external(2) lifetime(4)
//! ```

use crate::gateway::types::{GatewayError, Protocol};
use std::net::Ipv4Addr;
use thiserror::Error;

/// NAT-PMP server port (IANA assigned)
pub const NATPMP_SERVER_PORT: u16 = 5351;

/// NAT-PMP protocol version
pub(crate) const NATPMP_VERSION: u8 = 0;

/// Bit set in the opcode of every server response
pub(crate) const RESPONSE_INDICATOR: u8 = 0x80;

/// Length of an external address response
pub(crate) const EXTERNAL_ADDRESS_RESPONSE_LEN: usize = 12;

/// Length of a map response
pub(crate) const MAP_RESPONSE_LEN: usize = 16;

/// NAT-PMP opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Opcode {
    /// External address request
    ExternalAddress = 0,
    /// UDP port mapping
    MapUdp = 1,
    /// TCP port mapping
    MapTcp = 2,
}

impl Opcode {
    fn from_u8(opcode: u8) -> Option<Self> {
        match opcode {
            0 => Some(Self::ExternalAddress),
            1 => Some(Self::MapUdp),
            2 => Some(Self::MapTcp),
            _ => None,
        }
    }

    fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Udp => Self::MapUdp,
            Protocol::Tcp => Self::MapTcp,
        }
    }
}

/// NAT-PMP result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub(crate) enum ResultCode {
    Success = 0,
    UnsupportedVersion = 1,
    NotAuthorized = 2,
    NetworkFailure = 3,
    OutOfResources = 4,
    UnsupportedOpcode = 5,
}

impl ResultCode {
    pub(crate) fn from_u16(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::UnsupportedVersion),
            2 => Some(Self::NotAuthorized),
            3 => Some(Self::NetworkFailure),
            4 => Some(Self::OutOfResources),
            5 => Some(Self::UnsupportedOpcode),
            _ => None,
        }
    }

    pub(crate) fn to_error_message(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::UnsupportedVersion => "Unsupported NAT-PMP version",
            Self::NotAuthorized => "Not authorized/refused",
            Self::NetworkFailure => "Network failure",
            Self::OutOfResources => "Out of resources",
            Self::UnsupportedOpcode => "Unsupported opcode",
        }
    }
}

/// A NAT-PMP client request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Request {
    /// Ask for the gateway's external address
    ExternalAddress,
    /// Create, renew or (with `lifetime_secs == 0`) delete a mapping
    Map {
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        lifetime_secs: u32,
    },
}

impl Request {
    pub(crate) fn opcode(&self) -> Opcode {
        match self {
            Self::ExternalAddress => Opcode::ExternalAddress,
            Self::Map { protocol, .. } => Opcode::for_protocol(*protocol),
        }
    }

    /// Encode the request frame
    pub(crate) fn encode(&self) -> Vec<u8> {
        match self {
            Self::ExternalAddress => vec![NATPMP_VERSION, Opcode::ExternalAddress as u8],
            Self::Map {
                internal_port,
                external_port,
                lifetime_secs,
                ..
            } => {
                let mut request = Vec::with_capacity(12);
                request.push(NATPMP_VERSION);
                request.push(self.opcode() as u8);
                // Reserved, must be zero
                request.extend_from_slice(&[0u8; 2]);
                request.extend_from_slice(&internal_port.to_be_bytes());
                request.extend_from_slice(&external_port.to_be_bytes());
                request.extend_from_slice(&lifetime_secs.to_be_bytes());
                request
            }
        }
    }
}

/// A successful NAT-PMP response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Response {
    ExternalAddress {
        epoch_secs: u32,
        external_ip: Ipv4Addr,
    },
    Map {
        protocol: Protocol,
        epoch_secs: u32,
        internal_port: u16,
        external_port: u16,
        lifetime_secs: u32,
    },
}

impl Response {
    /// Opcode of the request this response answers
    pub(crate) fn opcode(&self) -> Opcode {
        match self {
            Self::ExternalAddress { .. } => Opcode::ExternalAddress,
            Self::Map { protocol, .. } => Opcode::for_protocol(*protocol),
        }
    }

    /// Decode a response frame
    pub(crate) fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < 4 {
            return Err(DecodeError::TooShort(buf.len()));
        }

        if buf[0] != NATPMP_VERSION {
            return Err(DecodeError::InvalidVersion(buf[0]));
        }

        if buf[1] & RESPONSE_INDICATOR == 0 {
            return Err(DecodeError::NotAResponse);
        }
        let opcode = Opcode::from_u8(buf[1] & !RESPONSE_INDICATOR)
            .ok_or(DecodeError::UnknownOpcode(buf[1]))?;

        let code = u16::from_be_bytes([buf[2], buf[3]]);
        let result = ResultCode::from_u16(code).ok_or(DecodeError::UnknownResultCode(code))?;
        if result != ResultCode::Success {
            return Err(DecodeError::Refused(result));
        }

        let expected = match opcode {
            Opcode::ExternalAddress => EXTERNAL_ADDRESS_RESPONSE_LEN,
            Opcode::MapUdp | Opcode::MapTcp => MAP_RESPONSE_LEN,
        };
        if buf.len() < expected {
            return Err(DecodeError::TooShort(buf.len()));
        }

        let epoch_secs = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        let response = match opcode {
            Opcode::ExternalAddress => Self::ExternalAddress {
                epoch_secs,
                external_ip: Ipv4Addr::new(buf[8], buf[9], buf[10], buf[11]),
            },
            Opcode::MapUdp | Opcode::MapTcp => Self::Map {
                protocol: if opcode == Opcode::MapUdp {
                    Protocol::Udp
                } else {
                    Protocol::Tcp
                },
                epoch_secs,
                internal_port: u16::from_be_bytes([buf[8], buf[9]]),
                external_port: u16::from_be_bytes([buf[10], buf[11]]),
                lifetime_secs: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            },
        };

        Ok(response)
    }
}

/// Errors produced while decoding a response frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum DecodeError {
    #[error("Response too short: {0} bytes")]
    TooShort(usize),
    #[error("Invalid version: {0} (expected 0)")]
    InvalidVersion(u8),
    #[error("Received request instead of response")]
    NotAResponse,
    #[error("Unknown opcode: {0}")]
    UnknownOpcode(u8),
    #[error("Unknown result code: {0}")]
    UnknownResultCode(u16),
    #[error("{}", .0.to_error_message())]
    Refused(ResultCode),
}

impl From<DecodeError> for GatewayError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Refused(ResultCode::NotAuthorized | ResultCode::OutOfResources) => {
                GatewayError::MappingRejected(err.to_string())
            }
            // The gateway answered, so the cached endpoint is still good
            DecodeError::Refused(code) => GatewayError::Fault {
                code: code as u16,
                description: code.to_error_message().to_string(),
            },
            _ => GatewayError::Parse(err.to_string()),
        }
    }
}
