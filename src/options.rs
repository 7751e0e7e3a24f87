//! Typed options carried in a message's extension region.
//!
//! Each option is a `(code, length, value)` triple. Codes this crate acts on
//! get their own variant; anything else is kept as [`MessageOption::Unknown`]
//! so that decoding stays forward compatible and re-encoding is lossless.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Router and DNS lists share a one-byte length, so 63 addresses at most.
const MAX_ADDRESSES_PER_OPTION: usize = 63;

/// Option codes understood by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    /// Single padding byte, no length.
    Pad = 0,
    /// Subnet mask for the leased address.
    SubnetMask = 1,
    /// Default gateways, in order of preference.
    Router = 3,
    /// DNS resolvers, in order of preference.
    DnsServer = 6,
    /// Address the client asks for in a REQUEST.
    RequestedIpAddress = 50,
    /// Lease duration in seconds.
    LeaseTime = 51,
    /// Negotiation message type, see [`MessageType`].
    MessageType = 53,
    /// Address of the server that made the offer.
    ServerIdentifier = 54,
    /// Terminates the option list.
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::SubnetMask),
            3 => Ok(Self::Router),
            6 => Ok(Self::DnsServer),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::LeaseTime),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

/// Negotiation message types (option 53).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client broadcast looking for an address.
    Discover = 1,
    /// Server proposes an address.
    Offer = 2,
    /// Client asks to bind the offered address.
    Request = 3,
    /// Server confirms the binding.
    Ack = 5,
    /// Server refuses; the client must start over.
    Nak = 6,
    /// Client gives its address back.
    Release = 7,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
        }
    }
}

/// A decoded option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOption {
    /// Option 1.
    SubnetMask(Ipv4Addr),
    /// Option 3. The first entry is the default route.
    Router(Vec<Ipv4Addr>),
    /// Option 6.
    DnsServer(Vec<Ipv4Addr>),
    /// Option 50.
    RequestedIpAddress(Ipv4Addr),
    /// Option 51, in seconds.
    LeaseTime(u32),
    /// Option 53.
    MessageType(MessageType),
    /// Option 54.
    ServerIdentifier(Ipv4Addr),
    /// Any other code, with its raw value.
    Unknown(u8, Vec<u8>),
}

fn address(data: &[u8], what: &str) -> Result<Ipv4Addr> {
    let octets: [u8; 4] = data
        .try_into()
        .map_err(|_| Error::MalformedMessage(format!("Invalid {} length: {}", what, data.len())))?;
    Ok(Ipv4Addr::from(octets))
}

fn address_list(data: &[u8], what: &str) -> Result<Vec<Ipv4Addr>> {
    if data.is_empty() || !data.len().is_multiple_of(4) {
        return Err(Error::MalformedMessage(format!(
            "Invalid {} length: {}",
            what,
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn push_addresses(code: OptionCode, addrs: &[Ipv4Addr]) -> Vec<u8> {
    let count = addrs.len().min(MAX_ADDRESSES_PER_OPTION);
    let mut result = vec![code as u8, (count * 4) as u8];
    for addr in addrs.iter().take(count) {
        result.extend_from_slice(&addr.octets());
    }
    result
}

impl MessageOption {
    /// Returns the wire code for this option.
    pub fn option_code(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask as u8,
            Self::Router(_) => OptionCode::Router as u8,
            Self::DnsServer(_) => OptionCode::DnsServer as u8,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress as u8,
            Self::LeaseTime(_) => OptionCode::LeaseTime as u8,
            Self::MessageType(_) => OptionCode::MessageType as u8,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier as u8,
            Self::Unknown(code, _) => *code,
        }
    }

    /// Parses one option from its code and value bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] when the value does not fit the
    /// option: addresses must be exactly 4 bytes, address lists a non-empty
    /// multiple of 4, the lease time 4 bytes and the message type 1 byte
    /// naming a known type. Callers decoding a whole message skip such an
    /// option and keep going.
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => Ok(Self::SubnetMask(address(data, "subnet mask")?)),
            Ok(OptionCode::Router) => Ok(Self::Router(address_list(data, "router option")?)),
            Ok(OptionCode::DnsServer) => {
                Ok(Self::DnsServer(address_list(data, "DNS server option")?))
            }
            Ok(OptionCode::RequestedIpAddress) => Ok(Self::RequestedIpAddress(address(
                data,
                "requested IP address",
            )?)),
            Ok(OptionCode::LeaseTime) => {
                let bytes: [u8; 4] = data.try_into().map_err(|_| {
                    Error::MalformedMessage(format!("Invalid lease time length: {}", data.len()))
                })?;
                Ok(Self::LeaseTime(u32::from_be_bytes(bytes)))
            }
            Ok(OptionCode::MessageType) => {
                let [value] = data else {
                    return Err(Error::MalformedMessage(
                        "Invalid message type length".to_string(),
                    ));
                };
                let message_type = MessageType::try_from(*value).map_err(|value| {
                    Error::MalformedMessage(format!("Unknown message type: {}", value))
                })?;
                Ok(Self::MessageType(message_type))
            }
            Ok(OptionCode::ServerIdentifier) => {
                Ok(Self::ServerIdentifier(address(data, "server identifier")?))
            }
            Ok(OptionCode::Pad) | Ok(OptionCode::End) => Err(Error::MalformedMessage(
                "Pad/End carry no value".to_string(),
            )),
            Err(unknown_code) => Ok(Self::Unknown(unknown_code, data.to_vec())),
        }
    }

    /// Encodes the option as code, length and value.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::SubnetMask(addr) => {
                let mut result = vec![OptionCode::SubnetMask as u8, 4];
                result.extend_from_slice(&addr.octets());
                result
            }
            Self::Router(addrs) => push_addresses(OptionCode::Router, addrs),
            Self::DnsServer(addrs) => push_addresses(OptionCode::DnsServer, addrs),
            Self::RequestedIpAddress(addr) => {
                let mut result = vec![OptionCode::RequestedIpAddress as u8, 4];
                result.extend_from_slice(&addr.octets());
                result
            }
            Self::LeaseTime(time) => {
                let mut result = vec![OptionCode::LeaseTime as u8, 4];
                result.extend_from_slice(&time.to_be_bytes());
                result
            }
            Self::MessageType(message_type) => {
                vec![OptionCode::MessageType as u8, 1, *message_type as u8]
            }
            Self::ServerIdentifier(addr) => {
                let mut result = vec![OptionCode::ServerIdentifier as u8, 4];
                result.extend_from_slice(&addr.octets());
                result
            }
            Self::Unknown(code, data) => {
                let len = data.len().min(255);
                let mut result = vec![*code, len as u8];
                result.extend_from_slice(&data[..len]);
                result
            }
        }
    }
}
