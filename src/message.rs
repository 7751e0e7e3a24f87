//! Binary message codec.
//!
//! A message is a fixed 236-byte header, a 4-byte magic cookie and a
//! variable-length option list. [`Message::decode`] turns a datagram into a
//! [`Message`]; [`Message::encode`] does the reverse.
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     op (1)    |   htype (1)   |   hlen (1)    |   hops (1)    |
//! +---------------+---------------+---------------+---------------+
//! |                            xid (4)                            |
//! +-------------------------------+-------------------------------+
//! |           secs (2)            |           flags (2)           |
//! +-------------------------------+-------------------------------+
//! |          ciaddr (4)  |  yiaddr (4)  |  siaddr (4)  |  giaddr  |
//! +---------------------------------------------------------------+
//! |                          chaddr (16)                          |
//! +---------------------------------------------------------------+
//! |                sname (64)      |      file (128)              |
//! +---------------------------------------------------------------+
//! |                    magic cookie (4) = 99.130.83.99            |
//! +---------------------------------------------------------------+
//! |                          options (variable)                   |
//! +---------------------------------------------------------------+
//! ```
//!
//! Decoding is strict about framing and lenient about content: a short
//! buffer, a missing cookie or an option that runs off the end of the buffer
//! fails the whole message, while an option whose value is invalid for its
//! type is dropped and decoding continues.

use std::net::Ipv4Addr;

use tracing::debug;

use crate::error::{Error, Result};
use crate::lease::ClientId;
use crate::options::{MessageOption, MessageType, OptionCode};

/// Marks the start of the option region.
pub const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const CHADDR_OFFSET: usize = 28;
const CHADDR_SIZE: usize = 16;
const SNAME_OFFSET: usize = CHADDR_OFFSET + CHADDR_SIZE;
const SNAME_SIZE: usize = 64;
const FILE_OFFSET: usize = SNAME_OFFSET + SNAME_SIZE;
const FILE_SIZE: usize = 128;
const MAGIC_COOKIE_OFFSET: usize = FILE_OFFSET + FILE_SIZE;

/// Header plus cookie. Anything shorter cannot be a message.
pub const FIXED_HEADER_SIZE: usize = MAGIC_COOKIE_OFFSET + MAGIC_COOKIE.len();

/// Encoded messages are zero-padded up to this length.
pub const MIN_MESSAGE_SIZE: usize = 300;

const ENCODE_CAPACITY: usize = 576;

const BROADCAST_FLAG: u16 = 0x8000;

/// Operation code for client-originated messages.
pub const BOOTREQUEST: u8 = 1;

/// Operation code for server replies.
pub const BOOTREPLY: u8 = 2;

/// Hardware type for Ethernet.
pub const HTYPE_ETHERNET: u8 = 1;

/// A decoded negotiation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// [`BOOTREQUEST`] or [`BOOTREPLY`].
    pub op: u8,
    pub htype: u8,
    /// Number of meaningful bytes in `chaddr`.
    pub hlen: u8,
    pub hops: u8,
    /// Transaction correlator chosen by the client and echoed by the server.
    pub xid: u32,
    pub secs: u16,
    /// Bit 15 asks the server to broadcast its reply.
    pub flags: u16,
    /// Client's current address, if it has one.
    pub ciaddr: Ipv4Addr,
    /// Address the server is handing out.
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    /// Relay address. Carried, never acted on.
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; CHADDR_SIZE],
    pub sname: [u8; SNAME_SIZE],
    pub file: [u8; FILE_SIZE],
    pub options: Vec<MessageOption>,
}

/// Shorthand for [`Message::encode`].
pub fn encode(message: &Message) -> Vec<u8> {
    message.encode()
}

/// Shorthand for [`Message::decode`].
pub fn decode(data: &[u8]) -> Result<Message> {
    Message::decode(data)
}

impl Message {
    /// Decodes a datagram.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] if the buffer is shorter than
    /// [`FIXED_HEADER_SIZE`], the magic cookie is wrong, or an option's
    /// length byte is missing or points past the end of the buffer.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FIXED_HEADER_SIZE {
            return Err(Error::MalformedMessage(format!(
                "Message too short: {} bytes (minimum {})",
                data.len(),
                FIXED_HEADER_SIZE
            )));
        }

        if data[MAGIC_COOKIE_OFFSET..FIXED_HEADER_SIZE] != MAGIC_COOKIE {
            return Err(Error::MalformedMessage("Invalid magic cookie".to_string()));
        }

        let address_at = |offset: usize| {
            Ipv4Addr::new(
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            )
        };

        let mut chaddr = [0u8; CHADDR_SIZE];
        chaddr.copy_from_slice(&data[CHADDR_OFFSET..SNAME_OFFSET]);

        let mut sname = [0u8; SNAME_SIZE];
        sname.copy_from_slice(&data[SNAME_OFFSET..FILE_OFFSET]);

        let mut file = [0u8; FILE_SIZE];
        file.copy_from_slice(&data[FILE_OFFSET..MAGIC_COOKIE_OFFSET]);

        Ok(Self {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: address_at(12),
            yiaddr: address_at(16),
            siaddr: address_at(20),
            giaddr: address_at(24),
            chaddr,
            sname,
            file,
            options: Self::decode_options(&data[FIXED_HEADER_SIZE..])?,
        })
    }

    fn decode_options(data: &[u8]) -> Result<Vec<MessageOption>> {
        let mut options = Vec::new();
        let mut index = 0;

        while index < data.len() {
            let code = data[index];

            if code == OptionCode::Pad as u8 {
                index += 1;
                continue;
            }

            if code == OptionCode::End as u8 {
                break;
            }

            let Some(&length) = data.get(index + 1) else {
                return Err(Error::MalformedMessage("Option length missing".to_string()));
            };
            let start = index + 2;
            let end = start + length as usize;

            if end > data.len() {
                return Err(Error::MalformedMessage(format!(
                    "Option {} declares {} bytes, {} remain",
                    code,
                    length,
                    data.len() - start
                )));
            }

            match MessageOption::parse(code, &data[start..end]) {
                Ok(option) => options.push(option),
                Err(error) => debug!("Skipping option {}: {}", code, error),
            }

            index = end;
        }

        Ok(options)
    }

    /// Encodes the message for transmission, padded to [`MIN_MESSAGE_SIZE`].
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(ENCODE_CAPACITY);

        buffer.push(self.op);
        buffer.push(self.htype);
        buffer.push(self.hlen);
        buffer.push(self.hops);

        buffer.extend_from_slice(&self.xid.to_be_bytes());
        buffer.extend_from_slice(&self.secs.to_be_bytes());
        buffer.extend_from_slice(&self.flags.to_be_bytes());

        buffer.extend_from_slice(&self.ciaddr.octets());
        buffer.extend_from_slice(&self.yiaddr.octets());
        buffer.extend_from_slice(&self.siaddr.octets());
        buffer.extend_from_slice(&self.giaddr.octets());

        buffer.extend_from_slice(&self.chaddr);
        buffer.extend_from_slice(&self.sname);
        buffer.extend_from_slice(&self.file);

        buffer.extend_from_slice(&MAGIC_COOKIE);

        for option in &self.options {
            buffer.extend_from_slice(&option.encode());
        }

        buffer.push(OptionCode::End as u8);

        if buffer.len() < MIN_MESSAGE_SIZE {
            buffer.resize(MIN_MESSAGE_SIZE, 0);
        }

        buffer
    }

    /// Builds a broadcast DISCOVER for the given hardware address.
    ///
    /// Addresses longer than 16 bytes are truncated.
    pub fn discover(xid: u32, hardware_address: &[u8]) -> Self {
        let len = hardware_address.len().min(CHADDR_SIZE);
        let mut chaddr = [0u8; CHADDR_SIZE];
        chaddr[..len].copy_from_slice(&hardware_address[..len]);

        Self {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: len as u8,
            hops: 0,
            xid,
            secs: 0,
            flags: BROADCAST_FLAG,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0u8; SNAME_SIZE],
            file: [0u8; FILE_SIZE],
            options: vec![MessageOption::MessageType(MessageType::Discover)],
        }
    }

    /// Builds the REQUEST that accepts `offer`.
    ///
    /// Every header field of the offer is kept so the server can correlate
    /// the two (xid and chaddr in particular); `op` flips back to
    /// [`BOOTREQUEST`] and only the option list is replaced.
    pub fn request_for_offer(offer: &Message, requested: Ipv4Addr) -> Self {
        let mut options = vec![
            MessageOption::MessageType(MessageType::Request),
            MessageOption::RequestedIpAddress(requested),
        ];
        if let Some(server_id) = offer.server_identifier() {
            options.push(MessageOption::ServerIdentifier(server_id));
        }

        Self {
            op: BOOTREQUEST,
            options,
            ..offer.clone()
        }
    }

    /// Builds a RELEASE giving `address` back to `server_id`.
    pub fn release(xid: u32, hardware_address: &[u8], address: Ipv4Addr, server_id: Ipv4Addr) -> Self {
        let mut message = Self::discover(xid, hardware_address);
        message.flags = 0;
        message.ciaddr = address;
        message.options = vec![
            MessageOption::MessageType(MessageType::Release),
            MessageOption::ServerIdentifier(server_id),
        ];
        message
    }

    /// Builds a server reply to `request`.
    ///
    /// The message type goes first, followed by `options`. `xid`, `flags`,
    /// `giaddr`, `chaddr`, `htype` and `hlen` are copied from the request.
    pub fn create_reply(
        request: &Message,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        options: Vec<MessageOption>,
    ) -> Self {
        let mut all_options = vec![MessageOption::MessageType(message_type)];
        all_options.extend(options);

        Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: your_ip,
            siaddr: server_ip,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: [0u8; SNAME_SIZE],
            file: [0u8; FILE_SIZE],
            options: all_options,
        }
    }

    /// Message type (option 53), if present and valid.
    pub fn message_type(&self) -> Option<MessageType> {
        self.options.iter().find_map(|opt| match opt {
            MessageOption::MessageType(t) => Some(*t),
            _ => None,
        })
    }

    /// Requested address (option 50).
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|opt| match opt {
            MessageOption::RequestedIpAddress(ip) => Some(*ip),
            _ => None,
        })
    }

    /// Server identifier (option 54).
    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|opt| match opt {
            MessageOption::ServerIdentifier(ip) => Some(*ip),
            _ => None,
        })
    }

    /// Lease duration in seconds (option 51).
    pub fn lease_time(&self) -> Option<u32> {
        self.options.iter().find_map(|opt| match opt {
            MessageOption::LeaseTime(time) => Some(*time),
            _ => None,
        })
    }

    pub fn subnet_mask(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|opt| match opt {
            MessageOption::SubnetMask(mask) => Some(*mask),
            _ => None,
        })
    }

    pub fn routers(&self) -> &[Ipv4Addr] {
        self.options
            .iter()
            .find_map(|opt| match opt {
                MessageOption::Router(routers) => Some(routers.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn dns_servers(&self) -> &[Ipv4Addr] {
        self.options
            .iter()
            .find_map(|opt| match opt {
                MessageOption::DnsServer(servers) => Some(servers.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    /// The meaningful part of `chaddr`: `hlen` bytes, at most 16.
    pub fn chaddr_bytes(&self) -> &[u8] {
        let len = (self.hlen as usize).min(CHADDR_SIZE);
        &self.chaddr[..len]
    }

    /// The identifier leases are keyed by.
    pub fn client_id(&self) -> ClientId {
        ClientId::new(self.chaddr_bytes().to_vec())
    }

    /// Hardware address as colon-separated hex, e.g. `aa:bb:cc:dd:ee:ff`.
    pub fn format_mac(&self) -> String {
        self.client_id().to_string()
    }

    pub fn is_broadcast(&self) -> bool {
        (self.flags & BROADCAST_FLAG) != 0
    }
}
