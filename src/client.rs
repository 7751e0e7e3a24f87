//! Client side of the binary transport.
//!
//! [`ClientAgent`] runs DISCOVER → OFFER → REQUEST → ACK over any
//! [`ClientTransport`], retrying DISCOVER a bounded number of times and
//! renegotiating whenever a lease runs out.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::message::{BOOTREPLY, Message};
use crate::options::MessageType;
use crate::server::{CLIENT_PORT, SERVER_PORT};

/// How long to wait for each reply.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// DISCOVER is sent at most this many times before giving up.
pub const DISCOVER_ATTEMPTS: usize = 3;
const MIN_RENEW_DELAY: Duration = Duration::from_secs(1);
const RECV_BUFFER_SIZE: usize = 1500;

/// Datagram channel to a server.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    async fn send(&self, data: &[u8]) -> Result<()>;
    async fn recv(&self) -> Result<Vec<u8>>;
}

/// Broadcast-capable UDP socket aimed at one server address.
pub struct UdpTransport {
    socket: UdpSocket,
    server: SocketAddr,
}

impl UdpTransport {
    pub fn default_bind() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, CLIENT_PORT))
    }

    pub fn default_server() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::BROADCAST, SERVER_PORT))
    }

    pub fn bind(bind: SocketAddr, server: SocketAddr) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        socket
            .bind(&bind.into())
            .map_err(|error| Error::Socket(format!("Failed to bind to {}: {}", bind, error)))?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })?;

        Ok(Self { socket, server })
    }
}

#[async_trait]
impl ClientTransport for UdpTransport {
    async fn send(&self, data: &[u8]) -> Result<()> {
        self.socket.send_to(data, self.server).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        let (size, _) = self.socket.recv_from(&mut buffer).await?;
        Ok(buffer[..size].to_vec())
    }
}

/// Network parameters handed out with a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredLease {
    pub address: Ipv4Addr,
    pub subnet_mask: Option<Ipv4Addr>,
    pub router: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub lease_duration: Duration,
    pub server_id: Option<Ipv4Addr>,
}

impl AcquiredLease {
    fn from_offer(offer: &Message) -> Self {
        Self {
            address: offer.yiaddr,
            subnet_mask: offer.subnet_mask(),
            router: offer.routers().first().copied(),
            dns_servers: offer.dns_servers().to_vec(),
            lease_duration: Duration::from_secs(offer.lease_time().unwrap_or(0) as u64),
            server_id: offer.server_identifier(),
        }
    }
}

pub struct ClientAgent<T> {
    transport: T,
    hardware_address: Vec<u8>,
}

impl<T: ClientTransport> ClientAgent<T> {
    pub fn new(transport: T, hardware_address: Vec<u8>) -> Self {
        Self {
            transport,
            hardware_address,
        }
    }

    /// Negotiates one lease.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] if no OFFER arrives after [`DISCOVER_ATTEMPTS`]
    /// tries or the REQUEST goes unanswered, [`Error::NegotiationFailed`]
    /// on NAK.
    pub async fn acquire(&self) -> Result<AcquiredLease> {
        let xid: u32 = rand::random();
        let offer = self.discover(xid).await?;
        let lease = AcquiredLease::from_offer(&offer);
        info!(
            "Offered {} by {:?} (xid {:#010x})",
            lease.address, lease.server_id, xid
        );

        let request = Message::request_for_offer(&offer, offer.yiaddr);
        self.transport.send(&request.encode()).await?;

        let reply = self
            .await_reply(xid, &[MessageType::Ack, MessageType::Nak])
            .await?
            .ok_or_else(|| Error::Timeout(format!("a reply to REQUEST for {}", lease.address)))?;

        if reply.message_type() == Some(MessageType::Nak) {
            return Err(Error::NegotiationFailed(format!(
                "server refused {}",
                lease.address
            )));
        }

        info!(
            "Bound {} for {} seconds",
            lease.address,
            lease.lease_duration.as_secs()
        );
        Ok(lease)
    }

    async fn discover(&self, xid: u32) -> Result<Message> {
        let discover = Message::discover(xid, &self.hardware_address).encode();

        for attempt in 1..=DISCOVER_ATTEMPTS {
            self.transport.send(&discover).await?;

            if let Some(offer) = self.await_reply(xid, &[MessageType::Offer]).await? {
                return Ok(offer);
            }

            warn!("No OFFER (attempt {}/{})", attempt, DISCOVER_ATTEMPTS);
        }

        Err(Error::Timeout(format!(
            "an OFFER ({} attempts)",
            DISCOVER_ATTEMPTS
        )))
    }

    /// Waits up to [`RESPONSE_TIMEOUT`] for a reply to `xid` of one of the
    /// `expected` types. `None` on timeout.
    async fn await_reply(&self, xid: u32, expected: &[MessageType]) -> Result<Option<Message>> {
        match tokio::time::timeout(RESPONSE_TIMEOUT, self.next_reply(xid, expected)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn next_reply(&self, xid: u32, expected: &[MessageType]) -> Result<Message> {
        loop {
            let data = self.transport.recv().await?;
            match Message::decode(&data) {
                Ok(message)
                    if message.op == BOOTREPLY
                        && message.xid == xid
                        && message
                            .message_type()
                            .is_some_and(|kind| expected.contains(&kind)) =>
                {
                    return Ok(message);
                }
                Ok(message) => {
                    debug!(
                        "Skipping reply with xid {:#010x} ({:?})",
                        message.xid,
                        message.message_type()
                    );
                }
                Err(error) => debug!("Skipping undecodable reply: {}", error),
            }
        }
    }

    /// Keeps a lease, negotiating a new one each time the last expires.
    pub async fn run(&self) -> Result<()> {
        loop {
            let lease = match self.acquire().await {
                Ok(lease) => lease,
                Err(error) => {
                    error!("Lease negotiation failed: {}", error);
                    return Err(error);
                }
            };

            tokio::time::sleep(lease.lease_duration.max(MIN_RENEW_DELAY)).await;
            info!("Lease on {} expired, renegotiating", lease.address);
        }
    }

    /// Gives `lease` back to the server that granted it.
    pub async fn release(&self, lease: &AcquiredLease) -> Result<()> {
        let server_id = lease.server_id.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let release = Message::release(
            rand::random(),
            &self.hardware_address,
            lease.address,
            server_id,
        );
        self.transport.send(&release.encode()).await?;
        info!("Released {}", lease.address);
        Ok(())
    }
}
