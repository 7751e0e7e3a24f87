use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::message::{BOOTREQUEST, Message};
use crate::negotiation::{Grant, Inbound, Negotiator, Outcome};
use crate::options::{MessageOption, MessageType};

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;
const RECV_BUFFER_SIZE: usize = 1500;

/// Binary transport: answers datagrams on the configured UDP port.
pub struct LeaseServer {
    negotiator: Arc<Negotiator>,
    socket: Arc<UdpSocket>,
}

impl LeaseServer {
    pub fn new(negotiator: Arc<Negotiator>) -> Result<Self> {
        let config = negotiator.config();
        let socket = Self::create_socket(config.listen_port)?;

        info!(
            "Lease server starting on {}:{}",
            config.server_ip, config.listen_port
        );
        info!(
            "Address pool: {} - {} ({} addresses)",
            config.pool_start,
            config.pool_end,
            config.pool_size()
        );

        Ok(Self::with_socket(negotiator, socket))
    }

    /// Serves on an already bound socket.
    pub fn with_socket(negotiator: Arc<Negotiator>, socket: UdpSocket) -> Self {
        Self {
            negotiator,
            socket: Arc::new(socket),
        }
    }

    fn create_socket(port: u16) -> Result<UdpSocket> {
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

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(&self) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        info!("Lease server ready and listening");

        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    let data = buffer[..size].to_vec();
                    let handler = DatagramHandler {
                        negotiator: Arc::clone(&self.negotiator),
                        socket: Arc::clone(&self.socket),
                    };

                    tokio::spawn(async move {
                        handler.handle_datagram(&data, source).await;
                    });
                }
                Err(error) => {
                    error!("Error receiving datagram: {}", error);
                }
            }
        }
    }
}

struct DatagramHandler {
    negotiator: Arc<Negotiator>,
    socket: Arc<UdpSocket>,
}

impl DatagramHandler {
    async fn handle_datagram(&self, data: &[u8], source: SocketAddr) {
        match self.respond(data).await {
            Ok(Some(reply)) => {
                let destination = reply_destination(source);
                if let Err(error) = self.socket.send_to(&reply.encode(), destination).await {
                    warn!("Failed to send reply to {}: {}", destination, error);
                }
            }
            Ok(None) => {}
            Err(Error::MalformedMessage(reason)) => {
                debug!("Discarding datagram from {}: {}", source, reason);
            }
            Err(error) => {
                error!("Dropping datagram from {}: {}", source, error);
            }
        }
    }

    /// Runs one datagram through the negotiator and builds the reply, if any.
    async fn respond(&self, data: &[u8]) -> Result<Option<Message>> {
        let message = Message::decode(data)?;

        if message.op != BOOTREQUEST {
            debug!("Ignoring non-request op {}", message.op);
            return Ok(None);
        }

        let Some(inbound) = Inbound::from_message(&message) else {
            debug!("Ignoring message without a type from {}", message.format_mac());
            return Ok(None);
        };

        let kind = inbound.kind;
        info!("{} from {}", kind, message.format_mac());

        let outcome = match self.negotiator.handle(inbound).await {
            Ok(outcome) => outcome,
            Err(error) if kind == MessageType::Request => {
                error!("REQUEST from {} failed: {}", message.format_mac(), error);
                return Ok(Some(self.nak(&message)));
            }
            Err(error) => return Err(error),
        };

        let reply = match outcome {
            Outcome::Offer(grant) => Some(self.grant(&message, MessageType::Offer, grant)),
            Outcome::Ack(grant) => Some(self.grant(&message, MessageType::Ack, grant)),
            Outcome::Nak => Some(self.nak(&message)),
            Outcome::Released(address) => {
                info!("{} released {}", message.format_mac(), address);
                None
            }
            Outcome::Silent(reason) => {
                debug!("No reply to {}: {:?}", message.format_mac(), reason);
                None
            }
        };

        Ok(reply)
    }

    fn grant(&self, request: &Message, message_type: MessageType, grant: Grant) -> Message {
        let config = self.negotiator.config();

        let mut options = vec![
            MessageOption::ServerIdentifier(config.server_ip),
            MessageOption::LeaseTime(grant.lease_seconds),
            MessageOption::SubnetMask(config.subnet_mask),
        ];
        if let Some(router) = config.router {
            options.push(MessageOption::Router(vec![router]));
        }
        if !config.dns_servers.is_empty() {
            options.push(MessageOption::DnsServer(config.dns_servers.clone()));
        }

        Message::create_reply(
            request,
            message_type,
            grant.address,
            config.server_ip,
            options,
        )
    }

    fn nak(&self, request: &Message) -> Message {
        let server_ip = self.negotiator.config().server_ip;
        Message::create_reply(
            request,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            server_ip,
            vec![MessageOption::ServerIdentifier(server_ip)],
        )
    }
}

/// Replies go back to the sender unless it had no address yet.
fn reply_destination(source: SocketAddr) -> SocketAddr {
    if source.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), CLIENT_PORT)
    } else {
        source
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::config::{AllocationPolicy, Config};
    use crate::lease::LeaseTable;
    use crate::message::BOOTREPLY;
    use crate::store::testing::FlakyStore;
    use crate::store::{LeaseStore, MemoryLeaseStore};

    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 254);
    const MAC: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            server_ip: SERVER,
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            pool_start: Ipv4Addr::new(10, 0, 0, 1),
            pool_end: Ipv4Addr::new(10, 0, 0, 5),
            router: Some(Ipv4Addr::new(10, 0, 0, 253)),
            dns_servers: vec![Ipv4Addr::new(1, 1, 1, 1)],
            leases_file: None,
            ..Config::default()
        })
    }

    async fn create_test_handler(store: Arc<dyn LeaseStore>) -> DatagramHandler {
        let table = LeaseTable::new(test_config(), store).await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        DatagramHandler {
            negotiator: Arc::new(Negotiator::new(Arc::new(table))),
            socket: Arc::new(socket),
        }
    }

    async fn memory_handler() -> DatagramHandler {
        create_test_handler(Arc::new(MemoryLeaseStore::new(AllocationPolicy::Lowest))).await
    }

    async fn offer_for(handler: &DatagramHandler, xid: u32) -> Message {
        let discover = Message::discover(xid, &MAC);
        handler.respond(&discover.encode()).await.unwrap().unwrap()
    }

    #[test]
    fn test_constants() {
        assert_eq!(SERVER_PORT, 67);
        assert_eq!(CLIENT_PORT, 68);
        assert_eq!(RECV_BUFFER_SIZE, 1500);
    }

    #[tokio::test]
    async fn test_discover_gets_offer() {
        let handler = memory_handler().await;
        let offer = offer_for(&handler, 0x1234).await;

        assert_eq!(offer.op, BOOTREPLY);
        assert_eq!(offer.xid, 0x1234);
        assert_eq!(offer.message_type(), Some(MessageType::Offer));
        assert_eq!(offer.yiaddr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(offer.server_identifier(), Some(SERVER));
        assert_eq!(offer.lease_time(), Some(3600));
        assert_eq!(offer.subnet_mask(), Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(offer.routers(), &[Ipv4Addr::new(10, 0, 0, 253)]);
        assert_eq!(offer.dns_servers(), &[Ipv4Addr::new(1, 1, 1, 1)]);
        assert_eq!(offer.chaddr_bytes(), &MAC);
    }

    #[tokio::test]
    async fn test_request_gets_ack() {
        let handler = memory_handler().await;
        let offer = offer_for(&handler, 7).await;

        let request = Message::request_for_offer(&offer, offer.yiaddr);
        let ack = handler.respond(&request.encode()).await.unwrap().unwrap();

        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, offer.yiaddr);
        assert_eq!(ack.xid, 7);

        let lease = handler
            .negotiator
            .table()
            .lease_for(&offer.client_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.address, offer.yiaddr);
    }

    #[tokio::test]
    async fn test_request_for_unoffered_address_gets_nak() {
        let handler = memory_handler().await;
        let offer = offer_for(&handler, 7).await;

        let request = Message::request_for_offer(&offer, Ipv4Addr::new(10, 0, 0, 4));
        let nak = handler.respond(&request.encode()).await.unwrap().unwrap();

        assert_eq!(nak.message_type(), Some(MessageType::Nak));
        assert_eq!(nak.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(nak.lease_time(), None);
        assert_eq!(nak.server_identifier(), Some(SERVER));
    }

    #[tokio::test]
    async fn test_release_returns_address_without_reply() {
        let handler = memory_handler().await;
        let offer = offer_for(&handler, 7).await;
        let request = Message::request_for_offer(&offer, offer.yiaddr);
        handler.respond(&request.encode()).await.unwrap();

        let release = Message::release(8, &MAC, offer.yiaddr, SERVER);
        assert!(handler.respond(&release.encode()).await.unwrap().is_none());
        assert_eq!(
            handler.negotiator.table().available_count().await.unwrap(),
            5
        );
    }

    #[tokio::test]
    async fn test_reply_op_ignored() {
        let handler = memory_handler().await;
        let mut message = Message::discover(1, &MAC);
        message.op = BOOTREPLY;

        assert!(handler.respond(&message.encode()).await.unwrap().is_none());
        assert_eq!(
            handler.negotiator.table().available_count().await.unwrap(),
            5
        );
    }

    #[tokio::test]
    async fn test_malformed_datagram_rejected() {
        let handler = memory_handler().await;
        let result = handler.respond(&[0u8; 100]).await;
        assert!(matches!(result, Err(Error::MalformedMessage(_))));
    }

    #[tokio::test]
    async fn test_store_failure_on_request_naks() {
        let store = Arc::new(FlakyStore::new());
        let handler = create_test_handler(store.clone()).await;
        let offer = offer_for(&handler, 3).await;

        store.faults.set_lease.store(true, Ordering::SeqCst);
        let request = Message::request_for_offer(&offer, offer.yiaddr);
        let reply = handler.respond(&request.encode()).await.unwrap().unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Nak));
    }

    #[tokio::test]
    async fn test_store_failure_on_discover_is_error() {
        let store = Arc::new(FlakyStore::new());
        let handler = create_test_handler(store.clone()).await;

        store.faults.pop.store(true, Ordering::SeqCst);
        let discover = Message::discover(3, &MAC);
        let result = handler.respond(&discover.encode()).await;
        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
    }

    #[test]
    fn test_reply_destination() {
        let unicast: SocketAddr = "10.0.0.9:68".parse().unwrap();
        assert_eq!(reply_destination(unicast), unicast);

        let unspecified: SocketAddr = "0.0.0.0:68".parse().unwrap();
        assert_eq!(
            reply_destination(unspecified),
            "255.255.255.255:68".parse().unwrap()
        );
    }

    #[tokio::test]
    async fn test_server_answers_over_udp() {
        let table = LeaseTable::new(
            test_config(),
            Arc::new(MemoryLeaseStore::new(AllocationPolicy::Lowest)),
        )
        .await
        .unwrap();
        let negotiator = Arc::new(Negotiator::new(Arc::new(table)));
        let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = LeaseServer::with_socket(negotiator, server_socket);
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move { server.run().await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&Message::discover(42, &MAC).encode(), server_addr)
            .await
            .unwrap();

        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        let (size, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        let offer = Message::decode(&buffer[..size]).unwrap();
        assert_eq!(offer.xid, 42);
        assert_eq!(offer.message_type(), Some(MessageType::Offer));
    }
}
