//! # leasepool
//!
//! Address lease negotiation: a server hands out time-bound leases on
//! addresses from a configured pool, and a client acquires and keeps one.
//!
//! ## Features
//!
//! - DISCOVER / OFFER / REQUEST / ACK / NAK / RELEASE negotiation
//! - Binary messages over UDP and JSON over HTTP, sharing one lease table
//! - Pluggable lease storage behind the [`LeaseStore`] trait
//! - Snapshot persistence of the in-memory store across restarts
//! - Client agent with bounded retries and automatic renegotiation
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use leasepool::{Config, LeaseServer, LeaseTable, MemoryLeaseStore, Negotiator};
//!
//! #[tokio::main]
//! async fn main() -> leasepool::Result<()> {
//!     let config = Arc::new(Config::load_or_create("config.json")?);
//!     let store = Arc::new(MemoryLeaseStore::new(config.allocation));
//!     let table = Arc::new(LeaseTable::new(config, store).await?);
//!     let server = LeaseServer::new(Arc::new(Negotiator::new(table)))?;
//!     server.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Config`] - Pool range, lease duration, network parameters
//! - [`Message`] - Binary message codec with typed [`MessageOption`]s
//! - [`LeaseStore`] - Storage backend; [`MemoryLeaseStore`] is the default
//! - [`LeaseTable`] - Allocation, confirmation, release and expiry sweep
//! - [`Negotiator`] - Per-client negotiation state machine
//! - [`LeaseServer`] - UDP transport; [`http`] holds the HTTP transport
//! - [`ClientAgent`] - Client side of the negotiation

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod lease;
pub mod message;
pub mod negotiation;
pub mod options;
pub mod server;
pub mod store;

pub use client::{AcquiredLease, ClientAgent, ClientTransport, UdpTransport};
pub use config::{AllocationPolicy, Config};
pub use error::{Error, Result};
pub use http::HttpNegotiationClient;
pub use lease::{ClientId, Lease, LeaseTable};
pub use message::Message;
pub use negotiation::{Grant, Inbound, NegotiationState, Negotiator, Outcome, Silence};
pub use options::{MessageOption, MessageType};
pub use server::LeaseServer;
pub use store::{LeaseStore, MemoryLeaseStore, StoreError};
