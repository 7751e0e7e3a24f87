//! Per-client negotiation state machine.
//!
//! ```text
//!            DISCOVER             REQUEST (confirmed)
//!   Idle ─────────────▶ Offered ─────────────────────▶ Bound
//!    ▲                    │  ▲ REQUEST (rejected) → NAK  │
//!    └────────────────────┘  └────────── DISCOVER ───────┤
//!    ▲                      RELEASE                      │
//!    └───────────────────────────────────────────────────┘
//! ```
//!
//! A DISCOVER from a bound client re-offers the address it already holds,
//! so a client whose ACK was lost can finish the exchange. A REQUEST must
//! name the address that was offered. A RELEASE from a client with no
//! session is checked against the lease table, which still knows bindings
//! made before a restart.
//!
//! The machine is transport neutral: both the UDP server and the HTTP
//! handler turn their input into an [`Inbound`] and render the returned
//! [`Outcome`]. Messages that do not fit the client's current state are
//! ignored rather than treated as errors, since an unreliable transport
//! duplicates and reorders them.
//!
//! Messages from one client are processed one at a time in arrival order;
//! different clients proceed concurrently.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lease::{ClientId, LeaseTable};
use crate::message::Message;
use crate::options::MessageType;

/// Where one client's negotiation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationState {
    #[default]
    Idle,
    Offered {
        address: Ipv4Addr,
        held_until: DateTime<Utc>,
    },
    Bound {
        address: Ipv4Addr,
        expires_at: DateTime<Utc>,
    },
}

impl NegotiationState {
    /// True when nothing about this client needs remembering any more.
    fn is_settled(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Idle => true,
            Self::Offered { held_until, .. } => *held_until <= now,
            Self::Bound { expires_at, .. } => *expires_at <= now,
        }
    }
}

/// A parsed negotiation message, independent of transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub kind: MessageType,
    pub client: ClientId,
    /// Requested address option.
    pub requested: Option<Ipv4Addr>,
    /// The client's own address field; unspecified when absent.
    pub client_address: Ipv4Addr,
    /// Server the client addressed, if it named one.
    pub server_id: Option<Ipv4Addr>,
}

impl Inbound {
    pub fn new(kind: MessageType, client: ClientId) -> Self {
        Self {
            kind,
            client,
            requested: None,
            client_address: Ipv4Addr::UNSPECIFIED,
            server_id: None,
        }
    }

    pub fn with_requested(mut self, requested: Option<Ipv4Addr>) -> Self {
        self.requested = requested;
        self
    }

    /// Extracts the negotiation fields of a decoded message. `None` when the
    /// message carries no valid message type.
    pub fn from_message(message: &Message) -> Option<Self> {
        Some(Self {
            kind: message.message_type()?,
            client: message.client_id(),
            requested: message.requested_ip(),
            client_address: message.ciaddr,
            server_id: message.server_identifier(),
        })
    }

    fn client_address(&self) -> Option<Ipv4Addr> {
        Some(self.client_address).filter(|address| !address.is_unspecified())
    }
}

/// An address handed to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub address: Ipv4Addr,
    pub lease_seconds: u32,
}

/// Why no reply is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Silence {
    /// DISCOVER arrived but the pool is empty.
    Exhausted,
    /// The message does not fit the client's state.
    Ignored,
    /// The client accepted another server's offer.
    OtherServer,
}

/// What the transport should answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Offer(Grant),
    Ack(Grant),
    /// Rejection. Carries no address and a zero lease duration.
    Nak,
    /// The address went back to the pool. Transport A sends nothing.
    Released(Ipv4Addr),
    Silent(Silence),
}

type Session = Arc<Mutex<NegotiationState>>;

/// Drives negotiations for every client against one [`LeaseTable`].
pub struct Negotiator {
    table: Arc<LeaseTable>,
    sessions: Mutex<HashMap<ClientId, Session>>,
}

impl Negotiator {
    pub fn new(table: Arc<LeaseTable>) -> Self {
        Self {
            table,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn table(&self) -> &Arc<LeaseTable> {
        &self.table
    }

    pub fn config(&self) -> &Config {
        self.table.config()
    }

    async fn session(&self, client: &ClientId) -> Session {
        let mut sessions = self.sessions.lock().await;
        Arc::clone(sessions.entry(client.clone()).or_default())
    }

    /// Current state of `client`'s negotiation.
    pub async fn state_of(&self, client: &ClientId) -> NegotiationState {
        let session = self.sessions.lock().await.get(client).cloned();
        match session {
            Some(session) => *session.lock().await,
            None => NegotiationState::Idle,
        }
    }

    /// Feeds one message through the client's state machine.
    ///
    /// # Errors
    ///
    /// Store failures are returned as [`Error::StoreUnavailable`] and leave
    /// the client's state untouched.
    pub async fn handle(&self, inbound: Inbound) -> Result<Outcome> {
        let session = self.session(&inbound.client).await;
        let mut state = session.lock().await;
        let now = Utc::now();

        let (outcome, next) = self.step(&inbound, *state, now).await?;

        if next != *state {
            debug!(
                "{}: {:?} -> {:?} on {}",
                inbound.client, *state, next, inbound.kind
            );
        }
        *state = next;

        Ok(outcome)
    }

    async fn step(
        &self,
        inbound: &Inbound,
        state: NegotiationState,
        now: DateTime<Utc>,
    ) -> Result<(Outcome, NegotiationState)> {
        use NegotiationState::*;

        let state = match (inbound.kind, state) {
            (MessageType::Release, Idle) => self.recover_binding(&inbound.client).await?,
            _ => state,
        };
        let ignore = Ok((Outcome::Silent(Silence::Ignored), state));

        match (inbound.kind, state) {
            (MessageType::Discover, _) => self.offer(&inbound.client, now).await,
            (MessageType::Request, Offered { address, .. }) => {
                self.request(inbound, address).await
            }
            (MessageType::Release, Bound { address, expires_at }) if expires_at > now => {
                let target = inbound.client_address().unwrap_or(address);
                if target != address {
                    warn!(
                        "RELEASE from {} names {} but the client holds {}",
                        inbound.client, target, address
                    );
                    return ignore;
                }
                self.table.release(address).await?;
                Ok((Outcome::Released(address), Idle))
            }
            (MessageType::Release, Bound { .. }) => Ok((Outcome::Silent(Silence::Ignored), Idle)),
            _ => ignore,
        }
    }

    /// Rebuilds a binding the table still holds but this negotiator has
    /// forgotten, after a restart or a prune.
    async fn recover_binding(&self, client: &ClientId) -> Result<NegotiationState> {
        Ok(match self.table.lease_for(client).await? {
            Some(lease) => NegotiationState::Bound {
                address: lease.address,
                expires_at: lease.expires_at,
            },
            None => NegotiationState::Idle,
        })
    }

    async fn offer(
        &self,
        client: &ClientId,
        now: DateTime<Utc>,
    ) -> Result<(Outcome, NegotiationState)> {
        match self.table.allocate(client).await {
            Ok(address) => {
                let held_until =
                    now + TimeDelta::seconds(self.config().offer_hold_seconds as i64);
                info!("OFFER {} to {}", address, client);
                Ok((
                    Outcome::Offer(Grant {
                        address,
                        lease_seconds: self.config().lease_duration_seconds,
                    }),
                    NegotiationState::Offered {
                        address,
                        held_until,
                    },
                ))
            }
            Err(Error::PoolExhausted) => {
                warn!("Pool exhausted, no offer for {}", client);
                Ok((
                    Outcome::Silent(Silence::Exhausted),
                    NegotiationState::Idle,
                ))
            }
            Err(error) => Err(error),
        }
    }

    async fn request(
        &self,
        inbound: &Inbound,
        offered: Ipv4Addr,
    ) -> Result<(Outcome, NegotiationState)> {
        let client = &inbound.client;
        let server_ip = self.config().server_ip;

        if let Some(server_id) = inbound.server_id
            && server_id != server_ip
        {
            info!(
                "{} chose server {}, withdrawing offer of {}",
                client, server_id, offered
            );
            self.table.release(offered).await?;
            return Ok((
                Outcome::Silent(Silence::OtherServer),
                NegotiationState::Idle,
            ));
        }

        let Some(requested) = inbound.requested.or_else(|| inbound.client_address()) else {
            warn!("NAK to {}: REQUEST names no address", client);
            return Ok((Outcome::Nak, NegotiationState::Idle));
        };

        if requested != offered {
            warn!(
                "NAK to {}: requested {} but was offered {}",
                client, requested, offered
            );
            return Ok((Outcome::Nak, NegotiationState::Idle));
        }

        let duration = self.config().lease_duration_seconds;
        match self.table.confirm(client, requested, duration).await {
            Ok(lease) => {
                info!("ACK {} to {} ({} seconds)", lease.address, client, duration);
                Ok((
                    Outcome::Ack(Grant {
                        address: lease.address,
                        lease_seconds: duration,
                    }),
                    NegotiationState::Bound {
                        address: lease.address,
                        expires_at: lease.expires_at,
                    },
                ))
            }
            Err(error) if error.is_rejection() => {
                warn!("NAK to {}: {}", client, error);
                Ok((Outcome::Nak, NegotiationState::Idle))
            }
            Err(error) => Err(error),
        }
    }

    /// Forgets clients whose negotiation has nothing left to track.
    ///
    /// Returns how many were dropped. Sessions busy with a message are kept.
    pub async fn prune_idle(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, session| match session.try_lock() {
            Ok(state) => !state.is_settled(now),
            Err(_) => true,
        });
        before - sessions.len()
    }

    /// Sweeps expired leases and prunes settled sessions every `period`.
    pub async fn maintain(&self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match self.table.sweep_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(count) => info!("Maintenance reclaimed {} lease(s)", count),
                Err(error) => warn!("Lease sweep failed: {}", error),
            }

            let pruned = self.prune_idle().await;
            if pruned > 0 {
                debug!("Pruned {} settled session(s)", pruned);
            }
        }
    }
}
