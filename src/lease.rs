//! Leases and the table that hands them out.
//!
//! [`LeaseTable`] owns the address pool through a [`LeaseStore`]. It
//! implements:
//!
//! - allocation for DISCOVER (idempotent per client, held for
//!   `offer_hold_seconds`)
//! - confirmation for REQUEST (refresh or bind, with rejection)
//! - release by address
//! - reclamation of expired leases
//!
//! # Thread Safety
//!
//! Every mutating operation runs under one table-wide [`Mutex`], so at most
//! one mutator observes or changes the pool at a time. When the store fails
//! halfway through a mutation, the steps already taken are rolled back
//! before the error is returned.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::{LeaseStore, StoreError};

/// Opaque identifier of a negotiating client, normally its hardware address.
///
/// Displayed and serialized as colon-separated lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Vec<u8>);

impl ClientId {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for ClientId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, byte) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for ClientId {
    type Err = std::convert::Infallible;

    /// Parses `aa:bb:cc` or `aa-bb-cc`. Anything that is not hex pairs is
    /// taken verbatim as UTF-8 bytes.
    fn from_str(text: &str) -> std::result::Result<Self, Self::Err> {
        let hex: Option<Vec<u8>> = text
            .split([':', '-'])
            .map(|part| {
                if part.len() == 2 {
                    u8::from_str_radix(part, 16).ok()
                } else {
                    None
                }
            })
            .collect();
        Ok(Self(hex.unwrap_or_else(|| text.as_bytes().to_vec())))
    }
}

impl Serialize for ClientId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let Ok(id) = text.parse::<ClientId>();
        Ok(id)
    }
}

/// A time-bound binding of one address to one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub address: Ipv4Addr,
    pub client_id: ClientId,
    /// The lease is expired at any instant `>= expires_at`.
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(address: Ipv4Addr, client_id: ClientId, now: DateTime<Utc>, seconds: u32) -> Self {
        Self {
            address,
            client_id,
            expires_at: now + TimeDelta::seconds(seconds as i64),
            created_at: now,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Seconds remaining until expiration, or 0 if expired.
    pub fn remaining_seconds(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }

    fn ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Store-backed address pool.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use leasepool::{ClientId, Config, LeaseTable, MemoryLeaseStore};
///
/// # async fn example() -> leasepool::Result<()> {
/// let config = Arc::new(Config::default());
/// let store = Arc::new(MemoryLeaseStore::new(config.allocation));
/// let table = LeaseTable::new(config, store).await?;
///
/// let client: ClientId = "aa:bb:cc:dd:ee:ff".parse().unwrap();
/// let offered = table.allocate(&client).await?;
/// let lease = table.confirm(&client, offered, 3600).await?;
/// # Ok(())
/// # }
/// ```
pub struct LeaseTable {
    config: Arc<Config>,
    store: Arc<dyn LeaseStore>,
    mutation: Mutex<()>,
}

impl LeaseTable {
    /// Creates a table over `store`, seeding the store's pool from the
    /// configured range if the store has never been seeded.
    pub async fn new(config: Arc<Config>, store: Arc<dyn LeaseStore>) -> Result<Self> {
        config.check_pool_range()?;
        if store.initialize_pool(&config.pool_addresses()).await? {
            info!(
                "Initialized address pool {} - {} ({} addresses)",
                config.pool_start,
                config.pool_end,
                config.pool_size()
            );
        }

        Ok(Self {
            config,
            store,
            mutation: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Picks an address for `client` (DISCOVER handling).
    ///
    /// A client holding a live lease gets the same address back. Otherwise
    /// expired leases are reclaimed and one address is popped from the pool
    /// by the store's policy, then held for `offer_hold_seconds`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] when nothing is free, and
    /// [`Error::StoreUnavailable`] when the store fails (after rollback).
    pub async fn allocate(&self, client: &ClientId) -> Result<Ipv4Addr> {
        let _guard = self.mutation.lock().await;
        let now = Utc::now();

        if let Some(lease) = self.store.get_lease(client).await?
            && !lease.is_expired_at(now)
        {
            debug!("Re-offering {} to {}", lease.address, client);
            return Ok(lease.address);
        }

        self.sweep_locked(now).await?;

        let Some(address) = self.store.pop_available().await? else {
            return Err(Error::PoolExhausted);
        };

        let lease = Lease::new(address, client.clone(), now, self.config.offer_hold_seconds);
        self.record(&lease, now, None).await?;

        debug!("Holding {} for {}", address, client);
        Ok(address)
    }

    /// Binds `requested` to `client` for `duration_seconds` (REQUEST handling).
    ///
    /// The address must be inside the pool range and either be the client's
    /// own live lease, which is refreshed, or be free while the client holds
    /// nothing, in which case it is taken from the pool.
    ///
    /// # Errors
    ///
    /// - [`Error::AddressOutOfRange`] outside `pool_start..=pool_end`
    /// - [`Error::AddressNotOffered`] when the client holds a different address
    /// - [`Error::AddressInUse`] when another client holds it
    ///
    /// None of these change the pool or any live lease.
    pub async fn confirm(
        &self,
        client: &ClientId,
        requested: Ipv4Addr,
        duration_seconds: u32,
    ) -> Result<Lease> {
        if !self.config.ip_in_pool(requested) {
            return Err(Error::AddressOutOfRange(requested));
        }

        let _guard = self.mutation.lock().await;
        let now = Utc::now();

        let existing = self
            .store
            .get_lease(client)
            .await?
            .filter(|lease| !lease.is_expired_at(now));

        match existing {
            Some(current) if current.address == requested => {
                let refreshed = Lease {
                    expires_at: now + TimeDelta::seconds(duration_seconds as i64),
                    ..current.clone()
                };
                self.record(&refreshed, now, Some(&current)).await?;
                Ok(refreshed)
            }
            Some(current) => {
                debug!(
                    "{} asked for {} but holds {}",
                    client, requested, current.address
                );
                Err(Error::AddressNotOffered(requested))
            }
            None => {
                self.sweep_locked(now).await?;

                if !self.store.take_available(requested).await? {
                    return Err(Error::AddressInUse(requested));
                }

                let lease = Lease::new(requested, client.clone(), now, duration_seconds);
                self.record(&lease, now, None).await?;
                Ok(lease)
            }
        }
    }

    /// Returns `address` to the pool and deletes its owner's lease.
    ///
    /// Releasing an address nobody holds succeeds without doing anything.
    pub async fn release(&self, address: Ipv4Addr) -> Result<()> {
        let _guard = self.mutation.lock().await;

        let Some(client) = self.store.pop_reverse_mapping(address).await? else {
            debug!("Release of {} with no lease", address);
            return Ok(());
        };

        self.store.delete_lease(&client).await?;
        if self.config.ip_in_pool(address) {
            self.store.return_to_pool(address).await?;
        }

        info!("Released {} from {}", address, client);
        Ok(())
    }

    /// Reclaims every lease whose expiry is at or before `now`.
    ///
    /// Returns the number of leases reclaimed.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let _guard = self.mutation.lock().await;
        self.sweep_locked(now).await
    }

    async fn sweep_locked(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<Lease> = self
            .store
            .list_leases()
            .await?
            .into_iter()
            .filter(|lease| lease.is_expired_at(now))
            .collect();

        for lease in &expired {
            self.store.delete_lease(&lease.client_id).await?;
            self.store.pop_reverse_mapping(lease.address).await?;
            if self.config.ip_in_pool(lease.address) {
                self.store.return_to_pool(lease.address).await?;
            }
            debug!("Reclaimed {} from {}", lease.address, lease.client_id);
        }

        if !expired.is_empty() {
            info!("Reclaimed {} expired lease(s)", expired.len());
        }

        Ok(expired.len())
    }

    /// Writes the lease record and the reverse mapping.
    ///
    /// `previous` is the record being refreshed, if any. On failure the
    /// previous record is put back, or, for a fresh lease, the record is
    /// deleted and the address goes back to the pool.
    async fn record(
        &self,
        lease: &Lease,
        now: DateTime<Utc>,
        previous: Option<&Lease>,
    ) -> Result<()> {
        let ttl = lease.ttl(now);

        if let Err(failure) = self
            .store
            .set_lease_with_ttl(&lease.client_id, lease, ttl)
            .await
        {
            if previous.is_none() {
                self.undo(self.store.return_to_pool(lease.address).await, lease);
            }
            return Err(failure.into());
        }

        if let Err(failure) = self
            .store
            .set_reverse_mapping(lease.address, &lease.client_id, ttl)
            .await
        {
            match previous {
                Some(previous) => self.undo(
                    self.store
                        .set_lease_with_ttl(&previous.client_id, previous, previous.ttl(now))
                        .await,
                    lease,
                ),
                None => {
                    self.undo(self.store.delete_lease(&lease.client_id).await, lease);
                    self.undo(self.store.return_to_pool(lease.address).await, lease);
                }
            }
            return Err(failure.into());
        }

        Ok(())
    }

    fn undo(&self, outcome: std::result::Result<(), StoreError>, lease: &Lease) {
        if let Err(failure) = outcome {
            error!(
                "Rollback of {} for {} failed: {}",
                lease.address, lease.client_id, failure
            );
        }
    }

    /// The client's live lease, if any.
    pub async fn lease_for(&self, client: &ClientId) -> Result<Option<Lease>> {
        Ok(self
            .store
            .get_lease(client)
            .await?
            .filter(|lease| !lease.is_expired()))
    }

    /// Every lease record, expired ones included.
    pub async fn leases(&self) -> Result<Vec<Lease>> {
        let mut leases = self.store.list_leases().await?;
        leases.sort_by_key(|lease| lease.address);
        Ok(leases)
    }

    pub async fn available_count(&self) -> Result<usize> {
        Ok(self.store.available_count().await?)
    }

    /// Forces the store to persist.
    pub async fn flush(&self) -> Result<()> {
        Ok(self.store.flush().await?)
    }
}
