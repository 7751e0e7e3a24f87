//! Lease persistence behind an async trait.
//!
//! [`LeaseStore`] is the contract the [`LeaseTable`](crate::LeaseTable)
//! drives: a set of available addresses with atomic pop/take/return, a
//! client → lease map and an address → client map, both with a TTL.
//! [`MemoryLeaseStore`] keeps everything in memory and can snapshot itself
//! to a JSON file.
//!
//! # Thread Safety
//!
//! Every call on [`MemoryLeaseStore`] is atomic on its own. Sequences of
//! calls are made consistent by the table's mutation lock, not by the store.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::AllocationPolicy;
use crate::lease::{ClientId, Lease};

/// Minimum interval between snapshot writes.
const SAVE_INTERVAL_MILLIS: u64 = 5000;

/// Errors reported by a [`LeaseStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend failed (unreachable, I/O, encoding).
    #[error("lease store failure: {reason}")]
    Backend {
        /// Description of the backend failure.
        reason: String,
    },
}

impl StoreError {
    pub fn backend<S: Into<String>>(reason: S) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }
}

/// Contract for the backing store of the lease table.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Seeds the available set with `addresses` unless the store was seeded
    /// before. Returns true when seeding happened on this call.
    async fn initialize_pool(&self, addresses: &[Ipv4Addr]) -> Result<bool, StoreError>;

    /// Removes and returns one available address, chosen by the store's policy.
    async fn pop_available(&self) -> Result<Option<Ipv4Addr>, StoreError>;

    /// Removes `address` from the available set. False if it was not there.
    async fn take_available(&self, address: Ipv4Addr) -> Result<bool, StoreError>;

    /// Puts `address` back into the available set.
    async fn return_to_pool(&self, address: Ipv4Addr) -> Result<(), StoreError>;

    async fn available_count(&self) -> Result<usize, StoreError>;

    /// Stores `lease` under `client`, replacing any previous record.
    async fn set_lease_with_ttl(
        &self,
        client: &ClientId,
        lease: &Lease,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Returns the client's lease. Records past their TTL are reported absent.
    async fn get_lease(&self, client: &ClientId) -> Result<Option<Lease>, StoreError>;

    async fn delete_lease(&self, client: &ClientId) -> Result<(), StoreError>;

    /// Every lease record, including ones past their TTL, so that the owner
    /// can reclaim their addresses.
    async fn list_leases(&self) -> Result<Vec<Lease>, StoreError>;

    async fn set_reverse_mapping(
        &self,
        address: Ipv4Addr,
        client: &ClientId,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Removes and returns the owner of `address`. A mapping past its TTL is
    /// removed and reported absent.
    async fn pop_reverse_mapping(
        &self,
        address: Ipv4Addr,
    ) -> Result<Option<ClientId>, StoreError>;

    /// Persists pending changes. Stores without durable state do nothing.
    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn ttl_deadline(ttl: Duration) -> DateTime<Utc> {
    let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
    Utc::now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredLease {
    lease: Lease,
    ttl_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMapping {
    client_id: ClientId,
    ttl_expires_at: DateTime<Utc>,
}

/// On-disk snapshot format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    initialized: bool,
    available: BTreeSet<Ipv4Addr>,
    leases: HashMap<ClientId, StoredLease>,
    reverse: HashMap<Ipv4Addr, StoredMapping>,
}

#[derive(Debug)]
struct StoreState {
    snapshot: Snapshot,
    dirty: bool,
    last_save: Instant,
}

/// In-memory [`LeaseStore`] with optional JSON snapshots.
///
/// With a path, mutations mark the store dirty and the snapshot is written
/// at most once every five seconds; [`flush`](LeaseStore::flush) writes it
/// immediately.
#[derive(Debug)]
pub struct MemoryLeaseStore {
    state: RwLock<StoreState>,
    policy: AllocationPolicy,
    path: Option<PathBuf>,
    save_lock: Mutex<()>,
}

impl MemoryLeaseStore {
    /// Creates an empty store that never touches the disk.
    pub fn new(policy: AllocationPolicy) -> Self {
        Self::with_snapshot(Snapshot::default(), policy, None)
    }

    /// Opens a store backed by the snapshot at `path`, loading it if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn open<P: AsRef<Path>>(path: P, policy: AllocationPolicy) -> crate::Result<Self> {
        let path = path.as_ref();
        let snapshot = if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let snapshot: Snapshot = serde_json::from_str(&content)?;
            info!(
                "Loaded {} lease(s) from {}",
                snapshot.leases.len(),
                path.display()
            );
            snapshot
        } else {
            Snapshot::default()
        };

        Ok(Self::with_snapshot(
            snapshot,
            policy,
            Some(path.to_path_buf()),
        ))
    }

    fn with_snapshot(snapshot: Snapshot, policy: AllocationPolicy, path: Option<PathBuf>) -> Self {
        Self {
            state: RwLock::new(StoreState {
                snapshot,
                dirty: false,
                last_save: Instant::now(),
            }),
            policy,
            path,
            save_lock: Mutex::new(()),
        }
    }

    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _lock = self.save_lock.lock().await;
        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|error| StoreError::backend(error.to_string()))?;
        tokio::fs::write(path, content).await.map_err(|error| {
            StoreError::backend(format!("writing {}: {}", path.display(), error))
        })?;
        debug!("Saved lease snapshot to {}", path.display());
        Ok(())
    }

    /// Marks the snapshot dirty and writes it if the save interval has
    /// passed. A failed write leaves it dirty for the next save or `flush`;
    /// the in-memory change stands either way.
    async fn maybe_save(&self, state: &mut StoreState) {
        state.dirty = true;
        if self.path.is_none()
            || state.last_save.elapsed() < Duration::from_millis(SAVE_INTERVAL_MILLIS)
        {
            return;
        }

        let snapshot = state.snapshot.clone();
        state.last_save = Instant::now();
        match self.write_snapshot(&snapshot).await {
            Ok(()) => state.dirty = false,
            Err(error) => warn!("Deferring lease snapshot: {}", error),
        }
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn initialize_pool(&self, addresses: &[Ipv4Addr]) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        if state.snapshot.initialized {
            return Ok(false);
        }
        state.snapshot.available.extend(addresses.iter().copied());
        state.snapshot.initialized = true;
        self.maybe_save(&mut state).await;
        Ok(true)
    }

    async fn pop_available(&self) -> Result<Option<Ipv4Addr>, StoreError> {
        let mut state = self.state.write().await;
        let available = &mut state.snapshot.available;
        let address = match self.policy {
            AllocationPolicy::Lowest => available.pop_first(),
            AllocationPolicy::Random if available.is_empty() => None,
            AllocationPolicy::Random => {
                let index = rand::rng().random_range(0..available.len());
                let address = available.iter().nth(index).copied();
                if let Some(address) = address {
                    available.remove(&address);
                }
                address
            }
        };
        if address.is_some() {
            self.maybe_save(&mut state).await;
        }
        Ok(address)
    }

    async fn take_available(&self, address: Ipv4Addr) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let taken = state.snapshot.available.remove(&address);
        if taken {
            self.maybe_save(&mut state).await;
        }
        Ok(taken)
    }

    async fn return_to_pool(&self, address: Ipv4Addr) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.snapshot.available.insert(address);
        self.maybe_save(&mut state).await;
        Ok(())
    }

    async fn available_count(&self) -> Result<usize, StoreError> {
        Ok(self.state.read().await.snapshot.available.len())
    }

    async fn set_lease_with_ttl(
        &self,
        client: &ClientId,
        lease: &Lease,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.snapshot.leases.insert(
            client.clone(),
            StoredLease {
                lease: lease.clone(),
                ttl_expires_at: ttl_deadline(ttl),
            },
        );
        self.maybe_save(&mut state).await;
        Ok(())
    }

    async fn get_lease(&self, client: &ClientId) -> Result<Option<Lease>, StoreError> {
        let state = self.state.read().await;
        let now = Utc::now();
        Ok(state
            .snapshot
            .leases
            .get(client)
            .filter(|stored| stored.ttl_expires_at > now)
            .map(|stored| stored.lease.clone()))
    }

    async fn delete_lease(&self, client: &ClientId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.snapshot.leases.remove(client).is_some() {
            self.maybe_save(&mut state).await;
        }
        Ok(())
    }

    async fn list_leases(&self) -> Result<Vec<Lease>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .snapshot
            .leases
            .values()
            .map(|stored| stored.lease.clone())
            .collect())
    }

    async fn set_reverse_mapping(
        &self,
        address: Ipv4Addr,
        client: &ClientId,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.snapshot.reverse.insert(
            address,
            StoredMapping {
                client_id: client.clone(),
                ttl_expires_at: ttl_deadline(ttl),
            },
        );
        self.maybe_save(&mut state).await;
        Ok(())
    }

    async fn pop_reverse_mapping(
        &self,
        address: Ipv4Addr,
    ) -> Result<Option<ClientId>, StoreError> {
        let mut state = self.state.write().await;
        let Some(mapping) = state.snapshot.reverse.remove(&address) else {
            return Ok(None);
        };
        self.maybe_save(&mut state).await;
        if mapping.ttl_expires_at > Utc::now() {
            Ok(Some(mapping.client_id))
        } else {
            Ok(None)
        }
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let snapshot = {
            let mut state = self.state.write().await;
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            state.last_save = Instant::now();
            state.snapshot.clone()
        };
        let result = self.write_snapshot(&snapshot).await;
        if result.is_err() {
            self.state.write().await.dirty = true;
        }
        result
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    struct TestGuard(PathBuf);
    impl Drop for TestGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn addresses(count: u8) -> Vec<Ipv4Addr> {
        (1..=count).map(|last| Ipv4Addr::new(10, 0, 0, last)).collect()
    }

    fn client(byte: u8) -> ClientId {
        ClientId::new(vec![0xaa, 0xbb, 0xcc, 0xdd, 0xee, byte])
    }

    #[tokio::test]
    async fn test_initialize_pool_once() {
        let store = MemoryLeaseStore::new(AllocationPolicy::Lowest);
        assert!(store.initialize_pool(&addresses(3)).await.unwrap());
        assert!(!store.initialize_pool(&addresses(10)).await.unwrap());
        assert_eq!(store.available_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_lowest_policy_pops_in_order() {
        let store = MemoryLeaseStore::new(AllocationPolicy::Lowest);
        store.initialize_pool(&addresses(3)).await.unwrap();

        assert_eq!(store.pop_available().await.unwrap(), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(store.pop_available().await.unwrap(), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(store.pop_available().await.unwrap(), Some(Ipv4Addr::new(10, 0, 0, 3)));
        assert_eq!(store.pop_available().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_random_policy_drains_each_address_once() {
        let store = MemoryLeaseStore::new(AllocationPolicy::Random);
        store.initialize_pool(&addresses(20)).await.unwrap();

        let mut seen = BTreeSet::new();
        while let Some(address) = store.pop_available().await.unwrap() {
            assert!(seen.insert(address), "popped {} twice", address);
        }
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn test_take_and_return() {
        let store = MemoryLeaseStore::new(AllocationPolicy::Lowest);
        store.initialize_pool(&addresses(2)).await.unwrap();
        let address = Ipv4Addr::new(10, 0, 0, 2);

        assert!(store.take_available(address).await.unwrap());
        assert!(!store.take_available(address).await.unwrap());
        store.return_to_pool(address).await.unwrap();
        assert_eq!(store.available_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_lapsed_lease_hidden_but_listed() {
        let store = MemoryLeaseStore::new(AllocationPolicy::Lowest);
        let lease = Lease::new(Ipv4Addr::new(10, 0, 0, 1), client(1), Utc::now(), 60);

        store
            .set_lease_with_ttl(&client(1), &lease, Duration::ZERO)
            .await
            .unwrap();
        assert!(store.get_lease(&client(1)).await.unwrap().is_none());
        assert_eq!(store.list_leases().await.unwrap().len(), 1);

        store
            .set_lease_with_ttl(&client(1), &lease, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get_lease(&client(1)).await.unwrap(), Some(lease));
    }

    #[tokio::test]
    async fn test_reverse_mapping_pop() {
        let store = MemoryLeaseStore::new(AllocationPolicy::Lowest);
        let address = Ipv4Addr::new(10, 0, 0, 1);

        store
            .set_reverse_mapping(address, &client(1), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.pop_reverse_mapping(address).await.unwrap(), Some(client(1)));
        assert_eq!(store.pop_reverse_mapping(address).await.unwrap(), None);

        store
            .set_reverse_mapping(address, &client(2), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(store.pop_reverse_mapping(address).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_snapshot_persistence() {
        let path = PathBuf::from("test_store_snapshot.json");
        let _guard = TestGuard(path.clone());
        let lease = Lease::new(Ipv4Addr::new(10, 0, 0, 1), client(1), Utc::now(), 3600);

        {
            let store = MemoryLeaseStore::open(&path, AllocationPolicy::Lowest)
                .await
                .unwrap();
            store.initialize_pool(&addresses(4)).await.unwrap();
            store.take_available(lease.address).await.unwrap();
            store
                .set_lease_with_ttl(&client(1), &lease, Duration::from_secs(3600))
                .await
                .unwrap();
            store
                .set_reverse_mapping(lease.address, &client(1), Duration::from_secs(3600))
                .await
                .unwrap();
            store.flush().await.unwrap();
        }

        let store = MemoryLeaseStore::open(&path, AllocationPolicy::Lowest)
            .await
            .unwrap();
        assert!(!store.initialize_pool(&addresses(4)).await.unwrap());
        assert_eq!(store.available_count().await.unwrap(), 3);
        assert_eq!(store.get_lease(&client(1)).await.unwrap(), Some(lease.clone()));
        assert_eq!(
            store.pop_reverse_mapping(lease.address).await.unwrap(),
            Some(client(1))
        );
    }

    async fn age_last_save(store: &MemoryLeaseStore) {
        let interval = Duration::from_millis(SAVE_INTERVAL_MILLIS * 2);
        store.state.write().await.last_save = Instant::now().checked_sub(interval).unwrap();
    }

    #[tokio::test]
    async fn test_failed_snapshot_write_keeps_mutation() {
        let store = MemoryLeaseStore::open(
            "/nonexistent-leasepool-dir/leases.json",
            AllocationPolicy::Lowest,
        )
        .await
        .unwrap();
        store.initialize_pool(&addresses(3)).await.unwrap();
        let lease = Lease::new(Ipv4Addr::new(10, 0, 0, 1), client(1), Utc::now(), 3600);

        age_last_save(&store).await;
        assert_eq!(store.pop_available().await.unwrap(), Some(lease.address));
        age_last_save(&store).await;
        store
            .set_lease_with_ttl(&client(1), &lease, Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(store.available_count().await.unwrap(), 2);
        assert_eq!(store.get_lease(&client(1)).await.unwrap(), Some(lease));
        assert!(store.state.read().await.dirty);
        assert!(matches!(store.flush().await, Err(StoreError::Backend { .. })));
        assert!(store.state.read().await.dirty);
    }

    #[tokio::test]
    async fn test_memory_store_flush_is_noop() {
        let store = MemoryLeaseStore::new(AllocationPolicy::Lowest);
        store.initialize_pool(&addresses(1)).await.unwrap();
        assert!(store.flush().await.is_ok());
    }
}
