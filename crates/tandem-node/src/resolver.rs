//! Destination resolution with a per-identity refresh cache.
//!
//! [`DestinationResolver::resolve`] maps an identity to the set of
//! devices that should receive a message addressed to it: exactly one
//! master plus every slave linked to that master.
//!
//! # Cache design
//!
//! The cache only remembers *when* an identity's links were last
//! refreshed from the directory (`HashMap<IdentityKey, Instant>` behind
//! a `Mutex`). The destination set itself is always recomputed from the
//! link store, so roles are never cached. An entry older than the
//! refresh interval triggers a directory fetch before the set is used.
//!
//! # Single flight
//!
//! A stale identity gets exactly one in-flight refresh. Concurrent
//! callers for the same identity clone the same `Shared` future and
//! observe the same outcome; the future itself updates the cache when
//! it finishes, so a caller that gives up early does not leave the
//! entry in a half-updated state.
//!
//! # Refresh
//!
//! A successful fetch replaces the stored links of the resolved master
//! with the verified fetched set, so links the directory has dropped
//! stop receiving messages. Links the local device is a party to are
//! left alone: they are created by the handshake and removed by
//! revocation or a validated unlink, never by a directory answer.
//!
//! # Failure policy
//!
//! - Directory parse failure: "no new information". The entry is
//!   marked fresh and the set is computed from what is already stored.
//! - Any other failure: returned to the caller, entry left stale.
//!
//! The cache only holds timestamps, so a poisoned cache lock is
//! recovered rather than reported.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tandem_protocol::pairing::verify_device_link;
use tandem_storage::{LinkStore, LinkStoreExt};
use tandem_types::{Destination, DeviceLink, IdentityKey, Result, Verifier};
use tokio::time::Instant;

use crate::interfaces::Directory;

/// One directory refresh, shareable between concurrent callers.
type Refresh = Shared<BoxFuture<'static, Result<()>>>;

#[derive(Default)]
struct CacheState {
    refreshed_at: HashMap<IdentityKey, Instant>,
    in_flight: HashMap<IdentityKey, Refresh>,
}

fn lock(cache: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    cache.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("resolution cache lock poisoned, recovering");
        poisoned.into_inner()
    })
}

// ---------------------------------------------------------------------------
// DestinationResolver
// ---------------------------------------------------------------------------

/// Resolves identities to device destination sets.
pub struct DestinationResolver {
    local: IdentityKey,
    store: Arc<dyn LinkStore>,
    directory: Arc<dyn Directory>,
    verifier: Arc<dyn Verifier>,
    refresh_interval: Duration,
    cache: Arc<Mutex<CacheState>>,
}

impl DestinationResolver {
    /// Creates a resolver for the device `local` with an empty cache.
    pub fn new(
        local: IdentityKey,
        store: Arc<dyn LinkStore>,
        directory: Arc<dyn Directory>,
        verifier: Arc<dyn Verifier>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            local,
            store,
            directory,
            verifier,
            refresh_interval,
            cache: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    /// Resolves `identity` to its destination set, refreshing its
    /// links from the directory first if the cache entry is stale.
    ///
    /// # Errors
    ///
    /// - `NetworkError` (or any non-parse directory error) if a needed
    ///   refresh failed.
    /// - `StorageError` if the link store cannot be read or written.
    pub async fn resolve(&self, identity: &IdentityKey) -> Result<HashSet<Destination>> {
        let master = self.master_key(identity)?;
        self.refresh_if_stale(*identity, master).await?;
        // The refresh may have revealed a master for `identity`; its set
        // is the one that matters.
        let resolved = self.master_key(identity)?;
        if resolved != master {
            self.refresh_if_stale(resolved, resolved).await?;
        }
        self.destinations_for(&resolved)
    }

    /// Computes the destination set anchored at `master` from the store
    /// alone.
    pub fn destinations_for(&self, master: &IdentityKey) -> Result<HashSet<Destination>> {
        let links = self.store.atomically(|txn| txn.device_links(master))?;
        let mut destinations = HashSet::with_capacity(links.len() + 1);
        destinations.insert(Destination::master(*master));
        for link in links {
            if link.master == *master && link.slave != *master {
                destinations.insert(Destination::slave(link.slave));
            }
        }
        Ok(destinations)
    }

    /// Returns `true` if `identity` was refreshed within the interval.
    pub fn is_fresh(&self, identity: &IdentityKey) -> Result<bool> {
        let cache = lock(&self.cache);
        Ok(cache
            .refreshed_at
            .get(identity)
            .is_some_and(|at| at.elapsed() < self.refresh_interval))
    }

    /// Forces the next resolution of `identity` to hit the directory.
    pub fn invalidate(&self, identity: &IdentityKey) -> Result<()> {
        lock(&self.cache).refreshed_at.remove(identity);
        Ok(())
    }

    fn master_key(&self, identity: &IdentityKey) -> Result<IdentityKey> {
        Ok(self
            .store
            .atomically(|txn| txn.master_of(identity))?
            .unwrap_or(*identity))
    }

    async fn refresh_if_stale(&self, identity: IdentityKey, master: IdentityKey) -> Result<()> {
        let refresh = {
            let mut cache = lock(&self.cache);
            if let Some(at) = cache.refreshed_at.get(&identity) {
                if at.elapsed() < self.refresh_interval {
                    tracing::debug!(%identity, "destination cache hit");
                    return Ok(());
                }
            }
            match cache.in_flight.get(&identity) {
                Some(running) => running.clone(),
                None => {
                    let started = self.refresh_task(identity, master);
                    cache.in_flight.insert(identity, started.clone());
                    started
                }
            }
        };
        refresh.await
    }

    fn refresh_task(&self, identity: IdentityKey, master: IdentityKey) -> Refresh {
        let local = self.local;
        let store = Arc::clone(&self.store);
        let directory = Arc::clone(&self.directory);
        let verifier = Arc::clone(&self.verifier);
        let cache = Arc::clone(&self.cache);

        async move {
            let outcome =
                fetch_and_persist(store.as_ref(), directory.as_ref(), verifier.as_ref(), &local, &master).await;

            let mut state = lock(&cache);
            state.in_flight.remove(&identity);
            match outcome {
                Ok(()) => {
                    state.refreshed_at.insert(identity, Instant::now());
                    Ok(())
                }
                Err(e) if e.is_directory_parse() => {
                    tracing::warn!(%identity, %e, "directory returned unparsable links, using stored links");
                    state.refreshed_at.insert(identity, Instant::now());
                    Ok(())
                }
                Err(e) => {
                    tracing::warn!(%identity, %e, "device link refresh failed");
                    Err(e)
                }
            }
        }
        .boxed()
        .shared()
    }
}

/// Fetches `master`'s links, keeps the ones that verify, and makes
/// them the stored link set of `master` in one transaction. Links that
/// involve `local` are neither added nor removed.
async fn fetch_and_persist(
    store: &dyn LinkStore,
    directory: &dyn Directory,
    verifier: &dyn Verifier,
    local: &IdentityKey,
    master: &IdentityKey,
) -> Result<()> {
    let fetched = directory.fetch_device_links(master).await?;
    let total = fetched.len();

    let valid: HashSet<DeviceLink> = fetched
        .into_iter()
        .filter(|link| {
            if !link.involves(master) {
                tracing::debug!(%master, link_master = %link.master, "ignoring unrelated link from directory");
                return false;
            }
            if link.involves(local) {
                return false;
            }
            match verify_device_link(verifier, link) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(master = %link.master, slave = %link.slave, %e, "dropping invalid link from directory");
                    false
                }
            }
        })
        .collect();

    let removed = store.atomically(|txn| {
        let mut removed = 0usize;
        for stored in txn.device_links(master)? {
            let listed = valid.iter().any(|l| l.pairs(&stored.master, &stored.slave));
            if listed || stored.involves(local) {
                continue;
            }
            if txn.remove_device_link(&stored.master, &stored.slave)? {
                removed += 1;
            }
        }
        for link in &valid {
            txn.put_device_link(link)?;
        }
        Ok(removed)
    })?;
    if removed > 0 {
        tracing::info!(%master, removed, "dropped device links no longer in the directory");
    }
    tracing::debug!(%master, fetched = total, stored = valid.len(), "device links refreshed");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
