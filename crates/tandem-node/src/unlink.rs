//! Validation of unlink notifications.
//!
//! An unlink notification tells the local (slave) device that its
//! master revoked it. Acting on one wipes local data, so it is only
//! trusted after four checks:
//!
//! 1. the local identity has a recorded master;
//! 2. the notification came from that master;
//! 3. a link between that master and the local identity exists locally;
//! 4. a fresh directory fetch of the master's links no longer lists it.
//!
//! Any failed check rejects the notification with no side effect.

use std::fmt;
use std::sync::Arc;

use tandem_storage::{LinkStore, LinkStoreExt};
use tandem_types::{IdentityKey, Result};

use crate::interfaces::{DataWipe, Directory};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Why an unlink notification was not acted on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UnlinkRejection {
    /// The local identity has no master.
    NoMaster,
    /// The sender is not the recorded master.
    SenderNotMaster {
        /// The recorded master.
        master: IdentityKey,
    },
    /// No local link between the master and this device.
    NoLocalLink,
    /// The directory still lists the link.
    StillPublished,
    /// The directory could not be consulted.
    DirectoryUnavailable {
        /// The directory failure.
        reason: String,
    },
}

impl fmt::Display for UnlinkRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMaster => write!(f, "no master recorded"),
            Self::SenderNotMaster { master } => write!(f, "sender is not the recorded master {master}"),
            Self::NoLocalLink => write!(f, "no local link to the master"),
            Self::StillPublished => write!(f, "directory still lists the link"),
            Self::DirectoryUnavailable { reason } => write!(f, "directory unavailable: {reason}"),
        }
    }
}

/// Result of processing an unlink notification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UnlinkOutcome {
    /// All checks passed; the device is unlinked and wiped.
    Unlinked {
        /// The master that revoked this device.
        master: IdentityKey,
    },
    /// A check failed; nothing was changed.
    Rejected(UnlinkRejection),
}

// ---------------------------------------------------------------------------
// UnlinkGuard
// ---------------------------------------------------------------------------

/// Validates and executes unlink notifications for the local device.
pub struct UnlinkGuard {
    local: IdentityKey,
    store: Arc<dyn LinkStore>,
    directory: Arc<dyn Directory>,
    wipe: Arc<dyn DataWipe>,
}

impl UnlinkGuard {
    pub fn new(
        local: IdentityKey,
        store: Arc<dyn LinkStore>,
        directory: Arc<dyn Directory>,
        wipe: Arc<dyn DataWipe>,
    ) -> Self {
        Self {
            local,
            store,
            directory,
            wipe,
        }
    }

    /// Processes an unlink notification claimed to come from `sender`.
    ///
    /// # Errors
    ///
    /// - `StorageError` if the link store fails.
    /// - Whatever the data-wipe collaborator returns. By then the
    ///   unlinked flag is already persisted.
    pub async fn handle(&self, sender: &IdentityKey) -> Result<UnlinkOutcome> {
        let local = self.local;
        let (master, linked) = self.store.atomically(|txn| {
            let Some(master) = txn.master_of(&local)? else {
                return Ok((None, false));
            };
            let linked = txn.device_links(&local)?.iter().any(|l| l.pairs(&master, &local));
            Ok((Some(master), linked))
        })?;

        let Some(master) = master else {
            return Ok(self.reject(sender, UnlinkRejection::NoMaster));
        };
        if *sender != master {
            return Ok(self.reject(sender, UnlinkRejection::SenderNotMaster { master }));
        }
        if !linked {
            return Ok(self.reject(sender, UnlinkRejection::NoLocalLink));
        }

        let authoritative = match self.directory.fetch_device_links(&master).await {
            Ok(links) => links,
            Err(e) => {
                return Ok(self.reject(sender, UnlinkRejection::DirectoryUnavailable { reason: e.to_string() }));
            }
        };
        if authoritative.iter().any(|l| l.pairs(&master, &local)) {
            return Ok(self.reject(sender, UnlinkRejection::StillPublished));
        }

        // Re-check inside the write so a concurrent relink cannot be
        // wiped by a stale decision.
        let removed = self.store.atomically(|txn| {
            if txn.master_of(&local)? != Some(master) {
                return Ok(false);
            }
            txn.set_unlinked(true)?;
            txn.remove_device_link(&master, &local)
        })?;
        if !removed {
            return Ok(self.reject(sender, UnlinkRejection::NoLocalLink));
        }

        tracing::info!(%master, "device unlinked by master, wiping local data");
        self.wipe.wipe_local_data().await.map_err(|e| {
            tracing::warn!(%e, "local data wipe failed after unlink");
            e
        })?;
        Ok(UnlinkOutcome::Unlinked { master })
    }

    /// Returns `true` if this device has been unlinked.
    pub fn is_unlinked(&self) -> Result<bool> {
        self.store.atomically(|txn| txn.is_unlinked())
    }

    fn reject(&self, sender: &IdentityKey, reason: UnlinkRejection) -> UnlinkOutcome {
        tracing::warn!(%sender, %reason, "unlink notification rejected");
        UnlinkOutcome::Rejected(reason)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tandem_storage::MemoryLinkStore;
    use tandem_types::{DeviceLink, Signature};

    struct StaticDirectory(HashSet<DeviceLink>);

    #[async_trait]
    impl Directory for StaticDirectory {
        async fn fetch_device_links(&self, _: &IdentityKey) -> Result<HashSet<DeviceLink>> {
            Ok(self.0.clone())
        }

        async fn publish_device_link(&self, _: &DeviceLink) -> Result<()> {
            Ok(())
        }

        async fn unpublish_device_link(&self, _: &DeviceLink) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingWipe(AtomicUsize);

    #[async_trait]
    impl DataWipe for CountingWipe {
        async fn wipe_local_data(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn key(b: u8) -> IdentityKey {
        IdentityKey::new([b; 32])
    }

    fn link(master: u8, slave: u8) -> DeviceLink {
        DeviceLink {
            master: key(master),
            slave: key(slave),
            master_signature: Signature::from_bytes([1; 64]),
            slave_signature: Signature::from_bytes([2; 64]),
        }
    }

    fn guard(store: Arc<MemoryLinkStore>, published: &[DeviceLink], wipe: Arc<CountingWipe>) -> UnlinkGuard {
        let directory = StaticDirectory(published.iter().cloned().collect());
        UnlinkGuard::new(key(2), store, Arc::new(directory), wipe)
    }

    #[tokio::test]
    async fn device_without_master_cannot_be_unlinked() -> Result<()> {
        let wipe = Arc::new(CountingWipe::default());
        let g = guard(Arc::new(MemoryLinkStore::new()), &[], wipe.clone());
        assert_eq!(g.handle(&key(1)).await?, UnlinkOutcome::Rejected(UnlinkRejection::NoMaster));
        assert_eq!(wipe.0.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn sibling_slave_cannot_unlink() -> Result<()> {
        let store = Arc::new(MemoryLinkStore::new());
        store.transaction(&|txn| {
            txn.put_device_link(&link(1, 2))?;
            txn.put_device_link(&link(1, 3))
        })?;
        let wipe = Arc::new(CountingWipe::default());
        let g = guard(store.clone(), &[], wipe.clone());

        let outcome = g.handle(&key(3)).await?;
        assert_eq!(
            outcome,
            UnlinkOutcome::Rejected(UnlinkRejection::SenderNotMaster { master: key(1) })
        );
        assert!(!g.is_unlinked()?);
        assert_eq!(wipe.0.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn corroborated_unlink_wipes_once() -> Result<()> {
        let store = Arc::new(MemoryLinkStore::new());
        store.transaction(&|txn| txn.put_device_link(&link(1, 2)))?;
        let wipe = Arc::new(CountingWipe::default());
        let g = guard(store.clone(), &[], wipe.clone());

        assert_eq!(g.handle(&key(1)).await?, UnlinkOutcome::Unlinked { master: key(1) });
        assert!(g.is_unlinked()?);
        assert_eq!(store.atomically(|txn| txn.master_of(&key(2)))?, None);

        // A replayed notification finds no master any more.
        assert_eq!(g.handle(&key(1)).await?, UnlinkOutcome::Rejected(UnlinkRejection::NoMaster));
        assert_eq!(wipe.0.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
