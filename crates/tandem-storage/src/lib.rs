//! Persisted device-link store for the Tandem multi-device core.
//!
//! Holds, per identity key, the set of device links the identity
//! participates in, the conversation record (friend-request status and
//! display metadata), and the local device's "unlinked" flag.
//!
//! Every read and write goes through a [`StoreTxn`] obtained from
//! [`LinkStore::transaction`]: one logical update (one link commit, one
//! unlink, one friend-request status change) is one transaction.
//!
//! Two backends:
//!
//! - [`engine::SledLinkStore`]: sled database, multi-tree transactions
//! - [`memory::MemoryLinkStore`]: in-process, copy-on-commit

pub mod engine;
pub mod memory;
pub mod records;

use std::cell::RefCell;
use std::collections::HashSet;

use tandem_protocol::LinkingProfile;
use tandem_types::{DeviceLink, FriendRequestStatus, IdentityKey, Result, TandemError};

pub use engine::SledLinkStore;
pub use memory::MemoryLinkStore;
pub use records::ConversationRecord;

// ---------------------------------------------------------------------------
// StoreTxn
// ---------------------------------------------------------------------------

/// Reads and writes scoped to one atomic transaction.
///
/// Writes become visible to other transactions only when the closure
/// passed to [`LinkStore::transaction`] returns `Ok`.
pub trait StoreTxn {
    /// The master of `identity`, if `identity` is a linked slave.
    fn master_of(&self, identity: &IdentityKey) -> Result<Option<IdentityKey>>;

    /// All links `identity` participates in, as master or slave.
    fn device_links(&self, identity: &IdentityKey) -> Result<HashSet<DeviceLink>>;

    /// Records `link` for both of its sides. Replaces an existing
    /// record for the same pairing.
    fn put_device_link(&mut self, link: &DeviceLink) -> Result<()>;

    /// Removes the link between `master` and `slave`. Returns `true`
    /// if it existed.
    fn remove_device_link(&mut self, master: &IdentityKey, slave: &IdentityKey) -> Result<bool>;

    /// Friend-request status of the conversation with `identity`.
    fn friend_request_status(&self, identity: &IdentityKey) -> Result<FriendRequestStatus>;

    /// Sets the friend-request status of the conversation with `identity`.
    fn set_friend_request_status(&mut self, identity: &IdentityKey, status: FriendRequestStatus) -> Result<()>;

    /// Full conversation record for `identity` (default if absent).
    fn conversation(&self, identity: &IdentityKey) -> Result<ConversationRecord>;

    /// Applies linking profile metadata to the conversation with
    /// `identity`. Absent fields leave the stored values untouched.
    fn apply_profile(&mut self, identity: &IdentityKey, profile: &LinkingProfile) -> Result<()>;

    /// Whether the local device has been unlinked by its master.
    fn is_unlinked(&self) -> Result<bool>;

    /// Sets the local "unlinked" flag.
    fn set_unlinked(&mut self, unlinked: bool) -> Result<()>;
}

// ---------------------------------------------------------------------------
// LinkStore
// ---------------------------------------------------------------------------

/// A persisted store that runs closures inside atomic transactions.
pub trait LinkStore: Send + Sync {
    /// Runs `f` inside one atomic transaction.
    ///
    /// `f` may be invoked more than once if the backend retries on
    /// conflict, so it must not have side effects outside the
    /// transaction. If `f` returns `Err`, nothing is written.
    fn transaction(&self, f: &dyn Fn(&mut dyn StoreTxn) -> Result<()>) -> Result<()>;
}

/// Value-returning convenience over [`LinkStore::transaction`].
pub trait LinkStoreExt: LinkStore {
    /// Runs `f` atomically and returns its result.
    fn atomically<R>(&self, f: impl Fn(&mut dyn StoreTxn) -> Result<R>) -> Result<R> {
        let out = RefCell::new(None);
        self.transaction(&|txn| {
            let value = f(txn)?;
            *out.borrow_mut() = Some(value);
            Ok(())
        })?;
        out.into_inner().ok_or_else(|| TandemError::StorageError {
            reason: "transaction committed without a result".into(),
        })
    }
}

impl<S: LinkStore + ?Sized> LinkStoreExt for S {}
