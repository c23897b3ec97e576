//! sled-backed link store.
//!
//! The [`SledLinkStore`] owns the sled database and three trees. Every
//! [`LinkStore::transaction`] runs as one sled multi-tree transaction,
//! so a link commit touching both sides plus the friend-request status
//! of both lands atomically.

use std::cell::Cell;
use std::path::Path;

use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionalTree, UnabortableTransactionError,
};
use sled::Transactional;
use tandem_types::{IdentityKey, Result, TandemError};

use crate::records::{decode, encode, ConversationRecord, LinkSet, RecordAccess};
use crate::{LinkStore, StoreTxn};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const LINKS_TREE: &str = "device_links";
const CONVERSATIONS_TREE: &str = "conversations";
const LOCAL_TREE: &str = "local_state";

// ---------------------------------------------------------------------------
// SledLinkStore
// ---------------------------------------------------------------------------

/// Link store backed by sled.
///
/// # Trees
///
/// - `device_links`: identity key to the links it participates in
/// - `conversations`: identity key to [`ConversationRecord`]
/// - `local_state`: flags about the local device (`unlinked`)
pub struct SledLinkStore {
    db: sled::Db,
    links: sled::Tree,
    conversations: sled::Tree,
    local: sled::Tree,
}

impl SledLinkStore {
    /// Opens (or creates) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`TandemError::StorageError`] if the database or one of
    /// its trees cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).map_err(|e| TandemError::StorageError {
            reason: format!("failed to open sled database: {e}"),
        })?;
        Self::from_db(db)
    }

    /// Opens a throwaway store that is deleted when dropped.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| TandemError::StorageError {
                reason: format!("failed to open temporary sled database: {e}"),
            })?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let open_tree = |name: &str| {
            db.open_tree(name).map_err(|e| TandemError::StorageError {
                reason: format!("failed to open tree '{name}': {e}"),
            })
        };
        let links = open_tree(LINKS_TREE)?;
        let conversations = open_tree(CONVERSATIONS_TREE)?;
        let local = open_tree(LOCAL_TREE)?;
        tracing::debug!(trees = 3, "link store opened");
        Ok(Self {
            db,
            links,
            conversations,
            local,
        })
    }

    /// Flushes all pending writes to disk.
    ///
    /// # Errors
    ///
    /// Returns [`TandemError::StorageError`] if the flush fails.
    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(|e| TandemError::StorageError {
            reason: format!("failed to flush database: {e}"),
        })?;
        Ok(())
    }
}

impl LinkStore for SledLinkStore {
    fn transaction(&self, f: &dyn Fn(&mut dyn StoreTxn) -> Result<()>) -> Result<()> {
        (&self.links, &self.conversations, &self.local)
            .transaction(|(links, conversations, local)| {
                let mut txn = SledTxn {
                    links,
                    conversations,
                    local,
                    interrupted: Cell::new(None),
                };
                let outcome = f(&mut txn);
                // A sled conflict surfaces to `f` as an ordinary error;
                // hand it back to sled so the transaction is retried.
                if let Some(e) = txn.interrupted.take() {
                    return Err(ConflictableTransactionError::from(e));
                }
                outcome.map_err(ConflictableTransactionError::Abort)
            })
            .map_err(|e: TransactionError<TandemError>| match e {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => TandemError::StorageError {
                    reason: format!("sled transaction failed: {err}"),
                },
            })
    }
}

// ---------------------------------------------------------------------------
// SledTxn
// ---------------------------------------------------------------------------

struct SledTxn<'t> {
    links: &'t TransactionalTree,
    conversations: &'t TransactionalTree,
    local: &'t TransactionalTree,
    interrupted: Cell<Option<UnabortableTransactionError>>,
}

impl SledTxn<'_> {
    fn check<T>(&self, r: std::result::Result<T, UnabortableTransactionError>, op: &str) -> Result<T> {
        r.map_err(|e| {
            let reason = format!("sled {op} failed: {e}");
            self.interrupted.set(Some(e));
            TandemError::StorageError { reason }
        })
    }

    fn get(&self, tree: &TransactionalTree, key: &[u8]) -> Result<Option<sled::IVec>> {
        self.check(tree.get(key), "get")
    }

    fn put(&self, tree: &TransactionalTree, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.check(tree.insert(key, value), "insert").map(|_| ())
    }
}

impl RecordAccess for SledTxn<'_> {
    fn load_links(&self, identity: &IdentityKey) -> Result<LinkSet> {
        match self.get(self.links, identity.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Ok(LinkSet::default()),
        }
    }

    fn store_links(&mut self, identity: &IdentityKey, links: &LinkSet) -> Result<()> {
        if links.links.is_empty() {
            return self
                .check(self.links.remove(identity.as_bytes().as_slice()), "remove")
                .map(|_| ());
        }
        self.put(self.links, identity.as_bytes(), encode(links)?)
    }

    fn load_conversation(&self, identity: &IdentityKey) -> Result<ConversationRecord> {
        match self.get(self.conversations, identity.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Ok(ConversationRecord::default()),
        }
    }

    fn store_conversation(&mut self, identity: &IdentityKey, record: &ConversationRecord) -> Result<()> {
        self.put(self.conversations, identity.as_bytes(), encode(record)?)
    }

    fn load_flag(&self, key: &[u8]) -> Result<bool> {
        match self.get(self.local, key)? {
            Some(bytes) => decode(&bytes),
            None => Ok(false),
        }
    }

    fn store_flag(&mut self, key: &[u8], value: bool) -> Result<()> {
        self.put(self.local, key, encode(&value)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
