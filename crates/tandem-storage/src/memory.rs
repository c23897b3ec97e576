//! In-process link store.
//!
//! A transaction runs against a private copy of the state and the copy
//! replaces the shared state only if the closure succeeds. The lock is
//! held for the whole transaction, so transactions are serialized.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tandem_types::{IdentityKey, Result, TandemError};

use crate::records::{ConversationRecord, LinkSet, RecordAccess};
use crate::{LinkStore, StoreTxn};

#[derive(Clone, Debug, Default)]
struct MemoryState {
    links: HashMap<IdentityKey, LinkSet>,
    conversations: HashMap<IdentityKey, ConversationRecord>,
    flags: HashSet<Vec<u8>>,
}

impl RecordAccess for MemoryState {
    fn load_links(&self, identity: &IdentityKey) -> Result<LinkSet> {
        Ok(self.links.get(identity).cloned().unwrap_or_default())
    }

    fn store_links(&mut self, identity: &IdentityKey, links: &LinkSet) -> Result<()> {
        if links.links.is_empty() {
            self.links.remove(identity);
        } else {
            self.links.insert(*identity, links.clone());
        }
        Ok(())
    }

    fn load_conversation(&self, identity: &IdentityKey) -> Result<ConversationRecord> {
        Ok(self.conversations.get(identity).cloned().unwrap_or_default())
    }

    fn store_conversation(&mut self, identity: &IdentityKey, record: &ConversationRecord) -> Result<()> {
        self.conversations.insert(*identity, record.clone());
        Ok(())
    }

    fn load_flag(&self, key: &[u8]) -> Result<bool> {
        Ok(self.flags.contains(key))
    }

    fn store_flag(&mut self, key: &[u8], value: bool) -> Result<()> {
        if value {
            self.flags.insert(key.to_vec());
        } else {
            self.flags.remove(key);
        }
        Ok(())
    }
}

/// Link store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryLinkStore {
    state: Mutex<MemoryState>,
}

impl MemoryLinkStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LinkStore for MemoryLinkStore {
    fn transaction(&self, f: &dyn Fn(&mut dyn StoreTxn) -> Result<()>) -> Result<()> {
        let mut guard = self.state.lock().map_err(|_| TandemError::StorageError {
            reason: "memory store lock poisoned".into(),
        })?;
        let mut working = guard.clone();
        f(&mut working)?;
        *guard = working;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
