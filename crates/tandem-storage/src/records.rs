//! Stored record types and the record-level operations shared by every
//! backend.
//!
//! A backend only has to expose raw get/put of three record kinds
//! through [`RecordAccess`]; the [`StoreTxn`] semantics (links written
//! to both sides, master lookup, profile merge) are implemented once on
//! top of it.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tandem_protocol::LinkingProfile;
use tandem_types::{DeviceLink, FriendRequestStatus, IdentityKey, Result, TandemError};

use crate::StoreTxn;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Per-identity conversation state relevant to multi-device delivery.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// Trust state of the conversation.
    pub friend_request_status: FriendRequestStatus,
    /// Display name, if known.
    pub display_name: Option<String>,
    /// Avatar location, if known.
    pub avatar_url: Option<String>,
}

/// Device links stored under one identity.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LinkSet {
    /// Links the identity participates in, as master or slave.
    pub links: Vec<DeviceLink>,
}

/// Key of the local "unlinked" flag in the local-state keyspace.
pub(crate) const UNLINKED_KEY: &[u8] = b"unlinked";

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| TandemError::StorageError {
        reason: format!("record serialization failed: {e}"),
    })
}

pub(crate) fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| TandemError::StorageError {
        reason: format!("record deserialization failed: {e}"),
    })
}

// ---------------------------------------------------------------------------
// RecordAccess
// ---------------------------------------------------------------------------

/// Raw record access inside one transaction.
///
/// Implementing this gives a backend its [`StoreTxn`] for free.
pub trait RecordAccess {
    fn load_links(&self, identity: &IdentityKey) -> Result<LinkSet>;
    fn store_links(&mut self, identity: &IdentityKey, links: &LinkSet) -> Result<()>;
    fn load_conversation(&self, identity: &IdentityKey) -> Result<ConversationRecord>;
    fn store_conversation(&mut self, identity: &IdentityKey, record: &ConversationRecord) -> Result<()>;
    fn load_flag(&self, key: &[u8]) -> Result<bool>;
    fn store_flag(&mut self, key: &[u8], value: bool) -> Result<()>;
}

fn upsert(set: &mut LinkSet, link: &DeviceLink) {
    set.links.retain(|existing| existing != link);
    set.links.push(link.clone());
}

fn remove_pair(set: &mut LinkSet, master: &IdentityKey, slave: &IdentityKey) -> bool {
    let before = set.links.len();
    set.links.retain(|l| !l.pairs(master, slave));
    set.links.len() != before
}

impl<T: RecordAccess> StoreTxn for T {
    fn master_of(&self, identity: &IdentityKey) -> Result<Option<IdentityKey>> {
        let set = self.load_links(identity)?;
        Ok(set
            .links
            .iter()
            .filter(|l| l.slave == *identity)
            .map(|l| l.master)
            .min())
    }

    fn device_links(&self, identity: &IdentityKey) -> Result<HashSet<DeviceLink>> {
        Ok(self.load_links(identity)?.links.into_iter().collect())
    }

    fn put_device_link(&mut self, link: &DeviceLink) -> Result<()> {
        for side in [link.master, link.slave] {
            let mut set = self.load_links(&side)?;
            upsert(&mut set, link);
            self.store_links(&side, &set)?;
        }
        Ok(())
    }

    fn remove_device_link(&mut self, master: &IdentityKey, slave: &IdentityKey) -> Result<bool> {
        let mut removed = false;
        for side in [*master, *slave] {
            let mut set = self.load_links(&side)?;
            if remove_pair(&mut set, master, slave) {
                removed = true;
                self.store_links(&side, &set)?;
            }
        }
        Ok(removed)
    }

    fn friend_request_status(&self, identity: &IdentityKey) -> Result<FriendRequestStatus> {
        Ok(self.load_conversation(identity)?.friend_request_status)
    }

    fn set_friend_request_status(&mut self, identity: &IdentityKey, status: FriendRequestStatus) -> Result<()> {
        let mut record = self.load_conversation(identity)?;
        record.friend_request_status = status;
        self.store_conversation(identity, &record)
    }

    fn conversation(&self, identity: &IdentityKey) -> Result<ConversationRecord> {
        self.load_conversation(identity)
    }

    fn apply_profile(&mut self, identity: &IdentityKey, profile: &LinkingProfile) -> Result<()> {
        let mut record = self.load_conversation(identity)?;
        if let Some(name) = &profile.display_name {
            record.display_name = Some(name.clone());
        }
        if let Some(url) = &profile.avatar_url {
            record.avatar_url = Some(url.clone());
        }
        self.store_conversation(identity, &record)
    }

    fn is_unlinked(&self) -> Result<bool> {
        self.load_flag(UNLINKED_KEY)
    }

    fn set_unlinked(&mut self, unlinked: bool) -> Result<()> {
        self.store_flag(UNLINKED_KEY, unlinked)
    }
}
