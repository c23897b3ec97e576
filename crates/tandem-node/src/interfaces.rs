//! Collaborators the multi-device core consumes but does not own.
//!
//! The directory (where device links are published and looked up),
//! the transport (which actually delivers serialized messages), and the
//! application-wide data wipe are all injected behind these traits so
//! the protocol logic can run against in-memory doubles.

use std::collections::HashSet;

use async_trait::async_trait;
use tandem_protocol::{OutgoingMessage, Recipient};
use tandem_types::{DeviceLink, IdentityKey, MessageId, Result};

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// Network-visible directory of device links.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Fetches the device links published for `master`.
    ///
    /// # Errors
    ///
    /// - `DirectoryParse` if the directory answered with data that
    ///   could not be parsed.
    /// - `NetworkError` for every other failure.
    async fn fetch_device_links(&self, master: &IdentityKey) -> Result<HashSet<DeviceLink>>;

    /// Publishes a freshly committed link.
    async fn publish_device_link(&self, link: &DeviceLink) -> Result<()>;

    /// Withdraws a revoked link.
    async fn unpublish_device_link(&self, link: &DeviceLink) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Acknowledgement returned by the transport for an accepted send.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SendReceipt {
    /// Identifier of the message that was handed off.
    pub message_id: MessageId,
    /// Where it was sent.
    pub recipient: Recipient,
}

/// Message delivery layer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `message` to `recipient`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryFailed` if the message could not be handed off.
    async fn send(&self, message: OutgoingMessage, recipient: Recipient) -> Result<SendReceipt>;
}

// ---------------------------------------------------------------------------
// DataWipe
// ---------------------------------------------------------------------------

/// Application-wide wipe of local user data, run after a corroborated
/// unlink.
#[async_trait]
pub trait DataWipe: Send + Sync {
    /// Erases local data. Called at most once per unlink.
    async fn wipe_local_data(&self) -> Result<()>;
}
