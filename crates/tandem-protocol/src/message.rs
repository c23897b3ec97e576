//! Outgoing message model consumed by the fanout dispatcher.
//!
//! Envelope encryption and encoding happen below the transport
//! boundary; the core only needs the message classification, the
//! addressed recipient and an opaque body.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tandem_crypto::hash::compute_message_id;
use tandem_types::{GroupId, IdentityKey, MessageId, Nonce, Result, TandemError, Timestamp};

use crate::link_message::DeviceLinkMessage;

// ---------------------------------------------------------------------------
// Recipient
// ---------------------------------------------------------------------------

/// Literal addressee of a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Recipient {
    /// A single device identity.
    Device(IdentityKey),
    /// A group / broadcast destination.
    Group(GroupId),
}

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// Classification that drives fanout and friend-request gating.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Regular user content.
    Text,
    /// Silent / ephemeral signal (typing indicators, receipts).
    Ephemeral,
    /// Sync-only message between the user's own devices.
    Sync,
    /// Trust-establishment request.
    FriendRequest,
    /// Session negotiation (session request / restore).
    SessionRequest,
    /// Device-linking request or authorization.
    DeviceLink,
    /// Unlink notification from a master to one of its slaves.
    Unlink,
}

impl MessageKind {
    /// Returns `true` for messages of the device-link protocol itself.
    pub fn is_device_link_protocol(self) -> bool {
        matches!(self, Self::DeviceLink | Self::Unlink)
    }

    /// Returns `true` for classes that may be delivered to an
    /// identity without an established friendship.
    pub fn is_trust_exempt(self) -> bool {
        matches!(
            self,
            Self::Ephemeral | Self::Sync | Self::FriendRequest | Self::SessionRequest
        )
    }
}

// ---------------------------------------------------------------------------
// OutgoingMessage
// ---------------------------------------------------------------------------

/// A message ready to hand to the transport layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Deterministic identifier.
    pub id: MessageId,
    /// Identity of the sending device.
    pub sender: IdentityKey,
    /// Addressee.
    pub recipient: Recipient,
    /// Classification.
    pub kind: MessageKind,
    /// Opaque body (plaintext before envelope encryption).
    pub body: Vec<u8>,
    /// Creation time.
    pub timestamp: Timestamp,
}

impl OutgoingMessage {
    /// Builds a new message with a fresh random nonce.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError` if the OS random source fails.
    pub fn new(sender: IdentityKey, recipient: Recipient, kind: MessageKind, body: Vec<u8>) -> Result<Self> {
        let mut nonce_bytes = [0u8; 12];
        OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(|e| TandemError::CryptoError {
                reason: format!("failed to generate message nonce: {e}"),
            })?;
        let timestamp = Timestamp::now();
        let id = compute_message_id(&sender, &timestamp, &Nonce::new(nonce_bytes));

        Ok(Self {
            id,
            sender,
            recipient,
            kind,
            body,
            timestamp,
        })
    }

    /// Builds a plain text message to a single device identity.
    pub fn text(sender: IdentityKey, recipient: IdentityKey, text: &str) -> Result<Self> {
        Self::new(sender, Recipient::Device(recipient), MessageKind::Text, text.as_bytes().to_vec())
    }

    /// Builds an auto-generated friend request to `recipient`.
    pub fn friend_request(sender: IdentityKey, recipient: IdentityKey, text: &str) -> Result<Self> {
        Self::new(
            sender,
            Recipient::Device(recipient),
            MessageKind::FriendRequest,
            text.as_bytes().to_vec(),
        )
    }

    /// Wraps a device-link protocol message addressed to `recipient`.
    pub fn device_link(sender: IdentityKey, recipient: IdentityKey, message: &DeviceLinkMessage) -> Result<Self> {
        let body = message.to_payload().to_cbor()?;
        Self::new(sender, Recipient::Device(recipient), MessageKind::DeviceLink, body)
    }

    /// Builds an unlink notification to `slave`.
    pub fn unlink(sender: IdentityKey, slave: IdentityKey) -> Result<Self> {
        Self::new(sender, Recipient::Device(slave), MessageKind::Unlink, Vec::new())
    }

    /// Returns a copy addressed to a different device, keeping the
    /// same identifier and content.
    pub fn retarget(&self, device: IdentityKey) -> Self {
        Self {
            recipient: Recipient::Device(device),
            ..self.clone()
        }
    }

    /// Returns `true` if the message is addressed to a group.
    pub fn is_group(&self) -> bool {
        matches!(self.recipient, Recipient::Group(_))
    }

    /// Returns `true` if the message must go to its literal recipient
    /// only, without multi-device fanout.
    pub fn bypasses_fanout(&self) -> bool {
        self.is_group() || self.kind.is_device_link_protocol()
    }

    /// Returns `true` if the message may be sent to an identity that
    /// is not yet a friend.
    pub fn is_trust_exempt(&self) -> bool {
        self.is_group() || self.kind.is_trust_exempt()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
