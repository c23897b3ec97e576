//! Core shared types for the Tandem multi-device linking core.
//!
//! This crate defines the fundamental types used across the workspace:
//! identity keys, signatures, device links, resolved destinations,
//! friend-request status, diagnostic events, the central error type,
//! and the signing/verification capabilities injected into the core.

pub mod config;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// IdentityKey
// ---------------------------------------------------------------------------

/// Long-term Ed25519 public key identifying one device's messaging
/// identity.
///
/// Used as the primary key throughout: device links, resolution
/// cache entries, conversation records and send destinations are all
/// keyed by it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey([u8; 32]);

impl IdentityKey {
    /// The fixed byte length of an identity key.
    pub const LEN: usize = 32;

    /// Creates a new `IdentityKey` from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parses an identity key from a byte slice of exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| TandemError::InvalidIdentity {
            reason: format!("expected {} bytes, got {}", Self::LEN, bytes.len()),
        })?;
        Ok(Self(arr))
    }
}

impl From<[u8; 32]> for IdentityKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for IdentityKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for IdentityKey {
    type Err = TandemError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| TandemError::InvalidIdentity {
            reason: "invalid hex encoding".into(),
        })?;
        Self::from_slice(&bytes)
    }
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// Ed25519 signature (64 bytes).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Fixed byte length of an Ed25519 signature.
    pub const LEN: usize = 64;

    /// Creates a [`Signature`] from raw bytes.
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Parses a signature from a byte slice of exactly 64 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 64] = bytes.try_into().map_err(|_| TandemError::MalformedPayload {
            reason: format!("expected {}-byte signature, got {}", Self::LEN, bytes.len()),
        })?;
        Ok(Self(arr))
    }

    /// Returns the underlying 64-byte array.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct SigVisitor;

        impl<'de> serde::de::Visitor<'de> for SigVisitor {
            type Value = Signature;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("64 bytes for Ed25519 signature")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> std::result::Result<Signature, E> {
                let arr: [u8; 64] = v
                    .try_into()
                    .map_err(|_| E::invalid_length(v.len(), &"64"))?;
                Ok(Signature(arr))
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Signature, A::Error> {
                let mut arr = [0u8; 64];
                for (i, byte) in arr.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &"64"))?;
                }
                Ok(Signature(arr))
            }
        }

        deserializer.deserialize_bytes(SigVisitor)
    }
}

// ---------------------------------------------------------------------------
// MessageId / Nonce / GroupId
// ---------------------------------------------------------------------------

/// Deterministic message identifier: SHA3-256(sender || timestamp || nonce).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MessageId([u8; 32]);

impl MessageId {
    /// Creates a new `MessageId` from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// 96-bit random per-message nonce.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Nonce([u8; 12]);

impl Nonce {
    /// Creates a new `Nonce` from raw bytes.
    pub fn new(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl AsRef<[u8]> for Nonce {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Identifier of a group (broadcast) destination.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct GroupId([u8; 32]);

impl GroupId {
    /// Creates a new `GroupId` from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// UTC timestamp.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a `Timestamp` representing the current UTC time.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a `Timestamp` from a `DateTime<Utc>`.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Returns the inner `DateTime<Utc>`.
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// DeviceLink
// ---------------------------------------------------------------------------

/// An attested pairing of one master identity and one slave identity.
///
/// `slave_signature` proves the slave requested the link,
/// `master_signature` proves the master authorized it. Both are made
/// over the same canonical pairing payload (see
/// `tandem_protocol::pairing`).
///
/// Equality and hashing consider only the `(master, slave)` pair: two
/// records for the same pairing are the same link regardless of which
/// copy of the signatures they carry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceLink {
    /// Identity that anchors the linked set.
    pub master: IdentityKey,
    /// Identity that presents as `master` to peers.
    pub slave: IdentityKey,
    /// Signature by `master` over the pairing payload.
    pub master_signature: Signature,
    /// Signature by `slave` over the pairing payload.
    pub slave_signature: Signature,
}

impl DeviceLink {
    /// Returns `true` if `identity` is either side of this link.
    pub fn involves(&self, identity: &IdentityKey) -> bool {
        self.master == *identity || self.slave == *identity
    }

    /// Returns `true` if this link pairs exactly `master` and `slave`.
    pub fn pairs(&self, master: &IdentityKey, slave: &IdentityKey) -> bool {
        self.master == *master && self.slave == *slave
    }

    /// Returns the identity on the other side of the link from `identity`.
    pub fn other(&self, identity: &IdentityKey) -> Option<IdentityKey> {
        if self.master == *identity {
            Some(self.slave)
        } else if self.slave == *identity {
            Some(self.master)
        } else {
            None
        }
    }
}

impl PartialEq for DeviceLink {
    fn eq(&self, other: &Self) -> bool {
        self.master == other.master && self.slave == other.slave
    }
}

impl Eq for DeviceLink {}

impl Hash for DeviceLink {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.master.hash(state);
        self.slave.hash(state);
    }
}

// ---------------------------------------------------------------------------
// Destination
// ---------------------------------------------------------------------------

/// Role of a device within a resolved destination set.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DeviceRole {
    /// The anchor of the linked set. Exactly one per set.
    Master,
    /// A device linked to the master.
    Slave,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Slave => write!(f, "slave"),
        }
    }
}

/// A resolved, device-scoped send target.
///
/// The role is always recomputed from the device-link store at
/// resolution time and never persisted.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Destination {
    /// Identity key of the receiving device.
    pub identity: IdentityKey,
    /// Role of that device in the target's linked set.
    pub role: DeviceRole,
}

impl Destination {
    /// Creates a master destination.
    pub fn master(identity: IdentityKey) -> Self {
        Self { identity, role: DeviceRole::Master }
    }

    /// Creates a slave destination.
    pub fn slave(identity: IdentityKey) -> Self {
        Self { identity, role: DeviceRole::Slave }
    }
}

// ---------------------------------------------------------------------------
// FriendRequestStatus
// ---------------------------------------------------------------------------

/// Friend-request (direct trust) status of a conversation.
///
/// Plaintext content is only delivered to identities in the
/// `Friends` state; everyone else receives an auto-generated friend
/// request in its place.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum FriendRequestStatus {
    /// No friend request has been exchanged.
    #[default]
    None,
    /// A friend request is being sent.
    RequestSending,
    /// A friend request was sent and is awaiting acceptance.
    RequestSent,
    /// A friend request was received from the peer.
    RequestReceived,
    /// Direct trust is established.
    Friends,
    /// A previously sent friend request expired unanswered.
    RequestExpired,
}

impl FriendRequestStatus {
    /// Returns `true` if direct trust is established.
    pub fn is_friends(self) -> bool {
        self == Self::Friends
    }

    /// Returns `true` if sending a friend request should move the
    /// status to `RequestSent`.
    pub fn can_send_request(self) -> bool {
        matches!(self, Self::None | Self::RequestExpired)
    }
}

impl fmt::Display for FriendRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::RequestSending => write!(f, "request_sending"),
            Self::RequestSent => write!(f, "request_sent"),
            Self::RequestReceived => write!(f, "request_received"),
            Self::Friends => write!(f, "friends"),
            Self::RequestExpired => write!(f, "request_expired"),
        }
    }
}

// ---------------------------------------------------------------------------
// LinkEvent
// ---------------------------------------------------------------------------

/// Diagnostic and progress events emitted by the multi-device core to
/// the UI / application layer.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    /// A master-side session received a verified linking request and
    /// awaits the user's authorization.
    LinkingRequestReceived {
        /// Identity asking to become a slave.
        slave: IdentityKey,
    },
    /// A device link was committed to the local store.
    DeviceLinked {
        /// The committed link.
        link: DeviceLink,
    },
    /// The active linking session was aborted.
    LinkingFailed {
        /// Human-readable failure description.
        reason: String,
    },
    /// The active linking session exceeded its timeout.
    LinkingTimedOut,
    /// A linking request arrived while no master-side session was open.
    UnexpectedLinkingRequest {
        /// Sender of the dropped request.
        sender: IdentityKey,
    },
    /// A linking authorization arrived with no matching session.
    UnexpectedAuthorization {
        /// Sender of the dropped authorization.
        sender: IdentityKey,
    },
    /// An unlink notification failed validation and was ignored.
    UnlinkRejected {
        /// Claimed sender of the notification.
        sender: IdentityKey,
        /// Which check failed.
        reason: String,
    },
    /// This device was unlinked from its master and wiped.
    Unlinked {
        /// The master that revoked this device.
        master: IdentityKey,
    },
    /// A slave was revoked locally by this (master) device.
    SlaveRevoked {
        /// The revoked slave.
        slave: IdentityKey,
    },
}

// ---------------------------------------------------------------------------
// TandemError
// ---------------------------------------------------------------------------

/// Central error type for the Tandem workspace.
///
/// All crates convert their internal errors into variants of this
/// enum. It is `Clone` so a single in-flight directory refresh can
/// report the same outcome to several waiting callers.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum TandemError {
    /// An identity key is malformed.
    #[error("invalid identity: {reason}")]
    InvalidIdentity {
        /// Human-readable description of why the key is invalid.
        reason: String,
    },

    /// A signature or claimed identity did not verify.
    #[error("verification failed: {reason}")]
    VerificationFailed {
        /// Human-readable description of the mismatch.
        reason: String,
    },

    /// A device-link payload is missing fields or cannot be decoded.
    #[error("malformed payload: {reason}")]
    MalformedPayload {
        /// Human-readable description of the defect.
        reason: String,
    },

    /// The directory returned data that could not be parsed.
    #[error("directory parse error: {reason}")]
    DirectoryParse {
        /// Human-readable description of the parse failure.
        reason: String,
    },

    /// A directory or network operation failed.
    #[error("network error: {reason}")]
    NetworkError {
        /// Human-readable description of the network failure.
        reason: String,
    },

    /// The transport failed to deliver a message.
    #[error("delivery failed: {reason}")]
    DeliveryFailed {
        /// Human-readable description of the delivery failure.
        reason: String,
    },

    /// A storage operation failed.
    #[error("storage error: {reason}")]
    StorageError {
        /// Human-readable description of the storage failure.
        reason: String,
    },

    /// An operation is not valid in the current protocol state.
    #[error("protocol state error: {reason}")]
    ProtocolState {
        /// Human-readable description of the state conflict.
        reason: String,
    },

    /// A cryptographic operation failed.
    #[error("crypto error: {reason}")]
    CryptoError {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// A configuration value is invalid or missing.
    #[error("config error: {reason}")]
    ConfigError {
        /// Human-readable description of the configuration problem.
        reason: String,
    },
}

impl TandemError {
    /// Returns `true` for the parsing-class directory failure, which
    /// resolution treats as "no new information".
    pub fn is_directory_parse(&self) -> bool {
        matches!(self, Self::DirectoryParse { .. })
    }
}

// ---------------------------------------------------------------------------
// Signing capabilities
// ---------------------------------------------------------------------------

/// Signature verification capability.
///
/// Injected into the core so protocol logic can be exercised with a
/// fake verifier.
pub trait Verifier: Send + Sync {
    /// Returns `true` if `signature` over `payload` was made by the
    /// private half of `claimed_key`.
    fn verify(&self, payload: &[u8], signature: &Signature, claimed_key: &IdentityKey) -> bool;
}

/// The local device's signing identity.
pub trait LocalSigner: Send + Sync {
    /// Identity key of the local device.
    fn identity(&self) -> IdentityKey;

    /// Signs `payload` with the local device's private key.
    fn sign(&self, payload: &[u8]) -> Signature;
}

// ---------------------------------------------------------------------------
// Result alias
// ---------------------------------------------------------------------------

/// Convenience result type using [`TandemError`].
pub type Result<T> = std::result::Result<T, TandemError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
