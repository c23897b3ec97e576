//! Device-link protocol messages.
//!
//! On the wire a linking message is a single [`DeviceLinkPayload`]
//! with four identity/signature fields. The presence of
//! `master_signature` distinguishes an authorization from a request.
//! Every field is optional at the wire level so a malformed payload
//! can be decoded and then rejected by [`DeviceLinkMessage::parse`]
//! with a precise reason, instead of failing opaquely in the decoder.

use serde::{Deserialize, Serialize};
use tandem_types::{DeviceLink, IdentityKey, Result, Signature, TandemError};

// ---------------------------------------------------------------------------
// LinkingProfile
// ---------------------------------------------------------------------------

/// Display metadata an authorizing master may attach to its
/// authorization. Applied to the master's conversation record on the
/// slave.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct LinkingProfile {
    /// Display name of the master identity.
    pub display_name: Option<String>,
    /// Location of the master's avatar.
    pub avatar_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Wire payload
// ---------------------------------------------------------------------------

/// Raw device-link payload as carried on the wire (CBOR).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceLinkPayload {
    /// Identity that will anchor the linked set.
    pub master_identity: Option<IdentityKey>,
    /// Identity asking to be linked.
    pub slave_identity: Option<IdentityKey>,
    /// Present only on authorizations.
    pub master_signature: Option<Signature>,
    /// Signature made by the slave when it requested the link.
    pub slave_signature: Option<Signature>,
    /// Optional master profile metadata (authorizations only).
    pub profile: Option<LinkingProfile>,
}

impl DeviceLinkPayload {
    /// Encodes the payload as CBOR.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| TandemError::MalformedPayload {
            reason: format!("CBOR serialization failed: {e}"),
        })?;
        Ok(buf)
    }

    /// Decodes a payload from CBOR.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if the bytes are not a valid payload.
    pub fn from_cbor(data: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(data).map_err(|e| TandemError::MalformedPayload {
            reason: format!("failed to decode device-link payload: {e}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Typed messages
// ---------------------------------------------------------------------------

/// A slave's request to be linked under `master`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkingRequest {
    /// Device asked to become master.
    pub master: IdentityKey,
    /// Device asking to become slave.
    pub slave: IdentityKey,
    /// Slave's signature over the pairing payload.
    pub slave_signature: Signature,
}

/// A master's authorization completing a linking request.
#[derive(Clone, Debug)]
pub struct LinkingAuthorization {
    /// The fully signed link.
    pub link: DeviceLink,
    /// Optional master profile metadata.
    pub profile: Option<LinkingProfile>,
}

/// A validated device-link protocol message.
#[derive(Clone, Debug)]
pub enum DeviceLinkMessage {
    /// First message of the handshake, slave to master.
    Request(LinkingRequest),
    /// Second message of the handshake, master to slave.
    Authorization(LinkingAuthorization),
}

impl DeviceLinkMessage {
    /// Validates a raw payload into a typed message.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if the master identity, slave
    /// identity, or slave signature is missing. Signatures are **not**
    /// verified here.
    pub fn parse(payload: DeviceLinkPayload) -> Result<Self> {
        let master = payload.master_identity.ok_or_else(|| missing("master_identity"))?;
        let slave = payload.slave_identity.ok_or_else(|| missing("slave_identity"))?;
        let slave_signature = payload.slave_signature.ok_or_else(|| missing("slave_signature"))?;

        Ok(match payload.master_signature {
            Some(master_signature) => Self::Authorization(LinkingAuthorization {
                link: DeviceLink {
                    master,
                    slave,
                    master_signature,
                    slave_signature,
                },
                profile: payload.profile,
            }),
            None => Self::Request(LinkingRequest {
                master,
                slave,
                slave_signature,
            }),
        })
    }

    /// Decodes and validates a CBOR payload in one step.
    pub fn from_cbor(data: &[u8]) -> Result<Self> {
        Self::parse(DeviceLinkPayload::from_cbor(data)?)
    }

    /// Converts back into the wire representation.
    pub fn to_payload(&self) -> DeviceLinkPayload {
        match self {
            Self::Request(req) => DeviceLinkPayload {
                master_identity: Some(req.master),
                slave_identity: Some(req.slave),
                master_signature: None,
                slave_signature: Some(req.slave_signature),
                profile: None,
            },
            Self::Authorization(auth) => DeviceLinkPayload {
                master_identity: Some(auth.link.master),
                slave_identity: Some(auth.link.slave),
                master_signature: Some(auth.link.master_signature),
                slave_signature: Some(auth.link.slave_signature),
                profile: auth.profile.clone(),
            },
        }
    }

    /// The master identity named by the message.
    pub fn master(&self) -> IdentityKey {
        match self {
            Self::Request(req) => req.master,
            Self::Authorization(auth) => auth.link.master,
        }
    }

    /// The slave identity named by the message.
    pub fn slave(&self) -> IdentityKey {
        match self {
            Self::Request(req) => req.slave,
            Self::Authorization(auth) => auth.link.slave,
        }
    }
}

fn missing(field: &str) -> TandemError {
    TandemError::MalformedPayload {
        reason: format!("device-link payload is missing {field}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
