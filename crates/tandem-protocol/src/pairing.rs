//! Canonical pairing payload and device-link signature checks.
//!
//! Both halves of a device link are signatures over the **same**
//! payload:
//!
//! ```text
//! "tandem-device-link-v1" || master (32 bytes) || slave (32 bytes)
//! ```
//!
//! The encoding is fixed-width and identical in both directions, so a
//! slave signature can never be replayed as a master signature for the
//! reversed pairing (the positions of the two keys differ).

use tandem_types::{DeviceLink, IdentityKey, LocalSigner, Result, Signature, TandemError, Verifier};

/// Domain separation tag prefixed to every pairing payload.
const PAIRING_DOMAIN: &[u8] = b"tandem-device-link-v1";

/// Length of a pairing payload.
pub const PAIRING_PAYLOAD_LEN: usize = PAIRING_DOMAIN.len() + 2 * IdentityKey::LEN;

/// Builds the canonical pairing payload for `master` and `slave`.
pub fn pairing_payload(master: &IdentityKey, slave: &IdentityKey) -> Vec<u8> {
    let mut payload = Vec::with_capacity(PAIRING_PAYLOAD_LEN);
    payload.extend_from_slice(PAIRING_DOMAIN);
    payload.extend_from_slice(master.as_bytes());
    payload.extend_from_slice(slave.as_bytes());
    payload
}

/// Signs the pairing of `master` and `slave` with the local identity.
///
/// The local identity must be one of the two sides; which signature
/// this produces (master or slave) follows from its position.
///
/// # Errors
///
/// - `ProtocolState` if the signer is neither `master` nor `slave`.
pub fn sign_pairing(
    signer: &dyn LocalSigner,
    master: &IdentityKey,
    slave: &IdentityKey,
) -> Result<Signature> {
    let local = signer.identity();
    if local != *master && local != *slave {
        return Err(TandemError::ProtocolState {
            reason: format!("local identity {local} is not part of the pairing"),
        });
    }
    Ok(signer.sign(&pairing_payload(master, slave)))
}

/// Verifies the slave half of a proposed pairing.
///
/// # Errors
///
/// - `VerificationFailed` if the signature was not made by `slave`.
pub fn verify_slave_signature(
    verifier: &dyn Verifier,
    master: &IdentityKey,
    slave: &IdentityKey,
    slave_signature: &Signature,
) -> Result<()> {
    if master == slave {
        return Err(TandemError::VerificationFailed {
            reason: "a device cannot link to itself".into(),
        });
    }
    let payload = pairing_payload(master, slave);
    if !verifier.verify(&payload, slave_signature, slave) {
        return Err(TandemError::VerificationFailed {
            reason: format!("invalid slave signature for {slave}"),
        });
    }
    Ok(())
}

/// Verifies both signatures of a device link.
///
/// A link is valid only when the slave signature verifies against
/// `link.slave` and the master signature verifies against
/// `link.master`, both over the canonical pairing payload.
///
/// # Errors
///
/// - `VerificationFailed` naming the side whose signature is invalid.
pub fn verify_device_link(verifier: &dyn Verifier, link: &DeviceLink) -> Result<()> {
    verify_slave_signature(verifier, &link.master, &link.slave, &link.slave_signature)?;

    let payload = pairing_payload(&link.master, &link.slave);
    if !verifier.verify(&payload, &link.master_signature, &link.master) {
        return Err(TandemError::VerificationFailed {
            reason: format!("invalid master signature for {}", link.master),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
