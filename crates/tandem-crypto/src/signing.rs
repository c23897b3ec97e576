//! Ed25519 digital signature operations.
//!
//! Provides keypair generation, signing, and verification over raw
//! identity keys. The private key is zeroized on drop via
//! `ed25519-dalek`'s built-in `ZeroizeOnDrop`.
//!
//! [`Keypair`] implements [`LocalSigner`] and [`Ed25519Verifier`]
//! implements [`Verifier`]; these are the production capabilities
//! injected into the multi-device core.

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use tandem_types::{IdentityKey, LocalSigner, Result, Signature, TandemError, Verifier};

// ---------------------------------------------------------------------------
// Keypair
// ---------------------------------------------------------------------------

/// Ed25519 signing keypair for one device identity.
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generates a new random keypair using OS-level entropy.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstructs a keypair deterministically from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Returns the identity key (public half) of this keypair.
    pub fn identity(&self) -> IdentityKey {
        IdentityKey::new(self.signing_key.verifying_key().to_bytes())
    }

    /// Signs an arbitrary message and returns the Ed25519 signature.
    ///
    /// Deterministic per RFC 8032.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from_bytes(self.signing_key.sign(message).to_bytes())
    }
}

// Keypair intentionally does not implement Clone or Debug to prevent
// accidental leakage of the private key in logs or copies.

impl LocalSigner for Keypair {
    fn identity(&self) -> IdentityKey {
        Keypair::identity(self)
    }

    fn sign(&self, payload: &[u8]) -> Signature {
        Keypair::sign(self, payload)
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Verifies an Ed25519 signature made by `identity` over `message`.
///
/// Uses strict verification (rejects small-order keys and
/// non-canonical signatures).
///
/// # Errors
///
/// - `InvalidIdentity` if `identity` is not a valid curve point.
/// - `VerificationFailed` if the signature does not verify.
pub fn verify(identity: &IdentityKey, message: &[u8], signature: &Signature) -> Result<()> {
    let vk = VerifyingKey::from_bytes(identity.as_bytes()).map_err(|e| TandemError::InvalidIdentity {
        reason: format!("not an Ed25519 public key: {e}"),
    })?;
    let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
    vk.verify_strict(message, &sig)
        .map_err(|e| TandemError::VerificationFailed {
            reason: format!("signature verification failed: {e}"),
        })
}

/// Production [`Verifier`] backed by Ed25519 strict verification.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
    fn verify(&self, payload: &[u8], signature: &Signature, claimed_key: &IdentityKey) -> bool {
        verify(claimed_key, payload, signature).is_ok()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
