//! Cryptographic primitives for the Tandem multi-device core.
//!
//! - [`signing`]: Ed25519 keypairs, signing, and verification
//! - [`hash`]: message identifiers (SHA3-256)

pub mod hash;
pub mod signing;

pub use signing::{Ed25519Verifier, Keypair};
