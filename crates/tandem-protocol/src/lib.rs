//! Device-link protocol structures for the Tandem multi-device core.
//!
//! # Modules
//!
//! - [`pairing`]: canonical pairing payload and link signature checks
//! - [`link_message`]: linking request / authorization wire payloads
//! - [`message`]: outgoing message model and classification

pub mod link_message;
pub mod message;
pub mod pairing;

pub use link_message::{DeviceLinkMessage, DeviceLinkPayload, LinkingAuthorization, LinkingProfile, LinkingRequest};
pub use message::{MessageKind, OutgoingMessage, Recipient};
