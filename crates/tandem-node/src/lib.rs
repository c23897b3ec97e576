//! Tandem multi-device core.
//!
//! Lets one identity operate from several linked devices:
//!
//! - [`session`]: the device-linking handshake state machine.
//! - [`resolver`]: identity to destination-set resolution with a
//!   per-identity refresh cache.
//! - [`fanout`]: delivery of one message to every device of its
//!   target, with friend-request gating.
//! - [`unlink`]: validation of unlink notifications.
//! - [`service`]: the coordinator owning all process-wide state.
//!
//! Collaborators (directory, transport, data wipe) are injected through
//! the traits in [`interfaces`].

pub mod fanout;
pub mod interfaces;
pub mod resolver;
pub mod service;
pub mod session;
pub mod unlink;

pub use fanout::{Delivery, DispatchReport, FanoutDispatcher};
pub use interfaces::{DataWipe, Directory, SendReceipt, Transport};
pub use resolver::DestinationResolver;
pub use service::{Collaborators, DropReason, IncomingOutcome, MultiDeviceService};
pub use session::{LinkingSession, SessionRole, SessionState};
pub use unlink::{UnlinkGuard, UnlinkOutcome, UnlinkRejection};
