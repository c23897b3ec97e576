//! Multi-device message fanout with friend-request gating.
//!
//! [`FanoutDispatcher::dispatch`] sends one outgoing message to every
//! device of the target identity:
//!
//! 1. Resolve the destination set. If resolution fails, send the
//!    original message to the literal target only.
//! 2. Master first. A master send failure fails the dispatch, but only
//!    after the slaves have been attempted.
//! 3. Slaves concurrently, best-effort. Their failures are collected
//!    into the report and otherwise discarded.
//!
//! Each destination is gated independently: unless the message class is
//! exempt or the destination is already a friend, an auto-generated
//! friend request goes out in place of the original content. Group
//! messages and device-link protocol messages skip all of this and go
//! to their literal recipient.

use std::sync::Arc;

use futures::future::join_all;
use tandem_protocol::{OutgoingMessage, Recipient};
use tandem_storage::{LinkStore, LinkStoreExt};
use tandem_types::{Destination, DeviceRole, FriendRequestStatus, IdentityKey, Result};

use crate::interfaces::{SendReceipt, Transport};
use crate::resolver::DestinationResolver;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// What was sent to one destination.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Destination the message went to.
    pub destination: Destination,
    /// `true` if a friend request was sent in place of the original.
    pub substituted: bool,
    /// Transport acknowledgement.
    pub receipt: SendReceipt,
}

/// Outcome of one [`FanoutDispatcher::dispatch`] call.
#[derive(Clone, Debug, Default)]
pub struct DispatchReport {
    /// Master delivery. `None` when the master is the local device, or
    /// when the message went to its literal recipient instead.
    pub primary: Option<Delivery>,
    /// Receipt of a send that skipped resolution: a bypassing message,
    /// or the literal target after a resolution failure.
    pub literal: Option<SendReceipt>,
    /// Successful slave deliveries.
    pub slaves: Vec<Delivery>,
    /// Number of slave sends that failed and were discarded.
    pub slave_failures: usize,
    /// `true` if resolution failed and the literal target was used.
    pub fell_back: bool,
}

// ---------------------------------------------------------------------------
// FanoutDispatcher
// ---------------------------------------------------------------------------

/// Sends outgoing messages to every device of their target.
pub struct FanoutDispatcher {
    local: IdentityKey,
    store: Arc<dyn LinkStore>,
    resolver: Arc<DestinationResolver>,
    transport: Arc<dyn Transport>,
    friend_request_text: String,
}

impl FanoutDispatcher {
    /// Creates a dispatcher sending as `local`.
    pub fn new(
        local: IdentityKey,
        store: Arc<dyn LinkStore>,
        resolver: Arc<DestinationResolver>,
        transport: Arc<dyn Transport>,
        friend_request_text: String,
    ) -> Self {
        Self {
            local,
            store,
            resolver,
            transport,
            friend_request_text,
        }
    }

    /// Dispatches `message` to all devices of `target`.
    ///
    /// # Errors
    ///
    /// - `DeliveryFailed` if the master (or literal) send fails. Slaves
    ///   are still attempted when the master send fails.
    /// - `StorageError` if friend-request gating cannot read or write
    ///   the conversation record of the master.
    pub async fn dispatch(&self, message: OutgoingMessage, target: IdentityKey) -> Result<DispatchReport> {
        if message.bypasses_fanout() {
            let recipient = message.recipient;
            let receipt = self.transport.send(message, recipient).await?;
            return Ok(DispatchReport {
                literal: Some(receipt),
                ..DispatchReport::default()
            });
        }

        let destinations = match self.resolver.resolve(&target).await {
            Ok(set) => set,
            Err(e) => {
                tracing::warn!(%target, %e, "destination resolution failed, sending to literal target");
                let receipt = self
                    .transport
                    .send(message.retarget(target), Recipient::Device(target))
                    .await?;
                return Ok(DispatchReport {
                    literal: Some(receipt),
                    fell_back: true,
                    ..DispatchReport::default()
                });
            }
        };

        let mut master = None;
        let mut slaves = Vec::new();
        for destination in destinations {
            if destination.identity == self.local {
                continue;
            }
            match destination.role {
                DeviceRole::Master => master = Some(destination),
                DeviceRole::Slave => slaves.push(destination),
            }
        }

        let mut report = DispatchReport::default();
        let mut master_error = None;
        if let Some(destination) = master {
            match self.deliver(&message, destination).await {
                Ok(delivery) => report.primary = Some(delivery),
                Err(e) => {
                    tracing::warn!(master = %destination.identity, %e, "master delivery failed");
                    master_error = Some(e);
                }
            }
        }

        // Slave sends are independent and best-effort: collect, count
        // failures, never propagate them.
        let outcomes = join_all(slaves.into_iter().map(|d| self.deliver(&message, d))).await;
        for outcome in outcomes {
            match outcome {
                Ok(delivery) => report.slaves.push(delivery),
                Err(e) => {
                    tracing::debug!(%e, "discarding slave delivery failure");
                    report.slave_failures += 1;
                }
            }
        }

        match master_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn deliver(&self, message: &OutgoingMessage, destination: Destination) -> Result<Delivery> {
        let (outgoing, substituted) = self.gate(message, &destination.identity)?;
        let receipt = self
            .transport
            .send(outgoing, Recipient::Device(destination.identity))
            .await?;
        Ok(Delivery {
            destination,
            substituted,
            receipt,
        })
    }

    /// Decides what `device` receives: the original (retargeted) or a
    /// friend request. A substitution marks the request as sent in the
    /// same transaction that builds it.
    fn gate(&self, message: &OutgoingMessage, device: &IdentityKey) -> Result<(OutgoingMessage, bool)> {
        if message.is_trust_exempt() {
            return Ok((message.retarget(*device), false));
        }

        self.store.atomically(|txn| {
            let status = txn.friend_request_status(device)?;
            if status.is_friends() {
                return Ok((message.retarget(*device), false));
            }
            let request = OutgoingMessage::friend_request(message.sender, *device, &self.friend_request_text)?;
            if status.can_send_request() {
                txn.set_friend_request_status(device, FriendRequestStatus::RequestSent)?;
            }
            Ok((request, true))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
