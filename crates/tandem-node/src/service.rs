//! Process-wide multi-device coordinator.
//!
//! The [`MultiDeviceService`] is constructed once per process and owns
//! all shared mutable state of the multi-device core: the single
//! linking-session slot, the destination resolver (and its cache), and
//! the event channel. It is the entry point for the UI and for the
//! message-receipt pipeline.
//!
//! # Linking handshake
//!
//! ```text
//! slave (A)                                   master (B)
//!                                             start_awaiting_request()
//! start_linking_request(B) ── request ──────▶ handle_incoming_device_link_message
//!                                             LinkEvent::LinkingRequestReceived
//!                                             authorize_linking_request(profile)
//!   handle_incoming_device_link_message ◀──── authorization
//!   LinkEvent::DeviceLinked                   LinkEvent::DeviceLinked
//! ```
//!
//! Both sides commit the link (and mark each other as friends) in one
//! store transaction. The session mutex is never held across an await.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tandem_protocol::pairing::sign_pairing;
use tandem_protocol::{
    DeviceLinkMessage, LinkingAuthorization, LinkingProfile, LinkingRequest, OutgoingMessage,
};
use tandem_storage::{LinkStore, LinkStoreExt};
use tandem_types::config::MultiDeviceConfig;
use tandem_types::{
    Destination, DeviceLink, FriendRequestStatus, IdentityKey, LinkEvent, LocalSigner, Result,
    TandemError, Verifier,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::fanout::{DispatchReport, FanoutDispatcher};
use crate::interfaces::{DataWipe, Directory, Transport};
use crate::resolver::DestinationResolver;
use crate::session::{LinkingSession, SessionRole, SessionState};
use crate::unlink::{UnlinkGuard, UnlinkOutcome};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// External collaborators injected into the service.
#[derive(Clone)]
pub struct Collaborators {
    /// Signing identity of the local device.
    pub signer: Arc<dyn LocalSigner>,
    /// Signature verification.
    pub verifier: Arc<dyn Verifier>,
    /// Persisted device-link store.
    pub store: Arc<dyn LinkStore>,
    /// Device-link directory.
    pub directory: Arc<dyn Directory>,
    /// Message delivery.
    pub transport: Arc<dyn Transport>,
    /// Application data wipe.
    pub wipe: Arc<dyn DataWipe>,
}

/// Why an incoming device-link message was dropped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DropReason {
    /// No session was expecting this message.
    NoSession,
    /// The payload could not be decoded or lacked a required field.
    Malformed {
        /// Decoder diagnostic.
        reason: String,
    },
}

/// What handling an incoming device-link message did.
#[derive(Clone, Debug)]
pub enum IncomingOutcome {
    /// A verified request now awaits local authorization.
    RequestReceived {
        /// Identity asking to become a slave.
        slave: IdentityKey,
    },
    /// The handshake completed and the link was committed.
    Linked {
        /// The committed link.
        link: DeviceLink,
    },
    /// The message was not acted on.
    Dropped {
        /// Why.
        reason: DropReason,
    },
}

// ---------------------------------------------------------------------------
// MultiDeviceService
// ---------------------------------------------------------------------------

/// Coordinator owning the linking session, the resolution cache, and
/// the collaborators.
pub struct MultiDeviceService {
    local: IdentityKey,
    signer: Arc<dyn LocalSigner>,
    verifier: Arc<dyn Verifier>,
    store: Arc<dyn LinkStore>,
    directory: Arc<dyn Directory>,
    resolver: Arc<DestinationResolver>,
    dispatcher: FanoutDispatcher,
    unlink_guard: UnlinkGuard,
    session: Mutex<LinkingSession>,
    linking_timeout: Duration,
    event_tx: mpsc::Sender<LinkEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<LinkEvent>>>,
}

impl MultiDeviceService {
    /// Builds the service.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `config` fails validation.
    pub fn new(config: &MultiDeviceConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let Collaborators {
            signer,
            verifier,
            store,
            directory,
            transport,
            wipe,
        } = collaborators;
        let local = signer.identity();

        let resolver = Arc::new(DestinationResolver::new(
            local,
            Arc::clone(&store),
            Arc::clone(&directory),
            Arc::clone(&verifier),
            config.refresh_interval(),
        ));
        let dispatcher = FanoutDispatcher::new(
            local,
            Arc::clone(&store),
            Arc::clone(&resolver),
            transport,
            config.friend_request_text.clone(),
        );
        let unlink_guard = UnlinkGuard::new(local, Arc::clone(&store), Arc::clone(&directory), wipe);
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_size);

        tracing::info!(%local, "multi-device service created");

        Ok(Self {
            local,
            signer,
            verifier,
            store,
            directory,
            resolver,
            dispatcher,
            unlink_guard,
            session: Mutex::new(LinkingSession::idle()),
            linking_timeout: config.linking_timeout(),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        })
    }

    /// Identity key of the local device.
    pub fn local_identity(&self) -> IdentityKey {
        self.local
    }

    /// Takes the event receiver. Returns `None` after the first call.
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<LinkEvent>> {
        self.event_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Sends `message` to every device of `target`.
    pub async fn dispatch(&self, message: OutgoingMessage, target: IdentityKey) -> Result<DispatchReport> {
        self.dispatcher.dispatch(message, target).await
    }

    /// Resolves `identity` to its current destination set.
    pub async fn resolve_destinations(&self, identity: &IdentityKey) -> Result<HashSet<Destination>> {
        self.resolver.resolve(identity).await
    }

    // -----------------------------------------------------------------------
    // Linking: local actions
    // -----------------------------------------------------------------------

    /// Asks `master` to link the local device as its slave.
    ///
    /// Replaces any open session. The request is sent to `master`
    /// only, never fanned out.
    ///
    /// # Errors
    ///
    /// - `ProtocolState` if `master` is the local device or the local
    ///   device already has a master.
    /// - `DeliveryFailed` if the request could not be sent; the session
    ///   is failed.
    pub async fn start_linking_request(&self, master: IdentityKey) -> Result<()> {
        let local = self.local;
        if master == local {
            return Err(TandemError::ProtocolState {
                reason: "a device cannot link to itself".into(),
            });
        }
        if let Some(existing) = self.store.atomically(|txn| txn.master_of(&local))? {
            return Err(TandemError::ProtocolState {
                reason: format!("already linked to master {existing}"),
            });
        }

        let slave_signature = sign_pairing(self.signer.as_ref(), &master, &local)?;
        let request = DeviceLinkMessage::Request(LinkingRequest {
            master,
            slave: local,
            slave_signature,
        });
        let message = OutgoingMessage::device_link(local, master, &request)?;

        {
            let mut session = self.lock_session()?;
            if session.is_active() {
                tracing::info!(state = %session.state(), "superseding open linking session");
            }
            *session = LinkingSession::request(master, slave_signature, self.linking_timeout);
        }
        tracing::info!(%master, "linking request started");

        if let Err(e) = self.dispatcher.dispatch(message, master).await {
            let mut session = self.lock_session()?;
            let ours = matches!(
                session.state(),
                SessionState::AwaitingAuthorization { remote, slave_signature: sig }
                    if *remote == master && *sig == slave_signature
            );
            if ours {
                self.fail_session(&mut session, &e);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Opens a master-side session waiting for a linking request.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolState` if the local device is itself a slave.
    pub fn start_awaiting_request(&self) -> Result<()> {
        let local = self.local;
        if let Some(master) = self.store.atomically(|txn| txn.master_of(&local))? {
            return Err(TandemError::ProtocolState {
                reason: format!("slave of {master} cannot authorize links"),
            });
        }

        let mut session = self.lock_session()?;
        if session.is_active() {
            tracing::info!(state = %session.state(), "superseding open linking session");
        }
        *session = LinkingSession::await_request(self.linking_timeout);
        tracing::info!("waiting for a linking request");
        Ok(())
    }

    /// Authorizes the pending linking request.
    ///
    /// Signs the pairing, commits the link, sends the authorization to
    /// the slave and publishes the link to the directory. If the
    /// authorization cannot be delivered the local commit is rolled
    /// back.
    ///
    /// # Errors
    ///
    /// - `ProtocolState` if no verified request is pending.
    /// - `StorageError` if the commit fails.
    /// - `DeliveryFailed` if the authorization could not be sent.
    pub async fn authorize_linking_request(&self, profile: Option<LinkingProfile>) -> Result<DeviceLink> {
        let local = self.local;
        let (link, message, replaced) = {
            let mut session = self.lock_session()?;
            let Some((slave, slave_signature)) = session.pending_request() else {
                return Err(TandemError::ProtocolState {
                    reason: format!("no linking request awaiting authorization (session {})", session.state()),
                });
            };

            let master_signature = sign_pairing(self.signer.as_ref(), &local, &slave)?;
            let link = DeviceLink {
                master: local,
                slave,
                master_signature,
                slave_signature,
            };
            let authorization = DeviceLinkMessage::Authorization(LinkingAuthorization {
                link: link.clone(),
                profile,
            });
            let message = OutgoingMessage::device_link(local, slave, &authorization)?;

            let replaced = match self.commit_link(&link, None) {
                Ok(previous) => previous,
                Err(e) => {
                    self.fail_session(&mut session, &e);
                    return Err(e);
                }
            };
            session.complete(link.clone());
            (link, message, replaced)
        };

        if let Err(e) = self.dispatcher.dispatch(message, link.slave).await {
            tracing::warn!(slave = %link.slave, %e, "authorization delivery failed, rolling back link");
            self.rollback_link(&link, replaced)?;
            let mut session = self.lock_session()?;
            if matches!(session.state(), SessionState::Completed { link: done } if *done == link) {
                self.fail_session(&mut session, &e);
            } else {
                self.report_failure(&e);
            }
            return Err(e);
        }

        self.resolver.invalidate(&local)?;
        if let Err(e) = self.directory.publish_device_link(&link).await {
            tracing::warn!(slave = %link.slave, %e, "failed to publish device link");
        }

        tracing::info!(slave = %link.slave, "device linked as master");
        self.emit(LinkEvent::DeviceLinked { link: link.clone() });
        Ok(link)
    }

    /// Declines the pending linking request. Returns `true` if a
    /// request was pending.
    pub fn reject_linking_request(&self) -> Result<bool> {
        let mut session = self.lock_session()?;
        if session.pending_request().is_none() {
            return Ok(false);
        }
        session.cancel();
        tracing::info!("linking request rejected");
        Ok(true)
    }

    /// Cancels the open linking session. Idempotent: cancelling an idle,
    /// completed, or already-cancelled session returns `false` and does
    /// nothing.
    pub fn cancel_linking(&self) -> Result<bool> {
        let mut session = self.lock_session()?;
        let cancelled = session.cancel();
        if cancelled {
            tracing::info!("linking session cancelled");
        }
        Ok(cancelled)
    }

    /// Cancels the open session if it has outlived the linking timeout.
    pub fn expire_linking_session(&self) -> Result<bool> {
        let mut session = self.raw_session()?;
        Ok(self.expire_locked(&mut session))
    }

    /// Snapshot of the current session state.
    pub fn linking_state(&self) -> Result<SessionState> {
        Ok(self.lock_session()?.state().clone())
    }

    // -----------------------------------------------------------------------
    // Linking: incoming messages
    // -----------------------------------------------------------------------

    /// Handles a raw device-link payload received from `sender`.
    ///
    /// Malformed payloads abort any open session and are dropped.
    ///
    /// # Errors
    ///
    /// - `VerificationFailed` if a request or authorization fails its
    ///   checks. The session is aborted and `LinkingFailed` emitted.
    /// - `StorageError` if committing the link fails.
    pub async fn handle_incoming_device_link_message(
        &self,
        payload: &[u8],
        sender: IdentityKey,
    ) -> Result<IncomingOutcome> {
        match DeviceLinkMessage::from_cbor(payload) {
            Ok(message) => self.handle_device_link_message(message, sender),
            Err(e) => {
                let mut session = self.lock_session()?;
                if session.is_active() {
                    self.fail_session(&mut session, &e);
                } else {
                    tracing::debug!(%sender, %e, "dropping malformed device-link payload");
                }
                Ok(IncomingOutcome::Dropped {
                    reason: DropReason::Malformed {
                        reason: e.to_string(),
                    },
                })
            }
        }
    }

    /// Handles an already-decoded device-link message from `sender`.
    pub fn handle_device_link_message(
        &self,
        message: DeviceLinkMessage,
        sender: IdentityKey,
    ) -> Result<IncomingOutcome> {
        match message {
            DeviceLinkMessage::Request(request) => self.on_request(&request, sender),
            DeviceLinkMessage::Authorization(authorization) => self.on_authorization(&authorization, sender),
        }
    }

    fn on_request(&self, request: &LinkingRequest, sender: IdentityKey) -> Result<IncomingOutcome> {
        let mut session = self.lock_session()?;
        if !session.expects(SessionRole::Authorizer) {
            tracing::debug!(%sender, state = %session.state(), "unexpected linking request dropped");
            self.emit(LinkEvent::UnexpectedLinkingRequest { sender });
            return Ok(IncomingOutcome::Dropped {
                reason: DropReason::NoSession,
            });
        }

        match session.accept_request(request, &sender, &self.local, self.verifier.as_ref()) {
            Ok(()) => {
                tracing::info!(slave = %request.slave, "linking request received");
                self.emit(LinkEvent::LinkingRequestReceived { slave: request.slave });
                Ok(IncomingOutcome::RequestReceived { slave: request.slave })
            }
            Err(e) => {
                self.report_failure(&e);
                Err(e)
            }
        }
    }

    fn on_authorization(&self, authorization: &LinkingAuthorization, sender: IdentityKey) -> Result<IncomingOutcome> {
        let local = self.local;
        let mut session = self.lock_session()?;
        if !session.expects(SessionRole::Requester) {
            tracing::debug!(%sender, state = %session.state(), "unexpected linking authorization dropped");
            self.emit(LinkEvent::UnexpectedAuthorization { sender });
            return Ok(IncomingOutcome::Dropped {
                reason: DropReason::NoSession,
            });
        }

        let link = match session.accept_authorization(authorization, &sender, &local, self.verifier.as_ref()) {
            Ok(link) => link,
            Err(e) => {
                self.report_failure(&e);
                return Err(e);
            }
        };
        if let Err(e) = self.commit_link(&link, authorization.profile.as_ref()) {
            self.fail_session(&mut session, &e);
            return Err(e);
        }
        session.complete(link.clone());
        drop(session);

        self.resolver.invalidate(&local)?;
        self.resolver.invalidate(&link.master)?;
        tracing::info!(master = %link.master, "device linked as slave");
        self.emit(LinkEvent::DeviceLinked { link: link.clone() });
        Ok(IncomingOutcome::Linked { link })
    }

    // -----------------------------------------------------------------------
    // Unlinking
    // -----------------------------------------------------------------------

    /// Handles an unlink notification claimed to come from `sender`.
    pub async fn handle_incoming_unlink_message(&self, sender: IdentityKey) -> Result<UnlinkOutcome> {
        let outcome = self.unlink_guard.handle(&sender).await?;
        match &outcome {
            UnlinkOutcome::Unlinked { master } => {
                self.resolver.invalidate(&self.local)?;
                self.resolver.invalidate(master)?;
                self.emit(LinkEvent::Unlinked { master: *master });
            }
            UnlinkOutcome::Rejected(reason) => {
                self.emit(LinkEvent::UnlinkRejected {
                    sender,
                    reason: reason.to_string(),
                });
            }
        }
        Ok(outcome)
    }

    /// Revokes `slave` from the local (master) device.
    ///
    /// The link is removed locally and withdrawn from the directory
    /// before the slave is notified, so the slave's corroborating fetch
    /// no longer finds it. Returns `true` if the notification was
    /// delivered.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolState` if `slave` is not linked to this device.
    pub async fn revoke_slave(&self, slave: IdentityKey) -> Result<bool> {
        let local = self.local;
        let notice = OutgoingMessage::unlink(local, slave)?;

        let removed = self.store.atomically(|txn| {
            let link = txn
                .device_links(&local)?
                .into_iter()
                .find(|l| l.pairs(&local, &slave));
            if link.is_some() {
                txn.remove_device_link(&local, &slave)?;
            }
            Ok(link)
        })?;
        let Some(link) = removed else {
            return Err(TandemError::ProtocolState {
                reason: format!("{slave} is not linked to this device"),
            });
        };
        self.resolver.invalidate(&local)?;
        tracing::info!(%slave, "slave revoked");

        if let Err(e) = self.directory.unpublish_device_link(&link).await {
            tracing::warn!(%slave, %e, "failed to withdraw revoked link from directory");
        }
        let notified = match self.dispatcher.dispatch(notice, slave).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(%slave, %e, "unlink notification not delivered");
                false
            }
        };
        self.emit(LinkEvent::SlaveRevoked { slave });
        Ok(notified)
    }

    /// Returns `true` if this device has been unlinked by its master.
    pub fn is_unlinked(&self) -> Result<bool> {
        self.unlink_guard.is_unlinked()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Commits `link` and mutual friendship with the peer in one write.
    /// Returns the peer's previous friend-request status.
    fn commit_link(&self, link: &DeviceLink, profile: Option<&LinkingProfile>) -> Result<FriendRequestStatus> {
        let local = self.local;
        let peer = link.other(&local).ok_or_else(|| TandemError::ProtocolState {
            reason: "link does not involve the local device".into(),
        })?;
        self.store.atomically(|txn| {
            txn.put_device_link(link)?;
            if let Some(profile) = profile {
                txn.apply_profile(&link.master, profile)?;
            }
            let previous = txn.friend_request_status(&peer)?;
            txn.set_friend_request_status(&peer, FriendRequestStatus::Friends)?;
            Ok(previous)
        })
    }

    fn rollback_link(&self, link: &DeviceLink, previous: FriendRequestStatus) -> Result<()> {
        self.store.transaction(&|txn| {
            txn.remove_device_link(&link.master, &link.slave)?;
            txn.set_friend_request_status(&link.slave, previous)
        })
    }

    fn raw_session(&self) -> Result<MutexGuard<'_, LinkingSession>> {
        self.session.lock().map_err(|_| TandemError::ProtocolState {
            reason: "linking session lock poisoned".into(),
        })
    }

    /// Locks the session slot, expiring an overdue session first.
    fn lock_session(&self) -> Result<MutexGuard<'_, LinkingSession>> {
        let mut session = self.raw_session()?;
        self.expire_locked(&mut session);
        Ok(session)
    }

    fn expire_locked(&self, session: &mut LinkingSession) -> bool {
        let expired = session.expire(Instant::now());
        if expired {
            tracing::info!("linking session timed out");
            self.emit(LinkEvent::LinkingTimedOut);
        }
        expired
    }

    fn fail_session(&self, session: &mut LinkingSession, error: &TandemError) {
        session.fail(error.to_string());
        self.report_failure(error);
    }

    fn report_failure(&self, error: &TandemError) {
        tracing::warn!(%error, "linking aborted");
        self.emit(LinkEvent::LinkingFailed {
            reason: error.to_string(),
        });
    }

    fn emit(&self, event: LinkEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::debug!(%e, "link event dropped");
        }
    }
}
