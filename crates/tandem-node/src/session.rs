//! Linking session state machine.
//!
//! A [`LinkingSession`] tracks one in-progress handshake between the
//! local device and one remote device. There is at most one per
//! process; the owner ([`crate::service::MultiDeviceService`]) keeps it
//! behind a mutex.
//!
//! # State machine
//!
//! ```text
//! Requester (becomes slave):
//!   Idle ──request()──▶ AwaitingAuthorization ──authorization──▶ Completed
//!
//! Authorizer (becomes master):
//!   Idle ──await_request()──▶ AwaitingRequest ──request──▶ AwaitingAuthorization
//!        ──authorize──▶ Completed
//!
//! Any open state ──cancel / timeout──▶ Cancelled
//! Any open state ──verification failure──▶ Failed
//! Completed ──commit rolled back──▶ Failed
//! ```
//!
//! On the authorizer side `AwaitingAuthorization` means the request has
//! been verified and is waiting for the local user to authorize it.
//!
//! Terminal states (`Completed`, `Cancelled`, `Failed`) behave like
//! `Idle` for incoming messages: nothing is acted on.

use std::time::Duration;

use tandem_protocol::pairing::{verify_device_link, verify_slave_signature};
use tandem_protocol::{LinkingAuthorization, LinkingRequest};
use tandem_types::{DeviceLink, IdentityKey, Result, Signature, TandemError, Verifier};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// SessionRole / SessionState
// ---------------------------------------------------------------------------

/// Which side of the handshake the local device plays.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionRole {
    /// Sent the request, will become the slave.
    Requester,
    /// Waits for a request, will become the master.
    Authorizer,
}

/// Lifecycle state of a [`LinkingSession`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// No handshake in progress.
    Idle,
    /// Authorizer waiting for a slave's request.
    AwaitingRequest,
    /// Slave signature exchanged, master signature pending.
    AwaitingAuthorization {
        /// The remote party the next message must come from (or go to).
        remote: IdentityKey,
        /// Slave half of the pairing.
        slave_signature: Signature,
    },
    /// Link committed.
    Completed {
        /// The committed link.
        link: DeviceLink,
    },
    /// Cancelled by the user, superseded, or timed out.
    Cancelled,
    /// Aborted by a verification or protocol failure.
    Failed {
        /// What went wrong.
        reason: String,
    },
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::AwaitingRequest => write!(f, "awaiting_request"),
            Self::AwaitingAuthorization { .. } => write!(f, "awaiting_authorization"),
            Self::Completed { .. } => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed { .. } => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// LinkingSession
// ---------------------------------------------------------------------------

/// One device-linking handshake.
#[derive(Clone, Debug)]
pub struct LinkingSession {
    role: Option<SessionRole>,
    state: SessionState,
    started_at: Instant,
    timeout: Duration,
}

impl Default for LinkingSession {
    fn default() -> Self {
        Self::idle()
    }
}

impl LinkingSession {
    /// A session slot with nothing in progress.
    pub fn idle() -> Self {
        Self {
            role: None,
            state: SessionState::Idle,
            started_at: Instant::now(),
            timeout: Duration::ZERO,
        }
    }

    /// Opens a requester session after the local device signed a
    /// request to `master`.
    pub fn request(master: IdentityKey, slave_signature: Signature, timeout: Duration) -> Self {
        Self {
            role: Some(SessionRole::Requester),
            state: SessionState::AwaitingAuthorization {
                remote: master,
                slave_signature,
            },
            started_at: Instant::now(),
            timeout,
        }
    }

    /// Opens an authorizer session waiting for a request.
    pub fn await_request(timeout: Duration) -> Self {
        Self {
            role: Some(SessionRole::Authorizer),
            state: SessionState::AwaitingRequest,
            started_at: Instant::now(),
            timeout,
        }
    }

    pub fn role(&self) -> Option<SessionRole> {
        self.role
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Returns `true` while the handshake is open.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            SessionState::AwaitingRequest | SessionState::AwaitingAuthorization { .. }
        )
    }

    /// Returns `true` if this is an open session of `role` in a state
    /// that accepts the next handshake message.
    pub fn expects(&self, role: SessionRole) -> bool {
        match (role, &self.state) {
            (SessionRole::Requester, SessionState::AwaitingAuthorization { .. }) => {
                self.role == Some(SessionRole::Requester)
            }
            (SessionRole::Authorizer, SessionState::AwaitingRequest) => {
                self.role == Some(SessionRole::Authorizer)
            }
            _ => false,
        }
    }

    /// Moves an open session past its deadline to `Cancelled`.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn expire(&mut self, now: Instant) -> bool {
        if self.is_active() && now.duration_since(self.started_at) >= self.timeout {
            self.state = SessionState::Cancelled;
            return true;
        }
        false
    }

    /// Cancels an open session. Cancelling anything else is a no-op.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn cancel(&mut self) -> bool {
        if self.is_active() {
            self.state = SessionState::Cancelled;
            return true;
        }
        false
    }

    /// Aborts an open session with `reason`. A completed session can
    /// also be failed when its commit is rolled back. No-op otherwise.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.is_active() || matches!(self.state, SessionState::Completed { .. }) {
            self.state = SessionState::Failed { reason: reason.into() };
        }
    }

    /// Marks the handshake as committed.
    pub fn complete(&mut self, link: DeviceLink) {
        self.state = SessionState::Completed { link };
    }

    /// The verified request waiting for local authorization, as
    /// `(slave, slave_signature)`.
    pub fn pending_request(&self) -> Option<(IdentityKey, Signature)> {
        match (&self.role, &self.state) {
            (
                Some(SessionRole::Authorizer),
                SessionState::AwaitingAuthorization { remote, slave_signature },
            ) => Some((*remote, *slave_signature)),
            _ => None,
        }
    }

    /// Validates a linking request received by an authorizer session.
    ///
    /// The request must name `local` as master and `sender` as slave,
    /// and carry a slave signature that verifies. On success the
    /// session moves to `AwaitingAuthorization`; on failure it moves
    /// to `Failed`.
    ///
    /// # Errors
    ///
    /// - `ProtocolState` if the session is not waiting for a request.
    /// - `VerificationFailed` if any check fails.
    pub fn accept_request(
        &mut self,
        request: &LinkingRequest,
        sender: &IdentityKey,
        local: &IdentityKey,
        verifier: &dyn Verifier,
    ) -> Result<()> {
        if !self.expects(SessionRole::Authorizer) {
            return Err(TandemError::ProtocolState {
                reason: format!("linking session is {}, not awaiting a request", self.state),
            });
        }

        let checked = check_request(request, sender, local, verifier);
        if let Err(e) = &checked {
            self.fail(e.to_string());
            return checked;
        }

        self.state = SessionState::AwaitingAuthorization {
            remote: request.slave,
            slave_signature: request.slave_signature,
        };
        Ok(())
    }

    /// Validates an authorization received by a requester session and
    /// returns the link to commit. The session stays open until the
    /// caller commits and calls [`complete`](Self::complete).
    ///
    /// # Errors
    ///
    /// - `ProtocolState` if the session is not waiting for an
    ///   authorization.
    /// - `VerificationFailed` if the authorization is not bound to this
    ///   session or a signature does not verify. The session moves to
    ///   `Failed`.
    pub fn accept_authorization(
        &mut self,
        authorization: &LinkingAuthorization,
        sender: &IdentityKey,
        local: &IdentityKey,
        verifier: &dyn Verifier,
    ) -> Result<DeviceLink> {
        let (expected_master, own_signature) = match (&self.role, &self.state) {
            (
                Some(SessionRole::Requester),
                SessionState::AwaitingAuthorization { remote, slave_signature },
            ) => (*remote, *slave_signature),
            _ => {
                return Err(TandemError::ProtocolState {
                    reason: format!("linking session is {}, not awaiting an authorization", self.state),
                })
            }
        };

        let link = &authorization.link;
        let checked = if *sender != expected_master || link.master != expected_master {
            Err(TandemError::VerificationFailed {
                reason: format!("authorization from {sender} does not come from the requested master"),
            })
        } else if link.slave != *local {
            Err(TandemError::VerificationFailed {
                reason: "authorization names a different slave".into(),
            })
        } else if link.slave_signature != own_signature {
            Err(TandemError::VerificationFailed {
                reason: "authorization carries a different slave signature".into(),
            })
        } else {
            verify_device_link(verifier, link)
        };

        match checked {
            Ok(()) => Ok(link.clone()),
            Err(e) => {
                self.fail(e.to_string());
                Err(e)
            }
        }
    }
}

fn check_request(
    request: &LinkingRequest,
    sender: &IdentityKey,
    local: &IdentityKey,
    verifier: &dyn Verifier,
) -> Result<()> {
    if request.master != *local {
        return Err(TandemError::VerificationFailed {
            reason: format!("request names {} as master", request.master),
        });
    }
    if request.slave != *sender {
        return Err(TandemError::VerificationFailed {
            reason: format!("request for {} was sent by {sender}", request.slave),
        });
    }
    verify_slave_signature(verifier, &request.master, &request.slave, &request.slave_signature)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
