//! Per-recipient authorization state machine.
//!
//! Presence-based channels may only deliver to a peer that has granted us
//! permission (for example an approved presence subscription). Loss of that
//! permission is not always announced; it may only surface as a failed send,
//! so a failed send is a first-class transition here.
//!
//! Transition functions never talk to a transport. They return an
//! [`AuthAction`] that the caller carries out.

use std::fmt;

use tracing::trace;

/// Communication state of a recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AuthorizationState {
    /// Nothing is known yet about the peer.
    #[default]
    Unknown,
    /// An authorization request was sent and no answer arrived yet.
    AwaitingAuthorization,
    /// The channel may deliver to this peer.
    Ready,
}

impl fmt::Display for AuthorizationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::AwaitingAuthorization => write!(f, "WAIT-AUTHZ"),
            Self::Ready => write!(f, "READY"),
        }
    }
}

/// Answer of a transport's authorization query for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Granted,
    Denied,
    Unknown,
}

/// Follow-up work requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    /// Nothing to do.
    None,
    /// Ask the peer for authorization.
    RequestAuthorization,
    /// The recipient became ready; drain queued messages.
    Drain,
}

/// Authorization bookkeeping for one recipient.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authorization {
    state: AuthorizationState,
    request_outstanding: bool,
}

impl Authorization {
    /// A recipient whose authorization is not known yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// A recipient on a channel that needs no authorization.
    pub fn ready() -> Self {
        Self {
            state: AuthorizationState::Ready,
            request_outstanding: false,
        }
    }

    pub fn state(&self) -> AuthorizationState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == AuthorizationState::Ready
    }

    /// Whether an authorization request was issued and not yet answered.
    pub fn request_outstanding(&self) -> bool {
        self.request_outstanding
    }

    /// Apply capability information reported by the transport.
    pub fn on_capability(&mut self, status: AuthorizationStatus) -> AuthAction {
        if status == AuthorizationStatus::Granted {
            return self.grant();
        }

        match self.state {
            // always ask once after startup
            AuthorizationState::Unknown => self.request(),
            AuthorizationState::Ready if !self.request_outstanding => self.request(),
            _ => AuthAction::None,
        }
    }

    /// The peer granted authorization.
    pub fn on_granted(&mut self) -> AuthAction {
        self.grant()
    }

    /// The peer revoked authorization. Forces a fresh request cycle.
    pub fn on_revoked(&mut self) -> AuthAction {
        self.request_outstanding = false;
        self.request()
    }

    /// A send failed because the peer silently stopped authorizing us.
    pub fn on_authorization_lost(&mut self) -> AuthAction {
        self.on_revoked()
    }

    /// The outstanding request went unanswered for too long. Asks again;
    /// recipients that are not waiting are left alone.
    pub fn on_request_expired(&mut self) -> AuthAction {
        if self.state != AuthorizationState::AwaitingAuthorization {
            return AuthAction::None;
        }
        self.request_outstanding = false;
        self.request()
    }

    fn grant(&mut self) -> AuthAction {
        self.request_outstanding = false;
        self.transition(AuthorizationState::Ready);
        AuthAction::Drain
    }

    fn request(&mut self) -> AuthAction {
        self.request_outstanding = true;
        self.transition(AuthorizationState::AwaitingAuthorization);
        AuthAction::RequestAuthorization
    }

    fn transition(&mut self, to: AuthorizationState) {
        trace!("authorization state: {} -> {}", self.state, to);
        self.state = to;
    }
}
