use std::fmt;
use std::time::Instant;

use uuid::Uuid;

use crate::error::CallError;
use crate::protocol::{SessionDescription, UserIdentity};

/// Generation token of one call. Every asynchronous step and transport
/// notification carries the token it was started under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken(Uuid);

impl SessionToken {
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallPhase {
    #[default]
    Idle,
    /// Offer on its way to the callee.
    Calling,
    /// Someone is calling us and we have not accepted yet.
    Ringing,
    /// Accepted locally, answer not yet transmitted.
    Answering,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteDescriptionState {
    Unset,
    Applying,
    Applied,
}

#[derive(Debug)]
pub struct CallSession {
    token: SessionToken,
    remote_user: UserIdentity,
    direction: Direction,
    phase: CallPhase,
    remote_description: RemoteDescriptionState,
    remote_offer: Option<SessionDescription>,
    description_sent: bool,
    started_at: Instant,
}

impl CallSession {
    pub fn outgoing(remote_user: UserIdentity) -> Self {
        Self::new(remote_user, Direction::Outgoing, CallPhase::Calling, None)
    }

    pub fn incoming(caller: UserIdentity, offer: SessionDescription) -> Self {
        Self::new(caller, Direction::Incoming, CallPhase::Ringing, Some(offer))
    }

    fn new(
        remote_user: UserIdentity,
        direction: Direction,
        phase: CallPhase,
        remote_offer: Option<SessionDescription>,
    ) -> Self {
        Self {
            token: SessionToken::mint(),
            remote_user,
            direction,
            phase,
            remote_description: RemoteDescriptionState::Unset,
            remote_offer,
            description_sent: false,
            started_at: Instant::now(),
        }
    }

    pub fn token(&self) -> SessionToken {
        self.token
    }

    pub fn remote_user(&self) -> &UserIdentity {
        &self.remote_user
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description == RemoteDescriptionState::Applied
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    pub fn is_current(&self, token: SessionToken) -> bool {
        self.token == token
    }

    /// Ringing -> Answering.
    pub fn accept(&mut self) -> bool {
        if self.phase != CallPhase::Ringing {
            return false;
        }
        self.phase = CallPhase::Answering;
        true
    }

    pub fn take_remote_offer(&mut self) -> Option<SessionDescription> {
        self.remote_offer.take()
    }

    /// Claims the single remote description slot of this call.
    pub fn begin_remote_description(&mut self) -> Result<(), CallError> {
        match self.remote_description {
            RemoteDescriptionState::Unset => {
                self.remote_description = RemoteDescriptionState::Applying;
                Ok(())
            }
            state => Err(CallError::DescriptionRejected(format!(
                "remote description already {state:?} for call with {}",
                self.remote_user
            ))),
        }
    }

    pub fn remote_description_applied(&mut self) {
        self.remote_description = RemoteDescriptionState::Applied;
    }

    /// Whether our offer or answer has gone to the relay. Local candidates
    /// wait for it, the far end drops candidates for a call it has not seen.
    pub fn description_sent(&self) -> bool {
        self.description_sent
    }

    pub fn mark_description_sent(&mut self) {
        self.description_sent = true;
    }

    pub fn connect(&mut self) {
        self.phase = CallPhase::Connected;
    }
}
