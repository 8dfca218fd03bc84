use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use crate::engine::EngineEvent;
use crate::error::CallError;
use crate::media::LocalMedia;
use crate::protocol::{IceCandidateRecord, SessionDescription};
use crate::session::SessionToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// States that end the call they belong to.
    pub fn ends_call(self) -> bool {
        matches!(self, PeerState::Disconnected | PeerState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A locally gathered candidate; the engine fills in the target.
    LocalCandidate(IceCandidateRecord),
    StateChanged(PeerState),
    RemoteTrack { kind: String, id: String },
}

/// Notification sink handed to a transport at creation. Everything it emits
/// is stamped with the call it was created for.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    token: SessionToken,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl TransportEvents {
    pub fn new(token: SessionToken, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { token, tx }
    }

    pub fn emit(&self, event: TransportEvent) {
        if self.tx.send(EngineEvent::Transport { token: self.token, event }).is_err() {
            trace!(token = %self.token, "engine gone, dropping transport event");
        }
    }
}

/// The peer connection as the call engine drives it.
///
/// `add_ice_candidate` fails with [`CallError::CandidateRejected`] until a
/// remote description is in place; the engine only reaches it through the
/// candidate buffer.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, CallError>;
    async fn create_answer(&self) -> Result<SessionDescription, CallError>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), CallError>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), CallError>;
    async fn add_ice_candidate(&self, candidate: IceCandidateRecord) -> Result<(), CallError>;
    async fn add_local_tracks(&self, media: &LocalMedia) -> Result<(), CallError>;
    async fn close(&self) -> Result<(), CallError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, events: TransportEvents) -> Result<Arc<dyn PeerTransport>, CallError>;
}
