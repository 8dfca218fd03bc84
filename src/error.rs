use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid relay frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed `{kind}` envelope: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum CallError {
    /// The relay link is not open for a message that cannot wait.
    #[error("signaling channel unavailable")]
    ChannelUnavailable,
    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),
    #[error("session description rejected: {0}")]
    DescriptionRejected(String),
    /// A candidate reached the transport before the remote description.
    #[error("ICE candidate rejected: {0}")]
    CandidateRejected(String),
    #[error("busy, ignoring call from {caller}")]
    Busy { caller: String },
    #[error("invalid user identity {0:?}")]
    InvalidIdentity(String),
    #[error("peer transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("call engine has stopped")]
    EngineStopped,
}
