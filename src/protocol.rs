use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CallError, ProtocolError};

/// Routing key of a participant on the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserIdentity(String);

impl UserIdentity {
    pub fn parse(raw: &str) -> Result<Self, CallError> {
        let name = raw.trim();
        if name.is_empty() {
            return Err(CallError::InvalidIdentity(raw.to_owned()));
        }
        Ok(Self(name.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Offer or answer, carried verbatim between the transport and the relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// ICE candidate as the browser peers put it on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CandidatePayload {
    #[serde(default)]
    pub label: Option<u16>,
    #[serde(default)]
    pub id: Option<String>,
    pub candidate: String,
}

/// A candidate together with the user it is headed to, if known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidateRecord {
    pub media_line_index: Option<u16>,
    pub mid: Option<String>,
    pub candidate: String,
    pub target: Option<UserIdentity>,
}

impl IceCandidateRecord {
    pub fn new(candidate: impl Into<String>, mid: Option<String>, media_line_index: Option<u16>) -> Self {
        Self {
            media_line_index,
            mid,
            candidate: candidate.into(),
            target: None,
        }
    }

    pub fn addressed_to(mut self, target: UserIdentity) -> Self {
        self.target = Some(target);
        self
    }

    fn payload(&self) -> CandidatePayload {
        CandidatePayload {
            label: self.media_line_index,
            id: self.mid.clone(),
            candidate: self.candidate.clone(),
        }
    }
}

impl From<CandidatePayload> for IceCandidateRecord {
    fn from(payload: CandidatePayload) -> Self {
        Self::new(payload.candidate, payload.id, payload.label)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SignalEnvelope {
    // Outbound: announce ourselves once the socket is up
    Login { name: String },

    // Outbound: offer to `name`; the relay fills in the caller
    Call {
        name: String,
        rtc_message: SessionDescription,
    },

    // Outbound: answer back to whoever called us
    AnswerCall {
        caller: String,
        rtc_message: SessionDescription,
    },

    // Both directions: `user` is the target on the way out; inbound copies
    // usually arrive with neither field set
    #[serde(rename = "ICEcandidate")]
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller: Option<String>,
        rtc_message: CandidatePayload,
    },

    // Inbound: relay greeting and other informational text
    Connection { message: String },

    CallReceived {
        caller: String,
        rtc_message: SessionDescription,
    },

    CallAnswered { rtc_message: SessionDescription },
}

impl SignalEnvelope {
    const KNOWN_TYPES: [&'static str; 7] = [
        "login",
        "call",
        "answer_call",
        "ICEcandidate",
        "connection",
        "call_received",
        "call_answered",
    ];

    /// Builds the outbound candidate envelope. Records without a target are
    /// refused so nothing is ever sent to an unresolved user.
    pub fn outbound_candidate(record: &IceCandidateRecord) -> Option<Self> {
        let target = record.target.as_ref()?;
        Some(Self::IceCandidate {
            user: Some(target.as_str().to_owned()),
            caller: None,
            rtc_message: record.payload(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Login { .. } => "login",
            Self::Call { .. } => "call",
            Self::AnswerCall { .. } => "answer_call",
            Self::IceCandidate { .. } => "ICEcandidate",
            Self::Connection { .. } => "connection",
            Self::CallReceived { .. } => "call_received",
            Self::CallAnswered { .. } => "call_answered",
        }
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::IceCandidate { .. })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Result of reading one relay frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Envelope(SignalEnvelope),
    Unknown(String),
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
}

pub fn decode(text: &str) -> Result<Inbound, ProtocolError> {
    let raw: RawEnvelope = serde_json::from_str(text)?;
    if !SignalEnvelope::KNOWN_TYPES.contains(&raw.kind.as_str()) {
        return Ok(Inbound::Unknown(raw.kind));
    }
    serde_json::from_str(text)
        .map(Inbound::Envelope)
        .map_err(|source| ProtocolError::Malformed { kind: raw.kind, source })
}
