//! [`PeerTransport`] backed by the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::error::CallError;
use crate::media::{LocalMedia, TrackKind};
use crate::protocol::{IceCandidateRecord, SdpKind, SessionDescription};
use crate::transport::{PeerState, PeerTransport, TransportEvent, TransportEvents, TransportFactory};

pub struct RtcTransportFactory {
    ice_servers: Vec<String>,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

fn transport_error(err: webrtc::Error) -> CallError {
    CallError::Transport(err.to_string())
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(&self, events: TransportEvents) -> Result<Arc<dyn PeerTransport>, CallError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(transport_error)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(transport_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(transport_error)?);

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => events.emit(TransportEvent::LocalCandidate(IceCandidateRecord::new(
                        init.candidate,
                        init.sdp_mid,
                        init.sdp_mline_index,
                    ))),
                    Err(err) => warn!(%err, "could not serialize local candidate"),
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(?state, "peer connection state");
            state_events.emit(TransportEvent::StateChanged(peer_state(state)));
            Box::pin(async {})
        }));

        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            events.emit(TransportEvent::RemoteTrack {
                kind: track.kind().to_string(),
                id: track.id(),
            });
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcTransport { pc }))
    }
}

fn peer_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, CallError> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|err| CallError::DescriptionRejected(err.to_string()))
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, CallError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(CallError::DescriptionRejected(format!("unsupported description type {other}"))),
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90_000,
            ..Default::default()
        },
    }
}

struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let offer = self.pc.create_offer(None).await.map_err(transport_error)?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| CallError::DescriptionRejected(err.to_string()))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), CallError> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(|err| CallError::DescriptionRejected(err.to_string()))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), CallError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(|err| CallError::DescriptionRejected(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateRecord) -> Result<(), CallError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.mid,
            sdp_mline_index: candidate.media_line_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| CallError::CandidateRejected(err.to_string()))
    }

    async fn add_local_tracks(&self, media: &LocalMedia) -> Result<(), CallError> {
        for track in media.tracks() {
            let local = Arc::new(TrackLocalStaticSample::new(
                codec_for(track.kind()),
                track.id().to_owned(),
                media.stream_id().to_owned(),
            ));
            let sender = self
                .pc
                .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(transport_error)?;

            // RTCP has to be read for the interceptors to run
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), CallError> {
        self.pc.close().await.map_err(transport_error)
    }
}
