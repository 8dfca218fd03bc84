use std::time::Duration;

use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::engine::EngineEvent;
use crate::error::CallError;
use crate::protocol::{self, SignalEnvelope, UserIdentity};

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Outgoing half of an open relay connection: encoded JSON frames.
pub type RelayLink = mpsc::UnboundedSender<String>;

/// Why a send did not go out.
#[derive(Debug)]
pub enum SendError {
    /// Candidate envelope handed back so the caller can queue it.
    Deferred(SignalEnvelope),
    Unavailable,
}

/// Relay connection state as seen by the engine.
#[derive(Debug)]
pub struct SignalingChannel {
    identity: UserIdentity,
    link: Option<RelayLink>,
}

impl SignalingChannel {
    pub fn new(identity: UserIdentity) -> Self {
        Self { identity, link: None }
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    pub fn is_open(&self) -> bool {
        self.link.as_ref().is_some_and(|link| !link.is_closed())
    }

    /// Takes over a freshly opened link and logs in on it.
    pub fn open(&mut self, link: RelayLink) -> Result<(), CallError> {
        self.link = Some(link);
        let login = SignalEnvelope::Login {
            name: self.identity.as_str().to_owned(),
        };
        self.transmit(&login)
    }

    pub fn close(&mut self) {
        self.link = None;
    }

    pub fn send(&mut self, envelope: SignalEnvelope) -> Result<(), SendError> {
        if !self.is_open() {
            if envelope.is_candidate() {
                return Err(SendError::Deferred(envelope));
            }
            warn!(kind = envelope.kind(), "signaling channel closed, dropping message");
            return Err(SendError::Unavailable);
        }
        match self.transmit(&envelope) {
            Ok(()) => Ok(()),
            Err(_) if envelope.is_candidate() => Err(SendError::Deferred(envelope)),
            Err(err) => {
                warn!(kind = envelope.kind(), %err, "failed to send");
                Err(SendError::Unavailable)
            }
        }
    }

    fn transmit(&mut self, envelope: &SignalEnvelope) -> Result<(), CallError> {
        let text = envelope.encode()?;
        let Some(link) = self.link.as_ref() else {
            return Err(CallError::ChannelUnavailable);
        };
        if link.send(text).is_err() {
            self.link = None;
            return Err(CallError::ChannelUnavailable);
        }
        debug!(kind = envelope.kind(), "sent");
        Ok(())
    }
}

/// Opens the relay WebSocket for `identity` and pumps it into the engine.
///
/// The engine receives [`EngineEvent::ChannelOpened`] with the link, then one
/// [`EngineEvent::Relay`] per frame, and [`EngineEvent::ChannelClosed`] when
/// the socket goes away. There is no reconnect.
pub async fn connect(
    config: &ClientConfig,
    identity: &str,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> Result<JoinHandle<()>, CallError> {
    if identity.trim().is_empty() {
        return Err(CallError::ChannelUnavailable);
    }
    let url = config.relay_url(identity.trim())?;

    let (socket, _) = connect_async(url.as_str()).await.map_err(|err| {
        warn!(%url, %err, "relay connection failed");
        CallError::ChannelUnavailable
    })?;
    info!(%url, "relay connected");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let send_task = tokio::spawn(async move {
        let mut ping_interval = time::interval(PING_INTERVAL);
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(text) = frame else { break };
                    if sender.send(Message::text(text)).await.is_err() { break; }
                }
                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(vec![].into())).await.is_err() { break; }
                }
            }
        }
        let _ = sender.close().await;
    });

    if events.send(EngineEvent::ChannelOpened(tx)).is_err() {
        send_task.abort();
        return Err(CallError::ChannelUnavailable);
    }

    Ok(tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => match protocol::decode(text.as_str()) {
                    Ok(inbound) => {
                        if events.send(EngineEvent::Relay(inbound)).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(%err, "dropping relay frame"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, "relay connection error");
                    break;
                }
            }
        }

        info!("relay connection closed");
        let _ = events.send(EngineEvent::ChannelClosed);
        send_task.abort();
    }))
}
