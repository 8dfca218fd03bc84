//! The call state machine.
//!
//! One [`CallEngine`] task owns the relay channel, the current
//! [`CallSession`], its candidate buffers, media and transport. Everything
//! that can change them arrives as an [`EngineEvent`] and is handled to
//! completion before the next one. Work that has to wait (media capture,
//! offer/answer, descriptions) runs in spawned tasks that report back with a
//! [`Step`] stamped with the [`SessionToken`] they were started under; a step
//! whose token is no longer current is released and otherwise ignored.

use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::channel::{RelayLink, SendError, SignalingChannel};
use crate::error::CallError;
use crate::ice_buffer::IceCandidateBuffer;
use crate::media::{LocalMedia, MediaSource};
use crate::protocol::{IceCandidateRecord, Inbound, SdpKind, SessionDescription, SignalEnvelope, UserIdentity};
use crate::session::{CallPhase, CallSession, Direction, SessionToken};
use crate::transport::{PeerState, PeerTransport, TransportEvent, TransportEvents, TransportFactory};

/// User actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Dial(String),
    Accept,
    HangUp,
    /// Hang up, close the channel and stop the engine.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    HungUp,
    TransportLost(PeerState),
    Failed,
}

/// What the user gets to see.
#[derive(Debug)]
pub enum Notice {
    ChannelOpened,
    ChannelClosed,
    RelayMessage(String),
    Incoming { caller: UserIdentity },
    Connected { remote: UserIdentity },
    RemoteTrack { kind: String, id: String },
    Failed { error: CallError },
    Ended { remote: UserIdentity, reason: EndReason },
}

/// Completed piece of asynchronous call setup.
pub enum Step {
    MediaAcquired(LocalMedia),
    TransportCreated(Arc<dyn PeerTransport>),
    OfferReady(SessionDescription),
    RemoteDescriptionApplied,
    AnswerReady(SessionDescription),
    Failed(CallError),
}

impl Step {
    /// Gives back whatever a superseded step was carrying.
    fn release(self) {
        match self {
            Step::MediaAcquired(media) => media.stop(),
            Step::TransportCreated(transport) => close_transport(transport),
            _ => {}
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::MediaAcquired(media) => f.debug_tuple("MediaAcquired").field(&media.tracks().len()).finish(),
            Step::TransportCreated(_) => f.write_str("TransportCreated"),
            Step::OfferReady(_) => f.write_str("OfferReady"),
            Step::RemoteDescriptionApplied => f.write_str("RemoteDescriptionApplied"),
            Step::AnswerReady(_) => f.write_str("AnswerReady"),
            Step::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
        }
    }
}

#[derive(Debug)]
pub enum EngineEvent {
    Command(Command),
    ChannelOpened(RelayLink),
    ChannelClosed,
    Relay(Inbound),
    Transport { token: SessionToken, event: TransportEvent },
    Step { token: SessionToken, step: Step },
}

/// Published after every event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub remote_user: Option<UserIdentity>,
    pub direction: Option<Direction>,
    pub remote_description_set: bool,
    pub inbound_buffered: usize,
    pub outbound_buffered: usize,
    pub media_live: bool,
    pub has_transport: bool,
    pub channel_open: bool,
}

/// Cloneable front door to a running engine.
#[derive(Debug, Clone)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<EngineEvent>,
    snapshot: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    pub fn dial(&self, target: impl Into<String>) -> Result<(), CallError> {
        self.command(Command::Dial(target.into()))
    }

    pub fn accept(&self) -> Result<(), CallError> {
        self.command(Command::Accept)
    }

    pub fn hang_up(&self) -> Result<(), CallError> {
        self.command(Command::HangUp)
    }

    pub fn shutdown(&self) -> Result<(), CallError> {
        self.command(Command::Shutdown)
    }

    pub fn command(&self, command: Command) -> Result<(), CallError> {
        self.tx.send(EngineEvent::Command(command)).map_err(|_| CallError::EngineStopped)
    }

    /// Sender for the relay pump and anything else feeding the engine.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<EngineEvent> {
        self.tx.clone()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Waits until the published state satisfies `predicate`.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        predicate: impl FnMut(&CallSnapshot) -> bool,
    ) -> Option<CallSnapshot> {
        let mut rx = self.snapshot.clone();
        match tokio::time::timeout(timeout, rx.wait_for(predicate)).await {
            Ok(Ok(snapshot)) => Some(snapshot.clone()),
            _ => None,
        }
    }
}

pub struct CallEngine {
    channel: SignalingChannel,
    session: Option<CallSession>,
    candidates: IceCandidateBuffer,
    media: Option<LocalMedia>,
    transport: Option<Arc<dyn PeerTransport>>,
    applier: Option<mpsc::UnboundedSender<IceCandidateRecord>>,
    media_source: Arc<dyn MediaSource>,
    transports: Arc<dyn TransportFactory>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    notices: mpsc::UnboundedSender<Notice>,
    snapshot: watch::Sender<CallSnapshot>,
}

impl CallEngine {
    pub fn new(
        identity: UserIdentity,
        media_source: Arc<dyn MediaSource>,
        transports: Arc<dyn TransportFactory>,
    ) -> (Self, CallHandle, mpsc::UnboundedReceiver<Notice>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) = watch::channel(CallSnapshot::default());

        let handle = CallHandle {
            tx: events_tx.clone(),
            snapshot: snapshot_rx,
        };
        let engine = Self {
            channel: SignalingChannel::new(identity),
            session: None,
            candidates: IceCandidateBuffer::new(),
            media: None,
            transport: None,
            applier: None,
            media_source,
            transports,
            events_tx,
            events_rx,
            notices,
            snapshot,
        };
        (engine, handle, notices_rx)
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events_rx.recv().await {
            if self.handle(event).is_break() {
                break;
            }
        }
        debug!(user = %self.channel.identity(), "call engine stopped");
    }

    pub fn handle(&mut self, event: EngineEvent) -> ControlFlow<()> {
        trace!(?event, "engine event");
        let flow = match event {
            EngineEvent::Command(command) => self.on_command(command),
            EngineEvent::ChannelOpened(link) => {
                self.on_channel_opened(link);
                ControlFlow::Continue(())
            }
            EngineEvent::ChannelClosed => {
                self.on_channel_closed();
                ControlFlow::Continue(())
            }
            EngineEvent::Relay(inbound) => {
                self.on_relay(inbound);
                ControlFlow::Continue(())
            }
            EngineEvent::Transport { token, event } => {
                self.on_transport(token, event);
                ControlFlow::Continue(())
            }
            EngineEvent::Step { token, step } => {
                self.on_step(token, step);
                ControlFlow::Continue(())
            }
        };
        self.publish();
        flow
    }

    fn on_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Dial(target) => self.dial(&target),
            Command::Accept => self.accept(),
            Command::HangUp => {
                if self.session.is_none() {
                    debug!("no call to hang up");
                }
                self.end_call(EndReason::HungUp);
            }
            Command::Shutdown => {
                self.end_call(EndReason::HungUp);
                self.channel.close();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn dial(&mut self, target: &str) {
        if let Some(session) = &self.session {
            warn!(phase = ?session.phase(), remote = %session.remote_user(), "already in a call, not dialing");
            return;
        }
        let remote = match UserIdentity::parse(target) {
            Ok(remote) if &remote == self.channel.identity() => {
                self.notify(Notice::Failed {
                    error: CallError::InvalidIdentity(target.to_owned()),
                });
                return;
            }
            Ok(remote) => remote,
            Err(error) => {
                self.notify(Notice::Failed { error });
                return;
            }
        };

        let session = CallSession::outgoing(remote);
        let token = session.token();
        info!(callee = %session.remote_user(), %token, "calling");
        self.session = Some(session);
        self.acquire_media(token);
    }

    fn accept(&mut self) {
        let Some(session) = self.session.as_mut() else {
            warn!("no incoming call to accept");
            return;
        };
        if !session.accept() {
            warn!(phase = ?session.phase(), "nothing to accept");
            return;
        }
        let token = session.token();
        info!(caller = %session.remote_user(), %token, "accepting call");
        self.acquire_media(token);
    }

    fn acquire_media(&self, token: SessionToken) {
        let source = self.media_source.clone();
        self.spawn_step(token, async move { Ok(Step::MediaAcquired(source.acquire().await?)) });
    }

    fn on_step(&mut self, token: SessionToken, step: Step) {
        if !self.is_current(token) {
            debug!(%token, ?step, "stale step, discarding");
            step.release();
            return;
        }

        match step {
            Step::MediaAcquired(media) => {
                self.media = Some(media);
                let factory = self.transports.clone();
                let events = TransportEvents::new(token, self.events_tx.clone());
                self.spawn_step(token, async move { Ok(Step::TransportCreated(factory.create(events).await?)) });
            }
            Step::TransportCreated(transport) => self.on_transport_created(token, transport),
            Step::OfferReady(offer) => self.send_offer(offer),
            Step::RemoteDescriptionApplied => self.on_remote_description_applied(token),
            Step::AnswerReady(answer) => self.send_answer(answer),
            Step::Failed(error) => self.fail(error),
        }
    }

    fn on_transport_created(&mut self, token: SessionToken, transport: Arc<dyn PeerTransport>) {
        self.transport = Some(transport.clone());
        let Some(media) = self.media.clone() else {
            self.fail(CallError::MediaUnavailable("media released before transport came up".into()));
            return;
        };
        let Some(session) = self.session.as_mut() else { return };

        match session.direction() {
            Direction::Outgoing => {
                self.spawn_step(token, async move {
                    transport.add_local_tracks(&media).await?;
                    let offer = transport.create_offer().await?;
                    transport.set_local_description(offer.clone()).await?;
                    Ok(Step::OfferReady(offer))
                });
            }
            Direction::Incoming => {
                let Some(offer) = session.take_remote_offer() else {
                    self.fail(CallError::DescriptionRejected("incoming call without an offer".into()));
                    return;
                };
                if let Err(err) = session.begin_remote_description() {
                    self.fail(err);
                    return;
                }
                self.spawn_step(token, async move {
                    transport.add_local_tracks(&media).await?;
                    transport.set_remote_description(offer).await?;
                    Ok(Step::RemoteDescriptionApplied)
                });
            }
        }
    }

    fn send_offer(&mut self, offer: SessionDescription) {
        let Some(callee) = self.session.as_ref().map(|s| s.remote_user().clone()) else { return };
        let envelope = SignalEnvelope::Call {
            name: callee.as_str().to_owned(),
            rtc_message: offer,
        };
        match self.signal(envelope) {
            Ok(()) => {
                info!(%callee, "offer sent");
                self.release_held_candidates();
            }
            Err(err) => self.fail(err),
        }
    }

    fn send_answer(&mut self, answer: SessionDescription) {
        let Some(session) = &self.session else { return };
        let envelope = SignalEnvelope::AnswerCall {
            caller: session.remote_user().as_str().to_owned(),
            rtc_message: answer,
        };
        match self.signal(envelope) {
            Ok(()) => {
                self.release_held_candidates();
                self.call_connected();
            }
            Err(err) => self.fail(err),
        }
    }

    /// Releases local candidates held back until our description went out.
    fn release_held_candidates(&mut self) {
        let Some(session) = self.session.as_mut() else { return };
        session.mark_description_sent();
        if !self.channel.is_open() {
            return;
        }
        for candidate in self.candidates.drain_outbound() {
            self.signal_candidate(candidate);
        }
    }

    fn on_remote_description_applied(&mut self, token: SessionToken) {
        let Some(session) = self.session.as_mut() else { return };
        session.remote_description_applied();
        let phase = session.phase();

        let Some(transport) = self.transport.clone() else { return };
        self.start_applier(token, transport.clone());

        match phase {
            CallPhase::Calling => self.call_connected(),
            CallPhase::Answering => {
                self.spawn_step(token, async move {
                    let answer = transport.create_answer().await?;
                    transport.set_local_description(answer.clone()).await?;
                    Ok(Step::AnswerReady(answer))
                });
            }
            phase => warn!(?phase, "remote description applied in unexpected phase"),
        }
    }

    /// Remote candidates go through one task per call so they reach the
    /// transport in arrival order. Anything buffered goes first.
    fn start_applier(&mut self, token: SessionToken, transport: Arc<dyn PeerTransport>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<IceCandidateRecord>();
        tokio::spawn(async move {
            while let Some(candidate) = rx.recv().await {
                if let Err(err) = transport.add_ice_candidate(candidate).await {
                    warn!(%token, %err, "remote candidate not applied");
                }
            }
        });

        let buffered = self.candidates.drain_inbound();
        if !buffered.is_empty() {
            debug!(count = buffered.len(), "flushing buffered remote candidates");
        }
        for candidate in buffered {
            let _ = tx.send(candidate);
        }
        self.applier = Some(tx);
    }

    fn call_connected(&mut self) {
        let Some(session) = self.session.as_mut() else { return };
        session.connect();
        info!(remote = %session.remote_user(), token = %session.token(), "call connected");
        let remote = session.remote_user().clone();
        self.notify(Notice::Connected { remote });
    }

    fn on_relay(&mut self, inbound: Inbound) {
        let envelope = match inbound {
            Inbound::Envelope(envelope) => envelope,
            Inbound::Unknown(kind) => {
                warn!(%kind, "ignoring unknown message type");
                return;
            }
        };
        match envelope {
            SignalEnvelope::Connection { message } => {
                info!(%message, "relay");
                self.notify(Notice::RelayMessage(message));
            }
            SignalEnvelope::CallReceived { caller, rtc_message } => self.on_call_received(caller, rtc_message),
            SignalEnvelope::CallAnswered { rtc_message } => self.on_call_answered(rtc_message),
            SignalEnvelope::IceCandidate { rtc_message, .. } => self.on_remote_candidate(rtc_message.into()),
            other @ (SignalEnvelope::Login { .. } | SignalEnvelope::Call { .. } | SignalEnvelope::AnswerCall { .. }) => {
                warn!(kind = other.kind(), "ignoring client-only message from relay");
            }
        }
    }

    fn on_call_received(&mut self, caller: String, offer: SessionDescription) {
        if let Some(session) = &self.session {
            let busy = CallError::Busy { caller };
            info!(phase = ?session.phase(), "{busy}");
            return;
        }
        let caller = match UserIdentity::parse(&caller) {
            Ok(caller) => caller,
            Err(err) => {
                warn!(%err, "incoming call without a caller");
                return;
            }
        };
        if offer.kind != SdpKind::Offer {
            warn!(%caller, kind = ?offer.kind, "incoming call does not carry an offer");
            return;
        }

        let session = CallSession::incoming(caller.clone(), offer);
        info!(%caller, token = %session.token(), "incoming call");
        self.session = Some(session);
        self.notify(Notice::Incoming { caller });
    }

    fn on_call_answered(&mut self, answer: SessionDescription) {
        let Some(session) = self.session.as_mut() else {
            info!("answer for a call that is no longer active, ignoring");
            return;
        };
        if session.phase() != CallPhase::Calling {
            warn!(phase = ?session.phase(), "unexpected answer, ignoring");
            return;
        }
        // Without a generation on the wire, an answer before our offer is
        // either early or left over from a previous call to the same peer
        let Some(transport) = self.transport.clone().filter(|_| session.description_sent()) else {
            warn!(callee = %session.remote_user(), "answer arrived before the offer went out, ignoring");
            return;
        };
        if let Err(err) = session.begin_remote_description() {
            warn!(%err, "duplicate answer, ignoring");
            return;
        }

        let token = session.token();
        debug!(callee = %session.remote_user(), %token, "applying answer");
        self.spawn_step(token, async move {
            transport.set_remote_description(answer).await?;
            Ok(Step::RemoteDescriptionApplied)
        });
    }

    fn on_remote_candidate(&mut self, candidate: IceCandidateRecord) {
        let Some(session) = &self.session else {
            debug!("remote candidate with no call, dropping");
            return;
        };
        match &self.applier {
            Some(applier) if session.remote_description_set() => {
                let _ = applier.send(candidate);
            }
            _ => {
                self.candidates.buffer_inbound(candidate);
                trace!(buffered = self.candidates.inbound_len(), "remote candidate buffered");
            }
        }
    }

    fn on_transport(&mut self, token: SessionToken, event: TransportEvent) {
        if !self.is_current(token) {
            trace!(%token, ?event, "event from a previous call, ignoring");
            return;
        }
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let Some(session) = &self.session else { return };
                let candidate = candidate.addressed_to(session.remote_user().clone());
                if session.description_sent() {
                    self.signal_candidate(candidate);
                } else {
                    self.candidates.buffer_outbound(candidate);
                }
            }
            TransportEvent::StateChanged(state) => {
                debug!(?state, "transport state");
                if state.ends_call() {
                    info!(?state, "transport lost");
                    self.end_call(EndReason::TransportLost(state));
                }
            }
            TransportEvent::RemoteTrack { kind, id } => {
                info!(%kind, %id, "remote track");
                self.notify(Notice::RemoteTrack { kind, id });
            }
        }
    }

    fn signal_candidate(&mut self, candidate: IceCandidateRecord) {
        let Some(envelope) = SignalEnvelope::outbound_candidate(&candidate) else {
            warn!("local candidate without a target, dropping");
            return;
        };
        match self.channel.send(envelope) {
            Ok(()) => {}
            Err(SendError::Deferred(_)) => {
                self.candidates.buffer_outbound(candidate);
                trace!(queued = self.candidates.outbound_len(), "local candidate queued until relay opens");
            }
            Err(SendError::Unavailable) => warn!("local candidate not sent"),
        }
    }

    fn signal(&mut self, envelope: SignalEnvelope) -> Result<(), CallError> {
        self.channel.send(envelope).map_err(|_| CallError::ChannelUnavailable)
    }

    fn on_channel_opened(&mut self, link: RelayLink) {
        if let Err(err) = self.channel.open(link) {
            warn!(%err, "relay login failed");
            return;
        }
        info!(user = %self.channel.identity(), "logged in to relay");

        // Held candidates stay put until our description has gone out
        if self.session.as_ref().is_some_and(CallSession::description_sent) {
            let queued = self.candidates.drain_outbound();
            if !queued.is_empty() {
                debug!(count = queued.len(), "flushing queued local candidates");
            }
            for candidate in queued {
                self.signal_candidate(candidate);
            }
        }
        self.notify(Notice::ChannelOpened);
    }

    fn on_channel_closed(&mut self) {
        self.channel.close();
        // Queued candidates and the call itself are left alone.
        warn!(
            in_call = self.session.is_some(),
            queued = self.candidates.outbound_len(),
            "relay channel closed"
        );
        self.notify(Notice::ChannelClosed);
    }

    fn fail(&mut self, error: CallError) {
        error!(%error, "call failed");
        self.notify(Notice::Failed { error });
        self.end_call(EndReason::Failed);
    }

    /// Back to Idle: media stopped, transport closed, buffers cleared.
    fn end_call(&mut self, reason: EndReason) {
        let Some(session) = self.session.take() else { return };

        if let Some(media) = self.media.take() {
            media.stop();
        }
        if let Some(transport) = self.transport.take() {
            close_transport(transport);
        }
        self.applier = None;
        self.candidates.clear();

        info!(
            remote = %session.remote_user(),
            token = %session.token(),
            ?reason,
            elapsed = ?session.elapsed(),
            "call ended"
        );
        self.notify(Notice::Ended {
            remote: session.remote_user().clone(),
            reason,
        });
    }

    fn is_current(&self, token: SessionToken) -> bool {
        self.session.as_ref().is_some_and(|session| session.is_current(token))
    }

    fn spawn_step<F>(&self, token: SessionToken, work: F)
    where
        F: Future<Output = Result<Step, CallError>> + Send + 'static,
    {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let step = work.await.unwrap_or_else(Step::Failed);
            let _ = events.send(EngineEvent::Step { token, step });
        });
    }

    fn notify(&self, notice: Notice) {
        if self.notices.send(notice).is_err() {
            trace!("nobody listening for notices");
        }
    }

    fn publish(&self) {
        let session = self.session.as_ref();
        let snapshot = CallSnapshot {
            phase: session.map_or(CallPhase::Idle, CallSession::phase),
            remote_user: session.map(|s| s.remote_user().clone()),
            direction: session.map(CallSession::direction),
            remote_description_set: session.is_some_and(CallSession::remote_description_set),
            inbound_buffered: self.candidates.inbound_len(),
            outbound_buffered: self.candidates.outbound_len(),
            media_live: self.media.as_ref().is_some_and(LocalMedia::is_live),
            has_transport: self.transport.is_some(),
            channel_open: self.channel.is_open(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}

fn close_transport(transport: Arc<dyn PeerTransport>) {
    tokio::spawn(async move {
        if let Err(err) = transport.close().await {
            warn!(%err, "closing transport");
        }
    });
}
