#![allow(dead_code)]

pub mod relay;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};

use koda_call::engine::EngineEvent;
use koda_call::media::{LocalMedia, SyntheticMedia};
use koda_call::protocol::{
    IceCandidateRecord, Inbound, SdpKind, SessionDescription, SignalEnvelope, UserIdentity, decode,
};
use koda_call::transport::{PeerTransport, TransportEvent, TransportEvents, TransportFactory};
use koda_call::{CallEngine, CallError, CallHandle, CallPhase, CallSnapshot, Notice};

pub const WAIT: Duration = Duration::from_secs(2);

/// SDP that the fake refuses as a remote description.
pub const BAD_SDP: &str = "garbage";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    AddTracks(usize),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    RejectedCandidate(String),
    Close,
}

pub struct FakeTransport {
    label: String,
    ops: Mutex<Vec<Op>>,
    media: Mutex<Option<LocalMedia>>,
    remote_set: AtomicBool,
    closed: AtomicBool,
    events: TransportEvents,
    offer_gate: Option<Arc<Semaphore>>,
    answer_gate: Option<Arc<Semaphore>>,
    local_candidates: Vec<String>,
}

impl FakeTransport {
    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::AddCandidate(candidate) => Some(candidate),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn media(&self) -> Option<LocalMedia> {
        self.media.lock().unwrap().clone()
    }

    /// Pretends the underlying connection reported something.
    pub fn emit(&self, event: TransportEvent) {
        self.events.emit(event);
    }

    async fn pass(gate: &Option<Arc<Semaphore>>) {
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        Self::pass(&self.offer_gate).await;
        self.record(Op::CreateOffer);
        Ok(SessionDescription::offer(format!("offer from {}", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        Self::pass(&self.answer_gate).await;
        self.record(Op::CreateAnswer);
        Ok(SessionDescription::answer(format!("answer from {}", self.label)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), CallError> {
        self.record(Op::SetLocal(description.kind));
        for candidate in &self.local_candidates {
            self.emit(TransportEvent::LocalCandidate(IceCandidateRecord::new(
                candidate.clone(),
                Some("0".into()),
                Some(0),
            )));
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), CallError> {
        if description.sdp == BAD_SDP {
            return Err(CallError::DescriptionRejected("unparseable sdp".into()));
        }
        self.record(Op::SetRemote(description.kind));
        self.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateRecord) -> Result<(), CallError> {
        if !self.remote_set.load(Ordering::SeqCst) {
            self.record(Op::RejectedCandidate(candidate.candidate));
            return Err(CallError::CandidateRejected("no remote description".into()));
        }
        self.record(Op::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn add_local_tracks(&self, media: &LocalMedia) -> Result<(), CallError> {
        self.record(Op::AddTracks(media.tracks().len()));
        *self.media.lock().unwrap() = Some(media.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), CallError> {
        self.record(Op::Close);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTransports {
    label: String,
    created: Mutex<Vec<Arc<FakeTransport>>>,
    pub offer_gate: Option<Arc<Semaphore>>,
    pub answer_gate: Option<Arc<Semaphore>>,
    pub local_candidates: Vec<String>,
}

impl FakeTransports {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_owned(),
            ..Default::default()
        }
    }

    pub fn with_offer_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.offer_gate = Some(gate);
        self
    }

    pub fn with_answer_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.answer_gate = Some(gate);
        self
    }

    pub fn with_local_candidates(mut self, candidates: &[&str]) -> Self {
        self.local_candidates = candidates.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn created(&self) -> Vec<Arc<FakeTransport>> {
        self.created.lock().unwrap().clone()
    }

    pub fn latest(&self) -> Arc<FakeTransport> {
        self.created().pop().expect("no transport created yet")
    }
}

#[async_trait]
impl TransportFactory for FakeTransports {
    async fn create(&self, events: TransportEvents) -> Result<Arc<dyn PeerTransport>, CallError> {
        let transport = Arc::new(FakeTransport {
            label: self.label.clone(),
            ops: Mutex::new(Vec::new()),
            media: Mutex::new(None),
            remote_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
            offer_gate: self.offer_gate.clone(),
            answer_gate: self.answer_gate.clone(),
            local_candidates: self.local_candidates.clone(),
        });
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

/// One engine under test, with the test standing in for the relay.
pub struct Peer {
    pub name: String,
    pub handle: CallHandle,
    pub notices: mpsc::UnboundedReceiver<Notice>,
    pub transports: Arc<FakeTransports>,
    relay_rx: Option<mpsc::UnboundedReceiver<String>>,
}

impl Peer {
    pub fn spawn(name: &str) -> Self {
        Self::spawn_with(name, SyntheticMedia::default(), FakeTransports::new(name))
    }

    pub fn spawn_with(name: &str, media: SyntheticMedia, transports: FakeTransports) -> Self {
        let transports = Arc::new(transports);
        let identity = UserIdentity::parse(name).unwrap();
        let (engine, handle, notices) = CallEngine::new(identity, Arc::new(media), transports.clone());
        tokio::spawn(engine.run());
        Self {
            name: name.to_owned(),
            handle,
            notices,
            transports,
            relay_rx: None,
        }
    }

    /// Hands the engine a fresh relay link and checks the login on it.
    pub async fn open_channel(&mut self) {
        let (link, rx) = mpsc::unbounded_channel();
        self.relay_rx = Some(rx);
        self.inject(EngineEvent::ChannelOpened(link));
        let login = self.next_sent().await;
        assert_eq!(login, SignalEnvelope::Login { name: self.name.clone() });
    }

    pub fn close_channel(&mut self) {
        self.inject(EngineEvent::ChannelClosed);
    }

    pub fn inject(&self, event: EngineEvent) {
        self.handle.event_sender().send(event).unwrap();
    }

    pub fn deliver(&self, envelope: SignalEnvelope) {
        self.inject(EngineEvent::Relay(Inbound::Envelope(envelope)));
    }

    pub fn deliver_candidate(&self, candidate: &str) {
        self.deliver(remote_candidate(candidate));
    }

    pub async fn next_sent(&mut self) -> SignalEnvelope {
        let rx = self.relay_rx.as_mut().expect("channel never opened");
        let text = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("nothing sent to relay")
            .expect("relay link dropped");
        match decode(&text).unwrap() {
            Inbound::Envelope(envelope) => envelope,
            Inbound::Unknown(kind) => panic!("engine sent unknown type {kind}"),
        }
    }

    /// Everything sent so far without waiting.
    pub fn sent_now(&mut self) -> Vec<SignalEnvelope> {
        let Some(rx) = self.relay_rx.as_mut() else { return Vec::new() };
        let mut sent = Vec::new();
        while let Ok(text) = rx.try_recv() {
            if let Ok(Inbound::Envelope(envelope)) = decode(&text) {
                sent.push(envelope);
            }
        }
        sent
    }

    pub async fn expect_notice(&mut self, mut predicate: impl FnMut(&Notice) -> bool) -> Notice {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let notice = tokio::time::timeout_at(deadline, self.notices.recv())
                .await
                .expect("expected notice never came")
                .expect("engine stopped");
            if predicate(&notice) {
                return notice;
            }
        }
    }

    pub async fn wait_for(&self, predicate: impl FnMut(&CallSnapshot) -> bool) -> CallSnapshot {
        self.handle.wait_for(WAIT, predicate).await.expect("state never reached")
    }

    pub async fn wait_phase(&self, phase: CallPhase) -> CallSnapshot {
        self.wait_for(|s| s.phase == phase).await
    }

    /// Lets queued events run so that "nothing happened" can be asserted.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Dials `callee`, returns the offer that went to the relay.
    pub async fn dial(&mut self, callee: &str) -> SessionDescription {
        self.handle.dial(callee).unwrap();
        match self.next_sent().await {
            SignalEnvelope::Call { name, rtc_message } => {
                assert_eq!(name, callee);
                rtc_message
            }
            other => panic!("expected call, got {other:?}"),
        }
    }
}

pub fn remote_candidate(candidate: &str) -> SignalEnvelope {
    SignalEnvelope::IceCandidate {
        user: None,
        caller: None,
        rtc_message: koda_call::protocol::CandidatePayload {
            label: Some(0),
            id: Some("0".into()),
            candidate: candidate.to_owned(),
        },
    }
}

/// Polls until `condition` holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Runs alice -> bob up to Connected on both ends, routing like the relay.
pub async fn connect_pair(alice: &mut Peer, bob: &mut Peer) {
    let offer = alice.dial(&bob.name).await;
    bob.deliver(SignalEnvelope::CallReceived {
        caller: alice.name.clone(),
        rtc_message: offer,
    });
    bob.wait_phase(CallPhase::Ringing).await;
    bob.handle.accept().unwrap();

    let answer = match bob.next_sent().await {
        SignalEnvelope::AnswerCall { caller, rtc_message } => {
            assert_eq!(caller, alice.name);
            rtc_message
        }
        other => panic!("expected answer_call, got {other:?}"),
    };
    bob.wait_phase(CallPhase::Connected).await;

    alice.deliver(SignalEnvelope::CallAnswered { rtc_message: answer });
    alice.wait_phase(CallPhase::Connected).await;
}
