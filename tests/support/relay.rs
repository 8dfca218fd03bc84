//! Loopback relay: `/ws/call/{username}/`, forwarding envelopes by name.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use dashmap::DashMap;
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;

use koda_call::protocol::{Inbound, SignalEnvelope, decode};

type PeerMap = Arc<DashMap<String, mpsc::UnboundedSender<Message>>>;

/// Binds an ephemeral port and serves until the test runtime goes away.
pub async fn spawn() -> SocketAddr {
    let peers: PeerMap = Arc::new(DashMap::new());
    let app = Router::new()
        .route("/ws/call/{username}/", get(ws_handler))
        .with_state(peers);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(username): Path<String>,
    State(peers): State<PeerMap>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, username, peers))
}

fn frame(envelope: &SignalEnvelope) -> Message {
    Message::Text(envelope.encode().unwrap().into())
}

async fn handle_socket(socket: WebSocket, username: String, peers: PeerMap) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    peers.insert(username.clone(), tx.clone());
    let _ = tx.send(frame(&SignalEnvelope::Connection {
        message: format!("User {username} connected"),
    }));

    while let Some(Ok(msg)) = receiver.next().await {
        let Message::Text(text) = msg else { continue };
        let Ok(Inbound::Envelope(envelope)) = decode(text.as_str()) else { continue };

        let (target, routed) = match envelope {
            SignalEnvelope::Call { name, rtc_message } => (
                name,
                SignalEnvelope::CallReceived {
                    caller: username.clone(),
                    rtc_message,
                },
            ),
            SignalEnvelope::AnswerCall { caller, rtc_message } => {
                (caller, SignalEnvelope::CallAnswered { rtc_message })
            }
            SignalEnvelope::IceCandidate {
                user: Some(user),
                rtc_message,
                ..
            } => (
                user,
                SignalEnvelope::IceCandidate {
                    user: None,
                    caller: None,
                    rtc_message,
                },
            ),
            _ => continue,
        };

        if let Some(peer_tx) = peers.get(&target) {
            let _ = peer_tx.send(frame(&routed));
        }
    }

    peers.remove(&username);
    send_task.abort();
}
