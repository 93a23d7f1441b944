use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use relay_bus::{rejection, PeerSink, RoomRegistry};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wave_proto::{PeerId, SignalingMessage};

pub fn router(registry: Arc<RoomRegistry>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .with_state(registry)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<RoomRegistry>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, registry))
}

/// One participant. Its peer id is the sender of its first message; later
/// messages are always attributed to that id.
async fn handle_socket(socket: WebSocket, registry: Arc<RoomRegistry>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalingMessage>();
    let sink: Arc<dyn PeerSink> = Arc::new(tx);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match message.to_text() {
                Ok(text) => text,
                Err(err) => {
                    warn!(target = "relay", error = %err, "dropping unencodable message");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut bound: Option<PeerId> = None;
    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(target = "relay", error = %err, "websocket closed with error");
                break;
            }
        };
        let mut message = match SignalingMessage::from_text(&text) {
            Ok(message) => message,
            Err(err) => {
                warn!(target = "relay", error = %err, "unparseable frame");
                continue;
            }
        };
        let peer = bound
            .get_or_insert_with(|| {
                info!(target = "relay", peer = %message.sender_id, "participant connected");
                message.sender_id.clone()
            })
            .clone();
        message.sender_id = peer.clone();

        if let Err(err) = registry.handle(message, &sink) {
            debug!(target = "relay", peer = %peer, error = %err, "rejecting message");
            match rejection(&peer, &err) {
                Ok(notice) => {
                    let _ = sink.deliver(notice);
                }
                Err(err) => warn!(target = "relay", error = %err, "encode rejection failed"),
            }
        }
    }

    if let Some(peer) = bound {
        registry.leave(&peer);
        info!(target = "relay", peer = %peer, "participant disconnected");
    }
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use wave_proto::{
        CandidatePayload, ErrorPayload, IceCandidate, JoinPayload, MessageType,
        PeerJoinedPayload,
    };

    async fn serve(capacity: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::new(RoomRegistry::new(capacity)));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("ws://{addr}/ws")
    }

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn client(url: &str) -> Client {
        connect_async(url).await.unwrap().0
    }

    async fn send(client: &mut Client, message: SignalingMessage) {
        client
            .send(WsMessage::Text(message.to_text().unwrap()))
            .await
            .unwrap();
    }

    async fn next(client: &mut Client) -> SignalingMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("frame in time")
                .expect("stream open")
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return SignalingMessage::from_text(&text).unwrap();
            }
        }
    }

    fn join(peer: &str, room: &str) -> SignalingMessage {
        SignalingMessage::new(
            MessageType::Join,
            PeerId::from(peer),
            None,
            &JoinPayload { room: room.into() },
        )
        .unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn pairs_two_participants_and_forwards_between_them() {
        let url = serve(2).await;
        let mut a = client(&url).await;
        let mut b = client(&url).await;

        send(&mut a, join("a", "42")).await;
        send(&mut b, join("b", "42")).await;

        let to_a: PeerJoinedPayload = next(&mut a).await.decode_payload().unwrap();
        let to_b: PeerJoinedPayload = next(&mut b).await.decode_payload().unwrap();
        assert_eq!(to_a.peer_id, PeerId::from("b"));
        assert_eq!(to_b.peer_id, PeerId::from("a"));
        assert_eq!(to_a.pairing_id, to_b.pairing_id);
        assert!(to_a.your_seq < to_a.peer_seq);

        let candidate = SignalingMessage::new(
            MessageType::IceCandidate,
            PeerId::from("a"),
            Some(PeerId::from("b")),
            &CandidatePayload {
                pairing_id: to_a.pairing_id.clone(),
                candidate: IceCandidate::new("candidate:1 1 udp 1 127.0.0.1 5000 typ host"),
            },
        )
        .unwrap();
        send(&mut a, candidate.clone()).await;
        assert_eq!(next(&mut b).await, candidate);

        drop(a);
        let left = next(&mut b).await;
        assert_eq!(left.kind, MessageType::PeerLeft);
    }

    #[test_timeout::tokio_timeout_test]
    async fn full_room_answers_with_an_error_message() {
        let url = serve(1).await;
        let mut a = client(&url).await;
        let mut b = client(&url).await;
        send(&mut a, join("a", "solo")).await;
        // Wait for the relay to bind `a` before the second join.
        tokio::time::sleep(Duration::from_millis(50)).await;
        send(&mut b, join("b", "solo")).await;

        let error = next(&mut b).await;
        assert_eq!(error.kind, MessageType::Error);
        assert_eq!(error.target_id, Some(PeerId::from("b")));
        let payload: ErrorPayload = error.decode_payload().unwrap();
        assert!(payload.reason.contains("full"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn relay_identity_cannot_be_claimed() {
        let url = serve(2).await;
        let mut impostor = client(&url).await;
        send(&mut impostor, join(wave_proto::RELAY_SENDER_ID, "42")).await;

        let error = next(&mut impostor).await;
        assert_eq!(error.kind, MessageType::Error);
        let payload: ErrorPayload = error.decode_payload().unwrap();
        assert!(payload.reason.contains("reserved"));
    }
}
