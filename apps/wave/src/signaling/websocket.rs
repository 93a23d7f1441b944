use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;
use wave_proto::{PeerId, SignalingMessage};

use super::{SignalingTransport, TransportError};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Relay connection over a websocket, one JSON message per text frame.
pub struct WebSocketSignaling {
    local_id: PeerId,
    send_tx: mpsc::UnboundedSender<Message>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<SignalingMessage>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketSignaling {
    pub async fn connect(relay_url: &str, local_id: PeerId) -> Result<Self, TransportError> {
        let websocket_url = derive_websocket_url(relay_url)?;
        let (ws_stream, _) = connect_async(websocket_url.as_str())
            .await
            .map_err(|err| TransportError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(
            target = "signaling",
            url = %websocket_url,
            peer = %local_id,
            "relay websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SignalingMessage>();

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                if ws_write.send(message).await.is_err() {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "signaling", "relay websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "signaling", "relay websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                tracing::trace!(target = "signaling", event = "ws_in", len = text.len());
                match SignalingMessage::from_text(&text) {
                    Ok(message) => {
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target = "signaling", error = %err, "unparseable relay frame");
                    }
                }
            }
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(Message::Ping(Vec::new())).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            local_id,
            send_tx,
            inbound: AsyncMutex::new(inbound_rx),
            tasks: Mutex::new(vec![writer, reader, heartbeat]),
        })
    }
}

#[async_trait]
impl SignalingTransport for WebSocketSignaling {
    fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    async fn send(&self, mut message: SignalingMessage) -> Result<(), TransportError> {
        message.sender_id = self.local_id.clone();
        let text = message.to_text()?;
        tracing::trace!(target = "signaling", event = "ws_out", kind = %message.kind, len = text.len());
        self.send_tx
            .send(Message::Text(text))
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn recv(&self) -> Option<SignalingMessage> {
        self.inbound.lock().await.recv().await
    }
}

impl Drop for WebSocketSignaling {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

/// Accepts http(s) or ws(s) relay urls; a bare host gets the `/ws` path.
fn derive_websocket_url(relay_url: &str) -> Result<Url, TransportError> {
    let base = Url::parse(relay_url)
        .map_err(|err| TransportError::Setup(format!("invalid relay url {relay_url}: {err}")))?;
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(TransportError::Setup(format!(
                "unsupported relay url scheme: {other}"
            )));
        }
    };
    let mut ws = base.clone();
    ws.set_scheme(scheme)
        .map_err(|_| TransportError::Setup("invalid websocket scheme".into()))?;
    if base.path().is_empty() || base.path() == "/" {
        ws.set_path("/ws");
    }
    ws.set_fragment(None);
    Ok(ws)
}
