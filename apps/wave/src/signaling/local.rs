use async_trait::async_trait;
use relay_bus::{LocalConnection, RelayError};
use wave_proto::{PeerId, SignalingMessage};

use super::{SignalingTransport, TransportError};

#[async_trait]
impl SignalingTransport for LocalConnection {
    fn local_id(&self) -> &PeerId {
        self.peer_id()
    }

    async fn send(&self, message: SignalingMessage) -> Result<(), TransportError> {
        LocalConnection::send(self, message).map_err(|err| match err {
            RelayError::Closed => TransportError::ChannelClosed,
            other => TransportError::Rejected(other.to_string()),
        })
    }

    async fn recv(&self) -> Option<SignalingMessage> {
        LocalConnection::recv(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_bus::LocalRelay;
    use wave_proto::{CandidatePayload, IceCandidate, MessageType};

    #[tokio::test]
    async fn unroutable_messages_surface_as_rejections() {
        let relay = LocalRelay::new();
        let conn = relay.connect(PeerId::from("a"));
        let message = SignalingMessage::new(
            MessageType::IceCandidate,
            PeerId::from("a"),
            Some(PeerId::from("b")),
            &CandidatePayload {
                pairing_id: "p".into(),
                candidate: IceCandidate::new("candidate:1"),
            },
        )
        .unwrap();
        let err = SignalingTransport::send(&conn, message).await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected(_)));
        assert_eq!(SignalingTransport::local_id(&conn), &PeerId::from("a"));
    }
}
