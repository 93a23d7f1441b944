//! Getting signaling messages to and from the relay.

pub mod local;
pub mod router;
pub mod websocket;

use async_trait::async_trait;
use thiserror::Error;
use wave_proto::{PeerId, ProtoError, SignalingMessage};

pub use router::{RouteError, Routed, SignalingRouter};
pub use websocket::WebSocketSignaling;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("signaling setup failed: {0}")]
    Setup(String),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error(transparent)]
    Encode(#[from] ProtoError),
    #[error("relay rejected message: {0}")]
    Rejected(String),
}

/// A connection to the relay carrying whole signaling messages.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    fn local_id(&self) -> &PeerId;

    async fn send(&self, message: SignalingMessage) -> Result<(), TransportError>;

    /// `None` once the connection is gone for good.
    async fn recv(&self) -> Option<SignalingMessage>;
}
