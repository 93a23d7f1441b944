//! The platform peer connection behind a narrow async seam.
//!
//! A session owns exactly one handle. Every mutation goes through the
//! session's operation worker; the handle reports what happens on its side
//! (candidates, negotiation-needed, remote tracks, connection state) through
//! the event receiver returned once by [`PeerConnectionHandle::take_events`].

pub mod mock;
pub mod rtc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use wave_proto::{IceCandidate, PeerId, SessionDescription};

use crate::config::EngineConfig;
use crate::media::{MediaTrack, TrackSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// A handle in a terminal state is discarded, never reused.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl SignalingState {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::Closed => "closed",
        }
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleEvent {
    LocalCandidate(IceCandidate),
    NegotiationNeeded,
    RemoteTrack(MediaTrack),
    ConnectionState(ConnectionState),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandleError {
    #[error("{operation} is not valid in signaling state {state}")]
    InvalidState {
        operation: &'static str,
        state: SignalingState,
    },
    #[error("candidate already applied")]
    DuplicateCandidate,
    #[error("candidate arrived before any remote description")]
    NoRemoteDescription,
    #[error("description rejected: {0}")]
    Rejected(String),
    #[error("peer connection closed")]
    Closed,
    #[error("peer connection error: {0}")]
    Platform(String),
}

#[async_trait]
pub trait PeerConnectionHandle: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, HandleError>;
    async fn create_answer(&self) -> Result<SessionDescription, HandleError>;
    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), HandleError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), HandleError>;
    /// Discard an outstanding local offer and return to stable.
    async fn rollback(&self) -> Result<(), HandleError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), HandleError>;
    async fn add_tracks(&self, tracks: &TrackSet) -> Result<(), HandleError>;
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn remote_description(&self) -> Option<SessionDescription>;
    fn connection_state(&self) -> ConnectionState;
    fn signaling_state(&self) -> SignalingState;
    /// Yields the event receiver the first time it is called.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<HandleEvent>>;
    async fn close(&self) -> Result<(), HandleError>;
}

/// Builds one fresh handle per session.
#[async_trait]
pub trait HandleFactory: Send + Sync {
    async fn create(
        &self,
        remote: &PeerId,
        config: &EngineConfig,
    ) -> Result<Arc<dyn PeerConnectionHandle>, HandleError>;
}
