//! Signaling vocabulary shared by wave clients and the relay.
//!
//! Every frame on the wire is a [`SignalingMessage`]: a kebab-case `type`,
//! the sender and (optional) target peer ids, and a JSON payload whose
//! shape depends on the type. Payload structs live next to the envelope so
//! both ends decode them the same way.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Sender id used by the relay for membership and error messages.
pub const RELAY_SENDER_ID: &str = "relay";

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid signaling json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{kind} payload does not match its message type: {source}")]
    Payload {
        kind: MessageType,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn relay() -> Self {
        Self(RELAY_SENDER_ID.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_relay(&self) -> bool {
        self.0 == RELAY_SENDER_ID
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Join,
    PeerJoined,
    PeerLeft,
    Offer,
    Answer,
    RenegotiateOffer,
    RenegotiateAnswer,
    IceCandidate,
    Error,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Join => "join",
            MessageType::PeerJoined => "peer-joined",
            MessageType::PeerLeft => "peer-left",
            MessageType::Offer => "offer",
            MessageType::Answer => "answer",
            MessageType::RenegotiateOffer => "renegotiate-offer",
            MessageType::RenegotiateAnswer => "renegotiate-answer",
            MessageType::IceCandidate => "ice-candidate",
            MessageType::Error => "error",
        }
    }

    /// Messages the relay forwards between peers instead of interpreting.
    pub fn is_peer_to_peer(self) -> bool {
        matches!(
            self,
            MessageType::Offer
                | MessageType::Answer
                | MessageType::RenegotiateOffer
                | MessageType::RenegotiateAnswer
                | MessageType::IceCandidate
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub sender_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<PeerId>,
    #[serde(default)]
    pub payload: Value,
}

impl SignalingMessage {
    pub fn new<P: Serialize>(
        kind: MessageType,
        sender_id: PeerId,
        target_id: Option<PeerId>,
        payload: &P,
    ) -> Result<Self, ProtoError> {
        Ok(Self {
            kind,
            sender_id,
            target_id,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn decode_payload<P: DeserializeOwned>(&self) -> Result<P, ProtoError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| ProtoError::Payload {
            kind: self.kind,
            source,
        })
    }

    pub fn to_text(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Rollback,
}

/// An opaque negotiated blob. Produced once, applied once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn rollback() -> Self {
        Self {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, sdp_mid: impl Into<String>, sdp_mline_index: u16) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self.sdp_mline_index = Some(sdp_mline_index);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub room: String,
}

/// Sent by the relay to each member of a freshly formed pairing.
///
/// `your_seq` and `peer_seq` are the relay's join sequence numbers for the
/// recipient and the named peer. The lower number joined first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerJoinedPayload {
    pub room: String,
    pub peer_id: PeerId,
    pub pairing_id: String,
    pub your_seq: u64,
    pub peer_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLeftPayload {
    pub room: String,
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionPayload {
    pub pairing_id: String,
    pub description: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub pairing_id: String,
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub reason: String,
}

pub fn generate_pairing_id() -> String {
    Uuid::new_v4().to_string()
}
