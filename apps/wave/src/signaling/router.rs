//! Wire format on one side, session inputs on the other.
//!
//! The router keeps no state beyond the local peer id. Inbound messages are
//! decoded into [`Routed`] values; outbound [`OutboundSignal`]s are wrapped
//! into [`SignalingMessage`]s addressed to the session's remote peer.

use thiserror::Error;
use wave_proto::{
    CandidatePayload, DescriptionPayload, ErrorPayload, JoinPayload, MessageType, PeerId,
    PeerJoinedPayload, PeerLeftPayload, ProtoError, SdpType, SignalingMessage,
};

use crate::negotiation::{OutboundSignal, SessionInput, SignalBody};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error("message for {0} delivered to the wrong peer")]
    Misdirected(PeerId),
    #[error("{0} messages are not expected from the relay")]
    Unexpected(MessageType),
    #[error("{kind} carries a {found:?} description")]
    DescriptionMismatch { kind: MessageType, found: SdpType },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    PeerJoined {
        peer: PeerId,
        room: String,
        pairing_id: String,
        your_seq: u64,
        peer_seq: u64,
    },
    PeerLeft {
        room: String,
        peer: PeerId,
    },
    Session {
        peer: PeerId,
        input: SessionInput,
    },
    Rejected {
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct SignalingRouter {
    local_id: PeerId,
}

impl SignalingRouter {
    pub fn new(local_id: PeerId) -> Self {
        Self { local_id }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn route(&self, message: SignalingMessage) -> Result<Routed, RouteError> {
        if let Some(target) = &message.target_id {
            if target != &self.local_id {
                return Err(RouteError::Misdirected(target.clone()));
            }
        }
        match message.kind {
            MessageType::PeerJoined => {
                let payload: PeerJoinedPayload = message.decode_payload()?;
                Ok(Routed::PeerJoined {
                    peer: payload.peer_id,
                    room: payload.room,
                    pairing_id: payload.pairing_id,
                    your_seq: payload.your_seq,
                    peer_seq: payload.peer_seq,
                })
            }
            MessageType::PeerLeft => {
                let payload: PeerLeftPayload = message.decode_payload()?;
                Ok(Routed::PeerLeft {
                    room: payload.room,
                    peer: payload.peer_id,
                })
            }
            kind @ (MessageType::Offer
            | MessageType::RenegotiateOffer
            | MessageType::Answer
            | MessageType::RenegotiateAnswer) => {
                let payload: DescriptionPayload = message.decode_payload()?;
                // An answer slot may carry a rollback: the peer refused our offer.
                let accepted = match (kind, payload.description.sdp_type) {
                    (MessageType::Offer | MessageType::RenegotiateOffer, found) => {
                        found == SdpType::Offer
                    }
                    (_, found) => matches!(found, SdpType::Answer | SdpType::Rollback),
                };
                if !accepted {
                    return Err(RouteError::DescriptionMismatch {
                        kind,
                        found: payload.description.sdp_type,
                    });
                }
                Ok(Routed::Session {
                    peer: message.sender_id,
                    input: SessionInput::RemoteDescription {
                        pairing_id: payload.pairing_id,
                        description: payload.description,
                        renegotiation: matches!(
                            kind,
                            MessageType::RenegotiateOffer | MessageType::RenegotiateAnswer
                        ),
                    },
                })
            }
            MessageType::IceCandidate => {
                let payload: CandidatePayload = message.decode_payload()?;
                Ok(Routed::Session {
                    peer: message.sender_id,
                    input: SessionInput::RemoteCandidate {
                        pairing_id: payload.pairing_id,
                        candidate: payload.candidate,
                    },
                })
            }
            MessageType::Error => {
                let payload: ErrorPayload = message.decode_payload()?;
                Ok(Routed::Rejected {
                    reason: payload.reason,
                })
            }
            MessageType::Join => Err(RouteError::Unexpected(MessageType::Join)),
        }
    }

    pub fn wrap(&self, signal: OutboundSignal) -> Result<SignalingMessage, RouteError> {
        let OutboundSignal {
            target,
            pairing_id,
            body,
        } = signal;
        let message = match body {
            SignalBody::Offer {
                description,
                renegotiation,
            } => {
                let kind = if renegotiation {
                    MessageType::RenegotiateOffer
                } else {
                    MessageType::Offer
                };
                self.addressed(kind, target, &DescriptionPayload {
                    pairing_id,
                    description,
                })?
            }
            SignalBody::Answer {
                description,
                renegotiation,
            } => {
                let kind = if renegotiation {
                    MessageType::RenegotiateAnswer
                } else {
                    MessageType::Answer
                };
                self.addressed(kind, target, &DescriptionPayload {
                    pairing_id,
                    description,
                })?
            }
            SignalBody::Candidate(candidate) => self.addressed(
                MessageType::IceCandidate,
                target,
                &CandidatePayload {
                    pairing_id,
                    candidate,
                },
            )?,
        };
        Ok(message)
    }

    pub fn join(&self, room: &str) -> Result<SignalingMessage, RouteError> {
        Ok(SignalingMessage::new(
            MessageType::Join,
            self.local_id.clone(),
            None,
            &JoinPayload {
                room: room.to_string(),
            },
        )?)
    }

    fn addressed<P: serde::Serialize>(
        &self,
        kind: MessageType,
        target: PeerId,
        payload: &P,
    ) -> Result<SignalingMessage, RouteError> {
        Ok(SignalingMessage::new(
            kind,
            self.local_id.clone(),
            Some(target),
            payload,
        )?)
    }
}
