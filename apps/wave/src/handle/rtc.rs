//! [`PeerConnectionHandle`] over a webrtc-rs `RTCPeerConnection`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use wave_proto::{IceCandidate, PeerId, SdpType, SessionDescription};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{
    ConnectionState, HandleError, HandleEvent, HandleFactory, PeerConnectionHandle, SignalingState,
};
use crate::config::EngineConfig;
use crate::media::{MediaKind, MediaTrack, TrackSet};

fn platform(err: webrtc::Error) -> HandleError {
    match err {
        webrtc::Error::ErrConnectionClosed => HandleError::Closed,
        other => HandleError::Platform(other.to_string()),
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, HandleError> {
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp)
            .map_err(|err| HandleError::Rejected(err.to_string())),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp)
            .map_err(|err| HandleError::Rejected(err.to_string())),
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            Ok(rollback)
        }
    }
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, HandleError> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer | RTCSdpType::Pranswer => SdpType::Answer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(HandleError::Rejected("unspecified sdp type".into()));
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
            SignalingState::HaveLocalOffer
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
            SignalingState::HaveRemoteOffer
        }
        RTCSignalingState::Closed => SignalingState::Closed,
        RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
    }
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

pub struct RtcHandle {
    pc: Arc<RTCPeerConnection>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<HandleEvent>>>,
    local_tracks: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
}

impl RtcHandle {
    pub async fn new(api: &API, config: &EngineConfig) -> Result<Arc<Self>, HandleError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(platform)?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(HandleEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "negotiation", error = %err, "unserializable local candidate");
                    }
                }
            })
        }));

        let tx = events_tx.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(HandleEvent::NegotiationNeeded);
            })
        }));

        let tx = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(HandleEvent::ConnectionState(connection_state(state)));
            })
        }));

        let tx = events_tx;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    RTPCodecType::Video => MediaKind::Video,
                    RTPCodecType::Unspecified => return,
                };
                let _ = tx.send(HandleEvent::RemoteTrack(MediaTrack::new(
                    track.id(),
                    kind,
                    track.stream_id(),
                )));
            })
        }));

        Ok(Arc::new(Self {
            pc,
            events_rx: Mutex::new(Some(events_rx)),
            local_tracks: Mutex::new(HashMap::new()),
        }))
    }
}

#[async_trait]
impl PeerConnectionHandle for RtcHandle {
    async fn create_offer(&self) -> Result<SessionDescription, HandleError> {
        from_rtc(self.pc.create_offer(None).await.map_err(platform)?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, HandleError> {
        from_rtc(self.pc.create_answer(None).await.map_err(platform)?)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), HandleError> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(platform)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), HandleError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(platform)
    }

    async fn rollback(&self) -> Result<(), HandleError> {
        self.set_local_description(SessionDescription::rollback())
            .await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), HandleError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(platform)
    }

    async fn add_tracks(&self, tracks: &TrackSet) -> Result<(), HandleError> {
        for track in tracks.iter() {
            if self.local_tracks.lock().contains_key(&track.id) {
                continue;
            }
            let local = Arc::new(TrackLocalStaticSample::new(
                codec_for(track.kind),
                track.id.clone(),
                track.stream_id.clone(),
            ));
            let sender = self
                .pc
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(platform)?;
            self.local_tracks.lock().insert(track.id.clone(), local);

            // RTCP must be drained for interceptors to make progress.
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
            });
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .and_then(|description| from_rtc(description).ok())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.pc
            .remote_description()
            .await
            .and_then(|description| from_rtc(description).ok())
    }

    fn connection_state(&self) -> ConnectionState {
        connection_state(self.pc.connection_state())
    }

    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.pc.signaling_state())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<HandleEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) -> Result<(), HandleError> {
        self.pc.close().await.map_err(platform)
    }
}

/// One webrtc-rs API instance (codecs + interceptors) shared by every handle.
pub struct RtcHandleFactory {
    api: API,
}

impl RtcHandleFactory {
    pub fn new() -> Result<Self, HandleError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(platform)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(platform)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl HandleFactory for RtcHandleFactory {
    async fn create(
        &self,
        remote: &PeerId,
        config: &EngineConfig,
    ) -> Result<Arc<dyn PeerConnectionHandle>, HandleError> {
        tracing::debug!(
            target = "negotiation",
            remote = %remote,
            ice_servers = config.ice_servers.len(),
            "creating peer connection"
        );
        let handle = RtcHandle::new(&self.api, config).await?;
        Ok(handle)
    }
}
