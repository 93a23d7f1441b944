//! Deterministic in-memory peer connection.
//!
//! Descriptions are plain text: one `m=<kind>` line per media section, then
//! the local tracks as `a=wave-track:<kind> <stream> <id>` lines, so applying
//! a remote description is enough to "receive" the other side's tracks. An
//! offer opens a section for every track on either side; an answer keeps the
//! offered sections and carries only the tracks that fit them. A track left
//! out asks for negotiation again once the handle is stable. The handle
//! enforces the offer/answer signaling transitions, rejects candidates that
//! arrive before a remote description or twice, and reports itself connected
//! the first time it is stable with both descriptions applied.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use wave_proto::{IceCandidate, PeerId, SdpType, SessionDescription};

use super::{
    ConnectionState, HandleError, HandleEvent, HandleFactory, PeerConnectionHandle, SignalingState,
};
use crate::config::EngineConfig;
use crate::media::{MediaKind, MediaTrack, TrackSet};

const TRACK_ATTRIBUTE: &str = "a=wave-track:";
const MEDIA_LINE: &str = "m=";
const KINDS: [MediaKind; 2] = [MediaKind::Audio, MediaKind::Video];
const HOST_CANDIDATES: u16 = 2;

static NEXT_PORT: AtomicU64 = AtomicU64::new(50_000);

/// Operations that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    CreateOffer,
    CreateAnswer,
    SetLocal,
    SetRemote,
    AddCandidate,
    AddTracks,
}

struct MockState {
    signaling: SignalingState,
    connection: ConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    stable_local: Option<SessionDescription>,
    stable_remote: Option<SessionDescription>,
    tracks: TrackSet,
    negotiation_announced: bool,
    candidates_emitted: bool,
    applied_candidates: HashSet<IceCandidate>,
    remote_tracks: TrackSet,
    version: u64,
}

impl MockState {
    fn new() -> Self {
        Self {
            signaling: SignalingState::Stable,
            connection: ConnectionState::New,
            local: None,
            remote: None,
            stable_local: None,
            stable_remote: None,
            tracks: TrackSet::new(),
            negotiation_announced: false,
            candidates_emitted: false,
            applied_candidates: HashSet::new(),
            remote_tracks: TrackSet::new(),
            version: 0,
        }
    }

    fn ensure_open(&self) -> Result<(), HandleError> {
        if self.signaling == SignalingState::Closed {
            Err(HandleError::Closed)
        } else {
            Ok(())
        }
    }

    fn uncovered_tracks(&self) -> bool {
        let sdp = self.local.as_ref().map(|d| d.sdp.as_str()).unwrap_or("");
        let covered = parse_tracks(sdp);
        self.tracks
            .iter()
            .any(|track| !covered.iter().any(|sent| sent.id == track.id))
    }

    /// Media sections per kind: an offer covers both sides' tracks, an
    /// answer mirrors the offer it replies to.
    fn sections(&self, sdp_type: SdpType) -> [usize; 2] {
        KINDS.map(|kind| match sdp_type {
            SdpType::Answer => self
                .remote
                .as_ref()
                .map_or(0, |offer| count_sections(&offer.sdp, kind)),
            _ => count_kind(&self.tracks, kind).max(count_kind(&self.remote_tracks, kind)),
        })
    }
}

pub struct MockHandle {
    label: String,
    state: Mutex<MockState>,
    failures: Mutex<HashMap<MockOp, HandleError>>,
    events_tx: mpsc::UnboundedSender<HandleEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<HandleEvent>>>,
    offer_gate: Arc<watch::Sender<bool>>,
    offers_created: AtomicU64,
}

impl MockHandle {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Self::with_gate(label, Arc::new(watch::Sender::new(false)))
    }

    fn with_gate(label: impl Into<String>, offer_gate: Arc<watch::Sender<bool>>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.into(),
            state: Mutex::new(MockState::new()),
            failures: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            offer_gate,
            offers_created: AtomicU64::new(0),
        })
    }

    /// Park every `create_offer` until [`MockHandle::release_offers`].
    pub fn hold_offers(&self) {
        self.offer_gate.send_replace(true);
    }

    pub fn release_offers(&self) {
        self.offer_gate.send_replace(false);
    }

    pub fn fail_next(&self, op: MockOp, error: HandleError) {
        self.failures.lock().insert(op, error);
    }

    /// Drive the connection into `failed` as a network loss would.
    pub fn fail_connection(&self) {
        self.set_connection(ConnectionState::Failed);
    }

    pub fn offers_created(&self) -> u64 {
        self.offers_created.load(Ordering::SeqCst)
    }

    pub fn local_tracks(&self) -> TrackSet {
        self.state.lock().tracks.clone()
    }

    pub fn applied_candidates(&self) -> usize {
        self.state.lock().applied_candidates.len()
    }

    fn injected(&self, op: MockOp) -> Result<(), HandleError> {
        match self.failures.lock().remove(&op) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn emit(&self, event: HandleEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_connection(&self, connection: ConnectionState) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.connection != connection;
            state.connection = connection;
            changed
        };
        if changed {
            self.emit(HandleEvent::ConnectionState(connection));
        }
    }

    fn render(&self, state: &mut MockState, sdp_type: SdpType) -> SessionDescription {
        state.version += 1;
        let mut sdp = format!(
            "v=0\r\no=wave {} {} IN IP4 127.0.0.1\r\ns={}\r\n",
            state.version, state.version, self.label
        );
        let sections = state.sections(sdp_type);
        for (kind, count) in KINDS.iter().zip(sections) {
            for _ in 0..count {
                sdp.push_str(&format!("{MEDIA_LINE}{kind}\r\n"));
            }
        }
        let mut free = sections;
        for track in state.tracks.iter() {
            let slot = &mut free[kind_index(track.kind)];
            if *slot == 0 {
                continue;
            }
            *slot -= 1;
            sdp.push_str(&format!(
                "{TRACK_ATTRIBUTE}{} {} {}\r\n",
                track.kind, track.stream_id, track.id
            ));
        }
        SessionDescription { sdp_type, sdp }
    }

    /// Post-transition bookkeeping shared by both description setters.
    fn after_transition(&self, reached_stable: bool) {
        let mut events = Vec::new();
        let mut connect = false;
        {
            let mut state = self.state.lock();
            if reached_stable {
                if state.local.is_some()
                    && state.remote.is_some()
                    && state.connection == ConnectionState::New
                {
                    connect = true;
                }
                if state.uncovered_tracks() && !state.negotiation_announced {
                    state.negotiation_announced = true;
                    events.push(HandleEvent::NegotiationNeeded);
                }
            }
        }
        if connect {
            self.set_connection(ConnectionState::Connecting);
            self.set_connection(ConnectionState::Connected);
        }
        for event in events {
            self.emit(event);
        }
    }

    fn emit_host_candidates(&self) {
        let first = {
            let mut state = self.state.lock();
            let first = !state.candidates_emitted;
            state.candidates_emitted = true;
            first
        };
        if !first {
            return;
        }
        for index in 0..HOST_CANDIDATES {
            let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
            let candidate = IceCandidate::new(format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {port} typ host",
                index + 1
            ))
            .with_mid("0", 0);
            self.emit(HandleEvent::LocalCandidate(candidate));
        }
    }
}

fn kind_index(kind: MediaKind) -> usize {
    match kind {
        MediaKind::Audio => 0,
        MediaKind::Video => 1,
    }
}

fn count_kind(tracks: &TrackSet, kind: MediaKind) -> usize {
    tracks.iter().filter(|track| track.kind == kind).count()
}

fn count_sections(sdp: &str, kind: MediaKind) -> usize {
    sdp.lines()
        .filter_map(|line| line.strip_prefix(MEDIA_LINE))
        .filter(|rest| MediaKind::parse(rest.trim()) == Some(kind))
        .count()
}

fn parse_tracks(sdp: &str) -> Vec<MediaTrack> {
    sdp.lines()
        .filter_map(|line| line.strip_prefix(TRACK_ATTRIBUTE))
        .filter_map(|rest| {
            let mut parts = rest.split_whitespace();
            let kind = MediaKind::parse(parts.next()?)?;
            let stream = parts.next()?;
            let id = parts.next()?;
            Some(MediaTrack::new(id, kind, stream))
        })
        .collect()
}

#[async_trait]
impl PeerConnectionHandle for MockHandle {
    async fn create_offer(&self) -> Result<SessionDescription, HandleError> {
        let mut gate = self.offer_gate.subscribe();
        gate.wait_for(|held| !*held)
            .await
            .map_err(|_| HandleError::Closed)?;
        self.injected(MockOp::CreateOffer)?;

        let mut state = self.state.lock();
        state.ensure_open()?;
        if state.signaling == SignalingState::HaveRemoteOffer {
            return Err(HandleError::InvalidState {
                operation: "create_offer",
                state: state.signaling,
            });
        }
        state.negotiation_announced = false;
        self.offers_created.fetch_add(1, Ordering::SeqCst);
        Ok(self.render(&mut state, SdpType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, HandleError> {
        self.injected(MockOp::CreateAnswer)?;
        let mut state = self.state.lock();
        state.ensure_open()?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(HandleError::InvalidState {
                operation: "create_answer",
                state: state.signaling,
            });
        }
        state.negotiation_announced = false;
        Ok(self.render(&mut state, SdpType::Answer))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), HandleError> {
        if description.sdp_type == SdpType::Rollback {
            return self.rollback().await;
        }
        self.injected(MockOp::SetLocal)?;
        let reached_stable = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            match (description.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable) => {
                    state.stable_local = state.local.clone();
                    state.signaling = SignalingState::HaveLocalOffer;
                    state.local = Some(description);
                    false
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::Stable;
                    state.local = Some(description);
                    true
                }
                (_, current) => {
                    return Err(HandleError::InvalidState {
                        operation: "set_local_description",
                        state: current,
                    });
                }
            }
        };
        self.emit_host_candidates();
        self.after_transition(reached_stable);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), HandleError> {
        self.injected(MockOp::SetRemote)?;
        let (reached_stable, new_tracks) = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            let reached_stable = match (description.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable) => {
                    state.stable_remote = state.remote.clone();
                    state.signaling = SignalingState::HaveRemoteOffer;
                    false
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                    true
                }
                (_, current) => {
                    return Err(HandleError::InvalidState {
                        operation: "set_remote_description",
                        state: current,
                    });
                }
            };
            let mut new_tracks = Vec::new();
            for track in parse_tracks(&description.sdp) {
                if state.remote_tracks.insert(track.clone()) {
                    new_tracks.push(track);
                }
            }
            state.remote = Some(description);
            (reached_stable, new_tracks)
        };
        for track in new_tracks {
            self.emit(HandleEvent::RemoteTrack(track));
        }
        self.after_transition(reached_stable);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), HandleError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        match state.signaling {
            SignalingState::HaveLocalOffer => state.local = state.stable_local.take(),
            SignalingState::HaveRemoteOffer => state.remote = state.stable_remote.take(),
            current => {
                return Err(HandleError::InvalidState {
                    operation: "rollback",
                    state: current,
                });
            }
        }
        state.signaling = SignalingState::Stable;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), HandleError> {
        self.injected(MockOp::AddCandidate)?;
        let mut state = self.state.lock();
        state.ensure_open()?;
        if state.remote.is_none() {
            return Err(HandleError::NoRemoteDescription);
        }
        if !state.applied_candidates.insert(candidate) {
            return Err(HandleError::DuplicateCandidate);
        }
        Ok(())
    }

    async fn add_tracks(&self, tracks: &TrackSet) -> Result<(), HandleError> {
        self.injected(MockOp::AddTracks)?;
        let announce = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            state.tracks.merge(tracks);
            let announce = state.signaling == SignalingState::Stable
                && state.uncovered_tracks()
                && !state.negotiation_announced;
            if announce {
                state.negotiation_announced = true;
            }
            announce
        };
        if announce {
            self.emit(HandleEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<HandleEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) -> Result<(), HandleError> {
        self.state.lock().signaling = SignalingState::Closed;
        self.set_connection(ConnectionState::Closed);
        Ok(())
    }
}

/// Hands out [`MockHandle`]s and remembers them for inspection.
pub struct MockHandleFactory {
    gate: Arc<watch::Sender<bool>>,
    handles: Mutex<Vec<(PeerId, Arc<MockHandle>)>>,
}

impl MockHandleFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Arc::new(watch::Sender::new(false)),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Applies to handles created before and after the call.
    pub fn hold_offers(&self) {
        self.gate.send_replace(true);
    }

    pub fn release_offers(&self) {
        self.gate.send_replace(false);
    }

    /// Most recent handle created for `remote`.
    pub fn handle_for(&self, remote: &PeerId) -> Option<Arc<MockHandle>> {
        self.handles
            .lock()
            .iter()
            .rev()
            .find(|(peer, _)| peer == remote)
            .map(|(_, handle)| handle.clone())
    }

    pub fn created(&self) -> usize {
        self.handles.lock().len()
    }
}

#[async_trait]
impl HandleFactory for MockHandleFactory {
    async fn create(
        &self,
        remote: &PeerId,
        _config: &EngineConfig,
    ) -> Result<Arc<dyn PeerConnectionHandle>, HandleError> {
        let handle = MockHandle::with_gate(format!("to-{remote}"), self.gate.clone());
        self.handles.lock().push((remote.clone(), handle.clone()));
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<HandleEvent>) -> Vec<HandleEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn offer_answer_round_connects_both_sides() {
        let a = MockHandle::new("a");
        let b = MockHandle::new("b");
        let mut a_events = a.take_events().unwrap();
        let mut b_events = b.take_events().unwrap();

        a.add_tracks(&TrackSet::from(vec![MediaTrack::new("mic", MediaKind::Audio, "s")]))
            .await
            .unwrap();
        assert_eq!(drain(&mut a_events), vec![HandleEvent::NegotiationNeeded]);

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.signaling_state(), SignalingState::Stable);
        assert_eq!(a.connection_state(), ConnectionState::Connected);
        assert_eq!(b.connection_state(), ConnectionState::Connected);

        let b_seen = drain(&mut b_events);
        assert!(b_seen.contains(&HandleEvent::RemoteTrack(MediaTrack::new(
            "mic",
            MediaKind::Audio,
            "s"
        ))));
        let a_seen = drain(&mut a_events);
        let candidates = a_seen
            .iter()
            .filter(|event| matches!(event, HandleEvent::LocalCandidate(_)))
            .count();
        assert_eq!(candidates, usize::from(HOST_CANDIDATES));
        assert!(!a_seen.contains(&HandleEvent::NegotiationNeeded));
    }

    #[tokio::test]
    async fn candidates_need_a_remote_description_and_apply_once() {
        let handle = MockHandle::new("a");
        let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host");
        assert_eq!(
            handle.add_ice_candidate(candidate.clone()).await,
            Err(HandleError::NoRemoteDescription)
        );

        handle
            .set_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        handle.add_ice_candidate(candidate.clone()).await.unwrap();
        assert_eq!(
            handle.add_ice_candidate(candidate).await,
            Err(HandleError::DuplicateCandidate)
        );
    }

    #[tokio::test]
    async fn rollback_restores_stable_without_announcing() {
        let handle = MockHandle::new("a");
        let mut events = handle.take_events().unwrap();
        handle
            .add_tracks(&TrackSet::from(vec![MediaTrack::new("cam", MediaKind::Video, "s")]))
            .await
            .unwrap();
        let offer = handle.create_offer().await.unwrap();
        handle.set_local_description(offer).await.unwrap();
        handle.rollback().await.unwrap();
        assert_eq!(handle.signaling_state(), SignalingState::Stable);
        assert_eq!(handle.local_description().await, None);

        let announced = drain(&mut events)
            .into_iter()
            .filter(|event| *event == HandleEvent::NegotiationNeeded)
            .count();
        assert_eq!(announced, 1);
        assert!(matches!(
            handle.rollback().await,
            Err(HandleError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn answer_carries_only_tracks_that_fit_the_offer() {
        let offerer = MockHandle::new("a");
        let answerer = MockHandle::new("b");
        let mut events = answerer.take_events().unwrap();
        offerer
            .add_tracks(&TrackSet::from(vec![MediaTrack::new("mic", MediaKind::Audio, "a")]))
            .await
            .unwrap();
        answerer
            .add_tracks(&TrackSet::from(vec![MediaTrack::new("cam", MediaKind::Video, "b")]))
            .await
            .unwrap();
        drain(&mut events);

        let offer = offerer.create_offer().await.unwrap();
        assert_eq!(count_sections(&offer.sdp, MediaKind::Audio), 1);
        assert_eq!(count_sections(&offer.sdp, MediaKind::Video), 0);
        offerer.set_local_description(offer.clone()).await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        assert!(parse_tracks(&answer.sdp).is_empty());
        assert_eq!(count_sections(&answer.sdp, MediaKind::Audio), 1);
        answerer.set_local_description(answer.clone()).await.unwrap();
        assert!(drain(&mut events).contains(&HandleEvent::NegotiationNeeded));

        // The follow-up offer opens a video section and keeps the audio one.
        offerer.set_remote_description(answer).await.unwrap();
        let again = answerer.create_offer().await.unwrap();
        assert_eq!(count_sections(&again.sdp, MediaKind::Audio), 1);
        assert_eq!(count_sections(&again.sdp, MediaKind::Video), 1);
        assert_eq!(
            parse_tracks(&again.sdp),
            vec![MediaTrack::new("cam", MediaKind::Video, "b")]
        );
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let handle = MockHandle::new("a");
        handle.fail_next(MockOp::CreateOffer, HandleError::Platform("boom".into()));
        assert!(handle.create_offer().await.is_err());
        assert!(handle.create_offer().await.is_ok());
    }

    #[tokio::test]
    async fn held_offers_wait_for_release() {
        let handle = MockHandle::new("a");
        handle.hold_offers();
        let pending = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.create_offer().await })
        };
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());
        handle.release_offers();
        assert!(pending.await.unwrap().is_ok());
    }
}
