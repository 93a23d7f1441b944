use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use wave_proto::PeerId;

use super::driver::{DriverContext, SessionHandle};
use crate::media::TrackSet;
use crate::negotiation::{CloseReason, Politeness, SessionInput, SessionParams, SessionSnapshot};

/// Live sessions keyed by remote peer. At most one per peer.
pub(crate) struct RoomCoordinator {
    ctx: Arc<DriverContext>,
    sessions: HashMap<PeerId, SessionHandle>,
    local_tracks: TrackSet,
}

impl RoomCoordinator {
    pub(crate) fn new(ctx: Arc<DriverContext>) -> Self {
        Self {
            ctx,
            sessions: HashMap::new(),
            local_tracks: TrackSet::new(),
        }
    }

    pub(crate) fn peer_joined(&mut self, peer: PeerId, pairing_id: String, politeness: Politeness) {
        if let Some(previous) = self.sessions.remove(&peer) {
            tracing::info!(
                target = "negotiation",
                remote = %peer,
                old = %previous.pairing_id(),
                new = %pairing_id,
                "replacing session for re-paired peer"
            );
            previous.close(CloseReason::Replaced);
        }
        let params = SessionParams {
            remote_peer: peer.clone(),
            pairing_id,
            politeness,
            capture_on_start: self.ctx.config.capture_on_start,
            capture_on_answer: self.ctx.config.capture_on_answer,
            initial_tracks: self.local_tracks.clone(),
        };
        let handle = SessionHandle::spawn(self.ctx.clone(), params);
        self.sessions.insert(peer, handle);
    }

    pub(crate) fn peer_left(&mut self, peer: &PeerId) {
        match self.sessions.get(peer) {
            Some(session) => session.close(CloseReason::PeerLeft),
            None => tracing::debug!(target = "negotiation", remote = %peer, "peer-left for unknown peer"),
        }
    }

    pub(crate) fn dispatch(&mut self, peer: &PeerId, input: SessionInput) {
        let delivered = self
            .sessions
            .get(peer)
            .map(|session| session.send(input))
            .unwrap_or(false);
        if !delivered {
            tracing::debug!(
                target = "negotiation",
                remote = %peer,
                "no live session; dropping message"
            );
        }
    }

    /// Remember tracks for future sessions and hand them to current ones.
    pub(crate) fn add_local_tracks(&mut self, tracks: TrackSet) {
        let added = self.local_tracks.merge(&tracks);
        if added.is_empty() {
            return;
        }
        for session in self.sessions.values() {
            session.send(SessionInput::AddLocalTracks(added.clone()));
        }
    }

    /// Forget a finished session unless a newer pairing already took its place.
    pub(crate) fn reap(&mut self, peer: &PeerId, pairing_id: &str) {
        let matches = self
            .sessions
            .get(peer)
            .is_some_and(|session| session.pairing_id() == pairing_id);
        if matches {
            self.sessions.remove(peer);
            tracing::debug!(target = "negotiation", remote = %peer, "session reaped");
        }
    }

    pub(crate) fn watch(&self, peer: &PeerId) -> Option<watch::Receiver<SessionSnapshot>> {
        self.sessions.get(peer).map(SessionHandle::watch)
    }

    pub(crate) fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<_> = self.sessions.values().map(SessionHandle::snapshot).collect();
        snapshots.sort_by(|a, b| a.remote_peer.cmp(&b.remote_peer));
        snapshots
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.values().filter(|s| !s.is_finished()).count()
    }

    pub(crate) async fn close_all(&mut self, reason: CloseReason) {
        let sessions: Vec<_> = self.sessions.drain().map(|(_, session)| session).collect();
        for session in &sessions {
            session.close(reason);
        }
        for session in sessions {
            session.join().await;
        }
    }
}
