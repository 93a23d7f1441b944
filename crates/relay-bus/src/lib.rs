use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use wave_proto::{
    ErrorPayload, JoinPayload, MessageType, PeerId, PeerJoinedPayload, PeerLeftPayload,
    ProtoError, SignalingMessage, generate_pairing_id,
};

/// Rooms pair exactly two participants.
pub const DEFAULT_ROOM_CAPACITY: usize = 2;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("room {0} is full")]
    RoomFull(String),
    #[error("peer id {0} is reserved for the relay")]
    ReservedId(PeerId),
    #[error("peer {0} has not joined a room")]
    UnknownPeer(PeerId),
    #[error("peer {target} is not in the same room as {sender}")]
    NotInRoom { sender: PeerId, target: PeerId },
    #[error("{0} messages must name a target peer")]
    MissingTarget(MessageType),
    #[error("{0} messages cannot be sent by peers")]
    Unroutable(MessageType),
    #[error("relay channel closed")]
    Closed,
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Outbound half of one participant's connection to the relay.
pub trait PeerSink: Send + Sync {
    fn deliver(&self, message: SignalingMessage) -> RelayResult<()>;
}

impl PeerSink for mpsc::UnboundedSender<SignalingMessage> {
    fn deliver(&self, message: SignalingMessage) -> RelayResult<()> {
        self.send(message).map_err(|_| RelayError::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub room: String,
    pub seq: u64,
    pub paired_with: Vec<PeerId>,
}

struct Member {
    peer: PeerId,
    seq: u64,
    sink: Arc<dyn PeerSink>,
}

#[derive(Default)]
struct Registry {
    rooms: HashMap<String, Vec<Member>>,
    membership: HashMap<PeerId, String>,
    next_seq: u64,
}

impl Registry {
    fn remove(&mut self, peer: &PeerId) -> Option<(String, Vec<(PeerId, Arc<dyn PeerSink>)>)> {
        let room = self.membership.remove(peer)?;
        let mut remaining = Vec::new();
        let mut drop_room = false;
        if let Some(members) = self.rooms.get_mut(&room) {
            members.retain(|member| &member.peer != peer);
            remaining = members
                .iter()
                .map(|member| (member.peer.clone(), member.sink.clone()))
                .collect();
            drop_room = members.is_empty();
        }
        if drop_room {
            self.rooms.remove(&room);
        }
        Some((room, remaining))
    }
}

/// Room membership and peer-to-peer forwarding.
///
/// A join into a room with an existing member forms a pairing: both sides
/// receive `peer-joined` naming the other, with the relay's join sequence
/// numbers so they can agree on who joined first. Sinks are always invoked
/// outside the registry lock.
pub struct RoomRegistry {
    capacity: usize,
    inner: RwLock<Registry>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_ROOM_CAPACITY)
    }
}

impl RoomRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(Registry::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Apply one message submitted by a connected participant.
    pub fn handle(&self, message: SignalingMessage, sink: &Arc<dyn PeerSink>) -> RelayResult<()> {
        match message.kind {
            MessageType::Join => {
                let payload: JoinPayload = message.decode_payload()?;
                self.join(&message.sender_id, &payload.room, sink.clone())
                    .map(|_| ())
            }
            kind if kind.is_peer_to_peer() => self.forward(message),
            other => Err(RelayError::Unroutable(other)),
        }
    }

    pub fn join(
        &self,
        peer: &PeerId,
        room: &str,
        sink: Arc<dyn PeerSink>,
    ) -> RelayResult<JoinOutcome> {
        if peer.is_relay() {
            return Err(RelayError::ReservedId(peer.clone()));
        }
        let mut notices = Vec::new();
        let outcome = {
            let mut guard = self.inner.write();
            let registry = &mut *guard;

            // A refused join leaves any current membership untouched.
            let occupied = registry.rooms.get(room).map_or(0, |members| {
                members.iter().filter(|member| &member.peer != peer).count()
            });
            if occupied >= self.capacity {
                return Err(RelayError::RoomFull(room.to_string()));
            }

            if let Some((previous, remaining)) = registry.remove(peer) {
                for (member, member_sink) in remaining {
                    notices.push((member_sink, peer_left(&previous, peer, &member)?));
                }
            }

            registry.next_seq += 1;
            let seq = registry.next_seq;
            let members = registry.rooms.entry(room.to_string()).or_default();
            let mut paired_with = Vec::with_capacity(members.len());
            for member in members.iter() {
                let pairing_id = generate_pairing_id();
                notices.push((
                    member.sink.clone(),
                    peer_joined(room, peer, &member.peer, &pairing_id, member.seq, seq)?,
                ));
                notices.push((
                    sink.clone(),
                    peer_joined(room, &member.peer, peer, &pairing_id, seq, member.seq)?,
                ));
                paired_with.push(member.peer.clone());
            }
            members.push(Member {
                peer: peer.clone(),
                seq,
                sink,
            });
            registry.membership.insert(peer.clone(), room.to_string());

            JoinOutcome {
                room: room.to_string(),
                seq,
                paired_with,
            }
        };

        tracing::debug!(
            target = "relay",
            peer = %peer,
            room = %outcome.room,
            seq = outcome.seq,
            paired = outcome.paired_with.len(),
            "peer joined room"
        );
        deliver_all(notices);
        Ok(outcome)
    }

    /// Remove a participant, telling whoever remains in its room.
    pub fn leave(&self, peer: &PeerId) -> Option<String> {
        let (room, remaining) = self.inner.write().remove(peer)?;
        let mut notices = Vec::with_capacity(remaining.len());
        for (member, sink) in remaining {
            match peer_left(&room, peer, &member) {
                Ok(message) => notices.push((sink, message)),
                Err(err) => tracing::warn!(target = "relay", error = %err, "encode peer-left failed"),
            }
        }
        tracing::debug!(target = "relay", peer = %peer, room = %room, "peer left room");
        deliver_all(notices);
        Some(room)
    }

    pub fn forward(&self, message: SignalingMessage) -> RelayResult<()> {
        let target = message
            .target_id
            .clone()
            .ok_or(RelayError::MissingTarget(message.kind))?;
        let sink = {
            let guard = self.inner.read();
            let room = guard
                .membership
                .get(&message.sender_id)
                .ok_or_else(|| RelayError::UnknownPeer(message.sender_id.clone()))?;
            guard
                .rooms
                .get(room)
                .and_then(|members| members.iter().find(|member| member.peer == target))
                .map(|member| member.sink.clone())
                .ok_or_else(|| RelayError::NotInRoom {
                    sender: message.sender_id.clone(),
                    target: target.clone(),
                })?
        };
        tracing::trace!(
            target = "relay",
            kind = %message.kind,
            from = %message.sender_id,
            to = %target,
            "forwarding signal"
        );
        sink.deliver(message)
    }

    pub fn room_of(&self, peer: &PeerId) -> Option<String> {
        self.inner.read().membership.get(peer).cloned()
    }

    pub fn members(&self, room: &str) -> Vec<PeerId> {
        self.inner
            .read()
            .rooms
            .get(room)
            .map(|members| members.iter().map(|member| member.peer.clone()).collect())
            .unwrap_or_default()
    }
}

fn peer_joined(
    room: &str,
    joined: &PeerId,
    recipient: &PeerId,
    pairing_id: &str,
    your_seq: u64,
    peer_seq: u64,
) -> RelayResult<SignalingMessage> {
    Ok(SignalingMessage::new(
        MessageType::PeerJoined,
        PeerId::relay(),
        Some(recipient.clone()),
        &PeerJoinedPayload {
            room: room.to_string(),
            peer_id: joined.clone(),
            pairing_id: pairing_id.to_string(),
            your_seq,
            peer_seq,
        },
    )?)
}

fn peer_left(room: &str, left: &PeerId, recipient: &PeerId) -> RelayResult<SignalingMessage> {
    Ok(SignalingMessage::new(
        MessageType::PeerLeft,
        PeerId::relay(),
        Some(recipient.clone()),
        &PeerLeftPayload {
            room: room.to_string(),
            peer_id: left.clone(),
        },
    )?)
}

/// Build the `error` message a relay sends back when it rejects a request.
pub fn rejection(recipient: &PeerId, err: &RelayError) -> RelayResult<SignalingMessage> {
    Ok(SignalingMessage::new(
        MessageType::Error,
        PeerId::relay(),
        Some(recipient.clone()),
        &ErrorPayload {
            reason: err.to_string(),
        },
    )?)
}

fn deliver_all(notices: Vec<(Arc<dyn PeerSink>, SignalingMessage)>) {
    for (sink, message) in notices {
        let kind = message.kind;
        if let Err(err) = sink.deliver(message) {
            tracing::debug!(target = "relay", kind = %kind, error = %err, "dropping notice for closed peer");
        }
    }
}

#[derive(Default)]
struct Gate {
    paused: bool,
    held: VecDeque<SignalingMessage>,
}

/// In-memory relay for tests and single-process embedders.
///
/// Peer-to-peer traffic can be paused and released in order, which lets
/// callers line up messages that cross on the wire.
#[derive(Clone, Default)]
pub struct LocalRelay {
    registry: Arc<RoomRegistry>,
    gate: Arc<Mutex<Gate>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new(capacity)),
            gate: Arc::default(),
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn connect(&self, peer: PeerId) -> LocalConnection {
        let (tx, rx) = mpsc::unbounded_channel();
        LocalConnection {
            peer,
            relay: self.clone(),
            sink: Arc::new(tx),
            inbox: AsyncMutex::new(rx),
        }
    }

    /// Hold peer-to-peer messages until [`LocalRelay::resume`].
    pub fn pause(&self) {
        self.gate.lock().paused = true;
    }

    /// Forward every held message in submission order and stop holding.
    pub fn resume(&self) {
        let mut gate = self.gate.lock();
        gate.paused = false;
        while let Some(message) = gate.held.pop_front() {
            if let Err(err) = self.registry.forward(message) {
                tracing::debug!(target = "relay", error = %err, "held message undeliverable");
            }
        }
    }

    pub fn held(&self) -> usize {
        self.gate.lock().held.len()
    }

    fn submit(&self, message: SignalingMessage, sink: &Arc<dyn PeerSink>) -> RelayResult<()> {
        if message.kind.is_peer_to_peer() {
            let mut gate = self.gate.lock();
            if gate.paused {
                gate.held.push_back(message);
                return Ok(());
            }
            return self.registry.forward(message);
        }
        self.registry.handle(message, sink)
    }
}

/// One participant's connection to a [`LocalRelay`]. Dropping it leaves the room.
pub struct LocalConnection {
    peer: PeerId,
    relay: LocalRelay,
    sink: Arc<dyn PeerSink>,
    inbox: AsyncMutex<mpsc::UnboundedReceiver<SignalingMessage>>,
}

impl LocalConnection {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer
    }

    /// Submit a message. The sender id is always this connection's peer.
    pub fn send(&self, mut message: SignalingMessage) -> RelayResult<()> {
        message.sender_id = self.peer.clone();
        self.relay.submit(message, &self.sink)
    }

    pub async fn recv(&self) -> Option<SignalingMessage> {
        self.inbox.lock().await.recv().await
    }

    pub fn disconnect(&self) {
        self.relay.registry.leave(&self.peer);
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        self.relay.registry.leave(&self.peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wave_proto::{CandidatePayload, IceCandidate};

    fn join(room: &str, peer: &LocalConnection) -> RelayResult<()> {
        peer.send(SignalingMessage::new(
            MessageType::Join,
            peer.peer_id().clone(),
            None,
            &JoinPayload { room: room.into() },
        )?)
    }

    fn candidate(from: &LocalConnection, to: &str, text: &str) -> SignalingMessage {
        SignalingMessage::new(
            MessageType::IceCandidate,
            from.peer_id().clone(),
            Some(PeerId::from(to)),
            &CandidatePayload {
                pairing_id: "p".into(),
                candidate: IceCandidate::new(text),
            },
        )
        .expect("encode")
    }

    #[tokio::test]
    async fn second_joiner_forms_a_pairing() {
        let relay = LocalRelay::new();
        let a = relay.connect(PeerId::from("a"));
        let b = relay.connect(PeerId::from("b"));

        join("42", &a).expect("a joins");
        assert_eq!(relay.registry().members("42"), vec![PeerId::from("a")]);

        join("42", &b).expect("b joins");
        let to_a: PeerJoinedPayload = a.recv().await.expect("a notice").decode_payload().unwrap();
        let to_b: PeerJoinedPayload = b.recv().await.expect("b notice").decode_payload().unwrap();

        assert_eq!(to_a.peer_id, PeerId::from("b"));
        assert_eq!(to_b.peer_id, PeerId::from("a"));
        assert_eq!(to_a.pairing_id, to_b.pairing_id);
        assert!(to_a.your_seq < to_a.peer_seq);
        assert_eq!((to_a.your_seq, to_a.peer_seq), (to_b.peer_seq, to_b.your_seq));
    }

    #[tokio::test]
    async fn third_participant_is_rejected() {
        let relay = LocalRelay::new();
        let a = relay.connect(PeerId::from("a"));
        let b = relay.connect(PeerId::from("b"));
        let c = relay.connect(PeerId::from("c"));
        join("42", &a).unwrap();
        join("42", &b).unwrap();
        let err = join("42", &c).expect_err("room full");
        assert!(matches!(err, RelayError::RoomFull(room) if room == "42"));
        assert_eq!(relay.registry().room_of(&PeerId::from("c")), None);
    }

    #[tokio::test]
    async fn forwarding_requires_shared_room() {
        let relay = LocalRelay::new();
        let a = relay.connect(PeerId::from("a"));
        let b = relay.connect(PeerId::from("b"));
        join("1", &a).unwrap();
        join("2", &b).unwrap();
        let err = a.send(candidate(&a, "b", "c1")).expect_err("not paired");
        assert!(matches!(err, RelayError::NotInRoom { .. }));
    }

    #[tokio::test]
    async fn leaving_notifies_remaining_member() {
        let relay = LocalRelay::new();
        let a = relay.connect(PeerId::from("a"));
        let b = relay.connect(PeerId::from("b"));
        join("42", &a).unwrap();
        join("42", &b).unwrap();
        let _ = a.recv().await;
        drop(b);

        let notice = a.recv().await.expect("peer-left");
        assert_eq!(notice.kind, MessageType::PeerLeft);
        let payload: PeerLeftPayload = notice.decode_payload().unwrap();
        assert_eq!(payload.peer_id, PeerId::from("b"));
        assert_eq!(relay.registry().members("42"), vec![PeerId::from("a")]);
    }

    #[tokio::test]
    async fn paused_traffic_is_released_in_order() {
        let relay = LocalRelay::new();
        let a = relay.connect(PeerId::from("a"));
        let b = relay.connect(PeerId::from("b"));
        join("42", &a).unwrap();
        join("42", &b).unwrap();
        let _ = b.recv().await;

        relay.pause();
        a.send(candidate(&a, "b", "first")).unwrap();
        a.send(candidate(&a, "b", "second")).unwrap();
        assert_eq!(relay.held(), 2);
        relay.resume();

        for expected in ["first", "second"] {
            let payload: CandidatePayload = b.recv().await.unwrap().decode_payload().unwrap();
            assert_eq!(payload.candidate.candidate, expected);
        }
    }

    #[tokio::test]
    async fn refused_join_keeps_the_current_room() {
        let relay = LocalRelay::new();
        let a = relay.connect(PeerId::from("a"));
        let b = relay.connect(PeerId::from("b"));
        let c = relay.connect(PeerId::from("c"));
        let d = relay.connect(PeerId::from("d"));
        join("1", &a).unwrap();
        join("1", &b).unwrap();
        join("2", &c).unwrap();
        join("2", &d).unwrap();
        let _ = a.recv().await;

        let err = join("2", &a).expect_err("room 2 is full");
        assert!(matches!(err, RelayError::RoomFull(room) if room == "2"));
        assert_eq!(relay.registry().room_of(&PeerId::from("a")), Some("1".into()));
        assert_eq!(
            relay.registry().members("1"),
            vec![PeerId::from("a"), PeerId::from("b")]
        );

        // b still hears a over room 1, with no peer-left in between.
        assert_eq!(b.recv().await.unwrap().kind, MessageType::PeerJoined);
        a.send(candidate(&a, "b", "still-here")).unwrap();
        let next = b.recv().await.unwrap();
        assert_eq!(next.kind, MessageType::IceCandidate);
    }

    #[test]
    fn rejoining_the_same_full_room_is_allowed() {
        let relay = LocalRelay::new();
        let a = relay.connect(PeerId::from("a"));
        let b = relay.connect(PeerId::from("b"));
        join("42", &a).unwrap();
        join("42", &b).unwrap();
        join("42", &a).expect("a already holds a seat");
        assert_eq!(
            relay.registry().members("42"),
            vec![PeerId::from("b"), PeerId::from("a")]
        );
    }

    #[test]
    fn relay_id_cannot_join() {
        let relay = LocalRelay::new();
        let impostor = relay.connect(PeerId::relay());
        let err = join("42", &impostor).expect_err("reserved id");
        assert!(matches!(err, RelayError::ReservedId(_)));
        assert!(relay.registry().members("42").is_empty());
    }

    #[test]
    fn capacity_is_at_least_one() {
        assert_eq!(RoomRegistry::new(0).capacity(), 1);
        assert_eq!(RoomRegistry::default().capacity(), DEFAULT_ROOM_CAPACITY);
    }

    #[test]
    fn sender_identity_is_enforced() {
        let relay = LocalRelay::new();
        let a = relay.connect(PeerId::from("a"));
        let spoofed = SignalingMessage::new(
            MessageType::Join,
            PeerId::from("mallory"),
            None,
            &JoinPayload { room: "42".into() },
        )
        .unwrap();
        a.send(spoofed).unwrap();
        assert_eq!(relay.registry().members("42"), vec![PeerId::from("a")]);
    }
}
