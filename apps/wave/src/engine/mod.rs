//! Runs negotiation sessions against a signaling transport.
//!
//! The engine task reads relay messages, keeps one session per paired peer
//! and serves requests from [`EngineHandle`]. Sessions run on their own
//! tasks (see [`driver`]); the engine only routes to them.

mod driver;
mod room;

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use wave_proto::{PeerId, SignalingMessage};

use crate::config::EngineConfig;
use crate::error::NegotiationError;
use crate::handle::{ConnectionState, HandleFactory};
use crate::media::{MediaCapture, MediaError, MediaTrack, TrackSet};
use crate::negotiation::{CloseReason, NegotiationStage, Politeness, SessionSnapshot};
use crate::signaling::{Routed, SignalingRouter, SignalingTransport};
use driver::DriverContext;
use room::RoomCoordinator;

/// What the presentation layer hears about.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    PeerJoined {
        peer: PeerId,
        politeness: Politeness,
    },
    RemoteTrackAvailable {
        peer: PeerId,
        track: MediaTrack,
    },
    ConnectionStateChanged {
        peer: PeerId,
        state: ConnectionState,
    },
    NegotiationFailed {
        peer: PeerId,
        stage: NegotiationStage,
        reason: String,
    },
    MediaAcquisitionFailed {
        peer: PeerId,
        error: MediaError,
    },
    SessionClosed {
        peer: PeerId,
        reason: CloseReason,
    },
    RelayRejected {
        reason: String,
    },
}

enum Command {
    JoinRoom {
        room: String,
        reply: oneshot::Sender<Result<(), NegotiationError>>,
    },
    AddLocalTracks(TrackSet),
    Watch {
        peer: PeerId,
        reply: oneshot::Sender<Option<watch::Receiver<SessionSnapshot>>>,
    },
    Snapshots(oneshot::Sender<Vec<SessionSnapshot>>),
    Shutdown(oneshot::Sender<()>),
}

pub struct NegotiationEngine {
    router: SignalingRouter,
    transport: Arc<dyn SignalingTransport>,
    rooms: RoomCoordinator,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl NegotiationEngine {
    pub fn spawn(
        transport: Arc<dyn SignalingTransport>,
        factory: Arc<dyn HandleFactory>,
        capture: Arc<dyn MediaCapture>,
        config: EngineConfig,
    ) -> EngineHandle {
        let router = SignalingRouter::new(transport.local_id().clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (reaper_tx, reaper_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let ctx = Arc::new(DriverContext {
            transport: transport.clone(),
            router: router.clone(),
            factory,
            capture,
            config,
            events: events_tx.clone(),
            reaper: reaper_tx,
        });
        let engine = NegotiationEngine {
            router,
            transport,
            rooms: RoomCoordinator::new(ctx),
            events: events_tx,
        };
        let local_id = engine.router.local_id().clone();
        let task = tokio::spawn(engine.run(commands_rx, reaper_rx));

        EngineHandle {
            local_id,
            commands: commands_tx,
            events: Mutex::new(Some(events_rx)),
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut reaper: mpsc::UnboundedReceiver<(PeerId, String)>,
    ) {
        tracing::info!(target = "negotiation", peer = %self.router.local_id(), "engine started");
        let transport = self.transport.clone();
        let mut shutdown_reply = None;
        loop {
            tokio::select! {
                message = transport.recv() => match message {
                    Some(message) => self.on_message(message),
                    None => {
                        tracing::warn!(target = "signaling", "relay connection closed");
                        break;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                Some((peer, pairing_id)) = reaper.recv() => {
                    self.rooms.reap(&peer, &pairing_id);
                }
            }
        }
        self.rooms.close_all(CloseReason::Shutdown).await;
        tracing::info!(target = "negotiation", "engine stopped");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn on_message(&mut self, message: SignalingMessage) {
        let kind = message.kind;
        let routed = match self.router.route(message) {
            Ok(routed) => routed,
            Err(err) => {
                tracing::warn!(target = "signaling", kind = %kind, error = %err, "dropping relay message");
                return;
            }
        };
        match routed {
            Routed::PeerJoined {
                peer,
                room,
                pairing_id,
                your_seq,
                peer_seq,
            } => {
                let politeness = match Politeness::from_join_order(your_seq, peer_seq) {
                    Ok(politeness) => politeness,
                    Err(err) => {
                        tracing::error!(target = "negotiation", remote = %peer, error = %err, "cannot pair");
                        return;
                    }
                };
                tracing::info!(
                    target = "negotiation",
                    remote = %peer,
                    room = %room,
                    polite = politeness.is_polite(),
                    "paired with peer"
                );
                self.rooms.peer_joined(peer.clone(), pairing_id, politeness);
                let _ = self.events.send(EngineEvent::PeerJoined { peer, politeness });
            }
            Routed::PeerLeft { room, peer } => {
                tracing::info!(target = "negotiation", remote = %peer, room = %room, "peer left");
                self.rooms.peer_left(&peer);
            }
            Routed::Session { peer, input } => self.rooms.dispatch(&peer, input),
            Routed::Rejected { reason } => {
                tracing::warn!(target = "signaling", reason = %reason, "relay rejected a message");
                let _ = self.events.send(EngineEvent::RelayRejected { reason });
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::JoinRoom { room, reply } => {
                let result = self.join_room(&room).await;
                let _ = reply.send(result);
            }
            Command::AddLocalTracks(tracks) => self.rooms.add_local_tracks(tracks),
            Command::Watch { peer, reply } => {
                let _ = reply.send(self.rooms.watch(&peer));
            }
            Command::Snapshots(reply) => {
                let _ = reply.send(self.rooms.snapshots());
            }
            Command::Shutdown(_) => {}
        }
    }

    async fn join_room(&self, room: &str) -> Result<(), NegotiationError> {
        let message = self.router.join(room)?;
        self.transport.send(message).await?;
        tracing::info!(
            target = "negotiation",
            room = %room,
            sessions = self.rooms.len(),
            "join requested"
        );
        Ok(())
    }
}

/// Control surface for a running engine.
pub struct EngineHandle {
    local_id: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    events: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EngineHandle {
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub async fn join_room(&self, room: &str) -> Result<(), NegotiationError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::JoinRoom {
            room: room.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| NegotiationError::EngineClosed)?
    }

    /// Add tracks to every current session and to sessions formed later.
    pub fn add_local_tracks(&self, tracks: TrackSet) -> Result<(), NegotiationError> {
        self.command(Command::AddLocalTracks(tracks))
    }

    pub async fn session(
        &self,
        peer: &PeerId,
    ) -> Result<watch::Receiver<SessionSnapshot>, NegotiationError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Watch {
            peer: peer.clone(),
            reply,
        })?;
        rx.await
            .map_err(|_| NegotiationError::EngineClosed)?
            .ok_or_else(|| NegotiationError::UnknownSession(peer.clone()))
    }

    pub async fn sessions(&self) -> Result<Vec<SessionSnapshot>, NegotiationError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Snapshots(reply))?;
        rx.await.map_err(|_| NegotiationError::EngineClosed)
    }

    /// Yields the event receiver the first time it is called.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.events.lock().take()
    }

    /// Close every session and stop the engine task.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Shutdown(reply)).is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn command(&self, command: Command) -> Result<(), NegotiationError> {
        self.commands
            .send(command)
            .map_err(|_| NegotiationError::EngineClosed)
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
