//! One tokio task per session.
//!
//! The task owns the [`NegotiationSession`] and feeds it inputs from a
//! single queue, so state transitions never interleave. Handle operations
//! run on a companion worker in submission order; handle events are pumped
//! into the same queue as everything else.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use wave_proto::PeerId;

use super::EngineEvent;
use crate::config::EngineConfig;
use crate::handle::{HandleEvent, HandleFactory, PeerConnectionHandle};
use crate::media::MediaCapture;
use crate::negotiation::{
    CloseReason, Effect, NegotiationSession, OpFailure, OpOutput, Operation, OperationKind,
    SessionEvent, SessionInput, SessionParams, SessionSnapshot,
};
use crate::signaling::{SignalingRouter, SignalingTransport};

/// Everything a session task needs from its engine.
pub(crate) struct DriverContext {
    pub(crate) transport: Arc<dyn SignalingTransport>,
    pub(crate) router: SignalingRouter,
    pub(crate) factory: Arc<dyn HandleFactory>,
    pub(crate) capture: Arc<dyn MediaCapture>,
    pub(crate) config: EngineConfig,
    pub(crate) events: mpsc::UnboundedSender<EngineEvent>,
    pub(crate) reaper: mpsc::UnboundedSender<(PeerId, String)>,
}

pub(crate) struct SessionHandle {
    pairing_id: String,
    inputs: mpsc::UnboundedSender<SessionInput>,
    snapshot: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub(crate) fn spawn(ctx: Arc<DriverContext>, params: SessionParams) -> Self {
        let pairing_id = params.pairing_id.clone();
        let session = NegotiationSession::new(params);
        let (snapshot_tx, snapshot) = watch::channel(session.snapshot());
        let (inputs, rx) = mpsc::unbounded_channel();
        let _ = inputs.send(SessionInput::Start);
        let task = tokio::spawn(run_session(ctx, session, rx, inputs.clone(), snapshot_tx));
        Self {
            pairing_id,
            inputs,
            snapshot,
            task,
        }
    }

    pub(crate) fn pairing_id(&self) -> &str {
        &self.pairing_id
    }

    pub(crate) fn send(&self, input: SessionInput) -> bool {
        self.inputs.send(input).is_ok()
    }

    pub(crate) fn close(&self, reason: CloseReason) {
        let _ = self.inputs.send(SessionInput::Close(reason));
    }

    pub(crate) fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub(crate) async fn join(self) {
        let _ = self.task.await;
    }
}

async fn run_session(
    ctx: Arc<DriverContext>,
    mut session: NegotiationSession,
    mut rx: mpsc::UnboundedReceiver<SessionInput>,
    inputs: mpsc::UnboundedSender<SessionInput>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
) {
    let peer = session.remote_peer().clone();
    let pairing_id = session.pairing_id().to_string();

    let handle = match ctx.factory.create(&peer, &ctx.config).await {
        Ok(handle) => handle,
        Err(err) => {
            tracing::error!(
                target = "negotiation",
                remote = %peer,
                error = %err,
                "could not create peer connection"
            );
            let effects = session.handle(SessionInput::Close(CloseReason::HandleUnavailable));
            snapshot_tx.send_replace(session.snapshot());
            for effect in effects {
                if let Effect::Notify(event) = effect {
                    notify(&ctx, &peer, event);
                }
            }
            let _ = ctx.reaper.send((peer, pairing_id));
            return;
        }
    };

    let pump = handle.take_events().map(|events| spawn_event_pump(events, inputs.clone()));
    let (ops_tx, ops_rx) = mpsc::unbounded_channel();
    let worker = spawn_worker(handle.clone(), ctx.capture.clone(), ops_rx, inputs);

    tracing::debug!(
        target = "negotiation",
        remote = %peer,
        pairing = %pairing_id,
        "session started"
    );

    while let Some(input) = rx.recv().await {
        let effects = session.handle(input);
        snapshot_tx.send_replace(session.snapshot());
        for effect in effects {
            match effect {
                Effect::Send(signal) => {
                    let message = match ctx.router.wrap(signal) {
                        Ok(message) => message,
                        Err(err) => {
                            tracing::warn!(target = "negotiation", error = %err, "encode failed");
                            continue;
                        }
                    };
                    let kind = message.kind;
                    if let Err(err) = ctx.transport.send(message).await {
                        tracing::warn!(
                            target = "negotiation",
                            remote = %peer,
                            kind = %kind,
                            error = %err,
                            "signal not sent"
                        );
                    }
                }
                Effect::Run(op) => {
                    if ops_tx.send(op).is_err() {
                        tracing::warn!(target = "negotiation", remote = %peer, "operation worker gone");
                    }
                }
                Effect::Notify(event) => notify(&ctx, &peer, event),
                Effect::CloseHandle => {
                    if let Err(err) = handle.close().await {
                        tracing::debug!(target = "negotiation", error = %err, "close failed");
                    }
                }
            }
        }
        if session.is_closed() {
            break;
        }
    }

    worker.abort();
    if let Some(pump) = pump {
        pump.abort();
    }
    tracing::debug!(target = "negotiation", remote = %peer, pairing = %pairing_id, "session ended");
    let _ = ctx.reaper.send((peer, pairing_id));
}

fn spawn_event_pump(
    mut events: mpsc::UnboundedReceiver<HandleEvent>,
    inputs: mpsc::UnboundedSender<SessionInput>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let input = match event {
                HandleEvent::LocalCandidate(candidate) => SessionInput::LocalCandidate(candidate),
                HandleEvent::NegotiationNeeded => SessionInput::NegotiationNeeded,
                HandleEvent::RemoteTrack(track) => SessionInput::RemoteTrack(track),
                HandleEvent::ConnectionState(state) => SessionInput::ConnectionState(state),
            };
            if inputs.send(input).is_err() {
                break;
            }
        }
    })
}

fn spawn_worker(
    handle: Arc<dyn PeerConnectionHandle>,
    capture: Arc<dyn MediaCapture>,
    mut ops: mpsc::UnboundedReceiver<Operation>,
    inputs: mpsc::UnboundedSender<SessionInput>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(Operation { id, kind }) = ops.recv().await {
            tracing::trace!(target = "negotiation", op = %id, kind = ?kind, "running operation");
            let result = execute(handle.as_ref(), capture.as_ref(), kind).await;
            if inputs.send(SessionInput::OpCompleted { op: id, result }).is_err() {
                break;
            }
        }
    })
}

async fn execute(
    handle: &dyn PeerConnectionHandle,
    capture: &dyn MediaCapture,
    kind: OperationKind,
) -> Result<OpOutput, OpFailure> {
    let done = |_| OpOutput::Done;
    match kind {
        OperationKind::CreateOffer => Ok(OpOutput::Description(handle.create_offer().await?)),
        OperationKind::CreateAnswer => Ok(OpOutput::Description(handle.create_answer().await?)),
        OperationKind::SetLocal(description) => {
            Ok(handle.set_local_description(description).await.map(done)?)
        }
        OperationKind::SetRemote(description) => {
            Ok(handle.set_remote_description(description).await.map(done)?)
        }
        OperationKind::Rollback => Ok(handle.rollback().await.map(done)?),
        OperationKind::AddIceCandidate(candidate) => {
            Ok(handle.add_ice_candidate(candidate).await.map(done)?)
        }
        OperationKind::AddTracks(tracks) => Ok(handle.add_tracks(&tracks).await.map(done)?),
        OperationKind::AcquireMedia => Ok(OpOutput::Tracks(capture.acquire_local_tracks().await?)),
    }
}

fn notify(ctx: &DriverContext, peer: &PeerId, event: SessionEvent) {
    let peer = peer.clone();
    let event = match event {
        SessionEvent::RemoteTrackAvailable(track) => EngineEvent::RemoteTrackAvailable { peer, track },
        SessionEvent::ConnectionStateChanged(state) => {
            EngineEvent::ConnectionStateChanged { peer, state }
        }
        SessionEvent::NegotiationFailed { stage, reason } => EngineEvent::NegotiationFailed {
            peer,
            stage,
            reason,
        },
        SessionEvent::MediaAcquisitionFailed(error) => {
            EngineEvent::MediaAcquisitionFailed { peer, error }
        }
        SessionEvent::Closed(reason) => EngineEvent::SessionClosed { peer, reason },
    };
    let _ = ctx.events.send(event);
}
