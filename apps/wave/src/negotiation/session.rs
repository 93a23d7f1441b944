//! The per-pairing negotiation state machine.
//!
//! [`NegotiationSession`] performs no I/O. The driver feeds it one
//! [`SessionInput`] at a time and executes the returned [`Effect`]s in
//! order: messages to send, operations to run against the connection
//! handle, and events for the presentation layer. Every operation carries
//! an [`OpId`]; its completion comes back as [`SessionInput::OpCompleted`]
//! and is ignored when the session no longer waits for that id.
//!
//! Collisions follow the polite/impolite rule: the polite side's offer
//! always survives. A polite session that receives an offer while it is
//! offering ignores it. An impolite session in the same spot rolls back
//! (or abandons) its own offer and answers.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use wave_proto::{IceCandidate, PeerId, SdpType, SessionDescription};

use super::ice::{IceCandidateRelay, Inbound, Outbound};
use super::trigger::{NegotiationTrigger, TriggerDecision};
use crate::error::NegotiationError;
use crate::handle::{ConnectionState, HandleError, SignalingState};
use crate::media::{MediaError, MediaTrack, TrackSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Politeness {
    Polite,
    Impolite,
}

impl Politeness {
    /// The earlier joiner (lower sequence) is impolite and offers first.
    pub fn from_join_order(your_seq: u64, peer_seq: u64) -> Result<Self, NegotiationError> {
        match your_seq.cmp(&peer_seq) {
            std::cmp::Ordering::Less => Ok(Politeness::Impolite),
            std::cmp::Ordering::Greater => Ok(Politeness::Polite),
            std::cmp::Ordering::Equal => Err(NegotiationError::PolitenessConflict(your_seq)),
        }
    }

    pub fn is_polite(self) -> bool {
        self == Politeness::Polite
    }

    pub fn initial_role(self) -> Role {
        match self {
            Politeness::Impolite => Role::Offerer,
            Politeness::Polite => Role::Answerer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    PeerLeft,
    ConnectionFailed,
    ConnectionClosed,
    /// A new pairing with the same peer took over.
    Replaced,
    HandleUnavailable,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::PeerLeft => "peer left",
            CloseReason::ConnectionFailed => "connection failed",
            CloseReason::ConnectionClosed => "connection closed",
            CloseReason::Replaced => "replaced by a new pairing",
            CloseReason::HandleUnavailable => "peer connection unavailable",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationStage {
    CreateOffer,
    ApplyLocalOffer,
    ApplyRemoteAnswer,
    ApplyRemoteOffer,
    AddTracks,
    CreateAnswer,
    ApplyLocalAnswer,
    /// The remote peer could not apply our offer and sent a rollback.
    OfferRefused,
}

impl fmt::Display for NegotiationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            NegotiationStage::CreateOffer => "create offer",
            NegotiationStage::ApplyLocalOffer => "apply local offer",
            NegotiationStage::ApplyRemoteAnswer => "apply remote answer",
            NegotiationStage::ApplyRemoteOffer => "apply remote offer",
            NegotiationStage::AddTracks => "add tracks",
            NegotiationStage::CreateAnswer => "create answer",
            NegotiationStage::ApplyLocalAnswer => "apply local answer",
            NegotiationStage::OfferRefused => "offer refused by peer",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    Rollback,
    AddIceCandidate(IceCandidate),
    AddTracks(TrackSet),
    AcquireMedia,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub id: OpId,
    pub kind: OperationKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutput {
    Done,
    Description(SessionDescription),
    Tracks(TrackSet),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OpFailure {
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error(transparent)]
    Media(#[from] MediaError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    Start,
    NegotiationNeeded,
    RemoteDescription {
        pairing_id: String,
        description: SessionDescription,
        renegotiation: bool,
    },
    RemoteCandidate {
        pairing_id: String,
        candidate: IceCandidate,
    },
    LocalCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    RemoteTrack(MediaTrack),
    AddLocalTracks(TrackSet),
    OpCompleted {
        op: OpId,
        result: Result<OpOutput, OpFailure>,
    },
    Close(CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalBody {
    Offer {
        description: SessionDescription,
        renegotiation: bool,
    },
    Answer {
        description: SessionDescription,
        renegotiation: bool,
    },
    Candidate(IceCandidate),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSignal {
    pub target: PeerId,
    pub pairing_id: String,
    pub body: SignalBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    RemoteTrackAvailable(MediaTrack),
    ConnectionStateChanged(ConnectionState),
    NegotiationFailed {
        stage: NegotiationStage,
        reason: String,
    },
    MediaAcquisitionFailed(MediaError),
    Closed(CloseReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(OutboundSignal),
    Run(Operation),
    Notify(SessionEvent),
    CloseHandle,
}

pub struct SessionParams {
    pub remote_peer: PeerId,
    pub pairing_id: String,
    pub politeness: Politeness,
    pub capture_on_start: bool,
    pub capture_on_answer: bool,
    /// Tracks supplied before the session existed.
    pub initial_tracks: TrackSet,
}

/// Point-in-time view published after every input.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub remote_peer: PeerId,
    pub pairing_id: String,
    pub politeness: Politeness,
    pub role: Role,
    pub signaling_state: SignalingState,
    pub connection_state: ConnectionState,
    pub making_offer: bool,
    pub ignore_offer: bool,
    pub rounds_completed: u64,
    pub offers_sent: u64,
    pub answers_sent: u64,
    pub offers_ignored: u64,
    pub local_tracks: TrackSet,
    pub remote_tracks: TrackSet,
    pub closed: Option<CloseReason>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OfferPhase {
    Creating(OpId),
    ApplyingLocal(OpId, SessionDescription),
    AwaitingAnswer,
    ApplyingAnswer(OpId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AnswerPhase {
    ApplyingRemote(OpId),
    AcquiringMedia(OpId),
    AddingTracks(OpId, TrackSet),
    Creating(OpId),
    ApplyingLocal(OpId, SessionDescription),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Stable,
    Offering(OfferPhase),
    Answering {
        renegotiation: bool,
        phase: AnswerPhase,
    },
    Closed,
}

/// Operations that run beside the current round.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Aux {
    Candidate,
    Tracks(TrackSet),
    StartupMedia,
    Rollback,
}

pub struct NegotiationSession {
    remote_peer: PeerId,
    pairing_id: String,
    politeness: Politeness,
    role: Role,
    making_offer: bool,
    ignore_offer: bool,
    step: Step,
    aux: HashMap<OpId, Aux>,
    next_op: u64,
    ice: IceCandidateRelay,
    trigger: NegotiationTrigger,
    capture_on_start: bool,
    capture_on_answer: bool,
    media_requested: bool,
    staged: TrackSet,
    local_tracks: TrackSet,
    remote_tracks: TrackSet,
    queued_offer: Option<(SessionDescription, bool)>,
    connection: ConnectionState,
    rounds_completed: u64,
    offers_sent: u64,
    answers_sent: u64,
    offers_ignored: u64,
    closed: Option<CloseReason>,
}

impl NegotiationSession {
    pub fn new(params: SessionParams) -> Self {
        let mut ice = IceCandidateRelay::new();
        ice.assign_remote_peer(params.remote_peer.clone());
        Self {
            remote_peer: params.remote_peer,
            pairing_id: params.pairing_id,
            politeness: params.politeness,
            role: params.politeness.initial_role(),
            making_offer: false,
            ignore_offer: false,
            step: Step::Stable,
            aux: HashMap::new(),
            next_op: 0,
            ice,
            trigger: NegotiationTrigger::new(),
            capture_on_start: params.capture_on_start,
            capture_on_answer: params.capture_on_answer,
            media_requested: false,
            staged: params.initial_tracks,
            local_tracks: TrackSet::new(),
            remote_tracks: TrackSet::new(),
            queued_offer: None,
            connection: ConnectionState::New,
            rounds_completed: 0,
            offers_sent: 0,
            answers_sent: 0,
            offers_ignored: 0,
            closed: None,
        }
    }

    pub fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    pub fn pairing_id(&self) -> &str {
        &self.pairing_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub fn handle(&mut self, input: SessionInput) -> Vec<Effect> {
        let mut out = Vec::new();
        if self.closed.is_some() {
            tracing::trace!(
                target = "negotiation",
                remote = %self.remote_peer,
                "input after close ignored"
            );
            return out;
        }
        match input {
            SessionInput::Start => self.on_start(&mut out),
            SessionInput::NegotiationNeeded => self.request_negotiation(&mut out),
            SessionInput::RemoteDescription {
                pairing_id,
                description,
                renegotiation,
            } => {
                if self.is_stale(&pairing_id) {
                    return out;
                }
                match description.sdp_type {
                    SdpType::Offer => self.on_remote_offer(description, renegotiation, &mut out),
                    SdpType::Answer => self.on_remote_answer(description, &mut out),
                    SdpType::Rollback => self.on_offer_refused(&mut out),
                }
            }
            SessionInput::RemoteCandidate {
                pairing_id,
                candidate,
            } => {
                if !self.is_stale(&pairing_id) {
                    self.on_remote_candidate(candidate, &mut out);
                }
            }
            SessionInput::LocalCandidate(candidate) => self.on_local_candidate(candidate, &mut out),
            SessionInput::ConnectionState(state) => self.on_connection_state(state, &mut out),
            SessionInput::RemoteTrack(track) => {
                if self.remote_tracks.insert(track.clone()) {
                    out.push(Effect::Notify(SessionEvent::RemoteTrackAvailable(track)));
                }
            }
            SessionInput::AddLocalTracks(tracks) => self.on_add_local_tracks(tracks, &mut out),
            SessionInput::OpCompleted { op, result } => self.on_completed(op, result, &mut out),
            SessionInput::Close(reason) => self.teardown(reason, &mut out),
        }
        out
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            remote_peer: self.remote_peer.clone(),
            pairing_id: self.pairing_id.clone(),
            politeness: self.politeness,
            role: self.role,
            signaling_state: self.signaling_state(),
            connection_state: self.connection,
            making_offer: self.making_offer,
            ignore_offer: self.ignore_offer,
            rounds_completed: self.rounds_completed,
            offers_sent: self.offers_sent,
            answers_sent: self.answers_sent,
            offers_ignored: self.offers_ignored,
            local_tracks: self.local_tracks.clone(),
            remote_tracks: self.remote_tracks.clone(),
            closed: self.closed,
        }
    }

    fn signaling_state(&self) -> SignalingState {
        match &self.step {
            Step::Stable => SignalingState::Stable,
            Step::Offering(OfferPhase::Creating(_) | OfferPhase::ApplyingLocal(..)) => {
                SignalingState::Stable
            }
            Step::Offering(_) => SignalingState::HaveLocalOffer,
            Step::Answering {
                phase: AnswerPhase::ApplyingRemote(_),
                ..
            } => SignalingState::Stable,
            Step::Answering { .. } => SignalingState::HaveRemoteOffer,
            Step::Closed => SignalingState::Closed,
        }
    }

    fn is_stale(&self, pairing_id: &str) -> bool {
        if pairing_id == self.pairing_id {
            return false;
        }
        tracing::debug!(
            target = "negotiation",
            remote = %self.remote_peer,
            expected = %self.pairing_id,
            received = %pairing_id,
            "dropping message from an earlier pairing"
        );
        true
    }

    fn run(&mut self, kind: OperationKind, out: &mut Vec<Effect>) -> OpId {
        self.next_op += 1;
        let id = OpId(self.next_op);
        out.push(Effect::Run(Operation { id, kind }));
        id
    }

    fn run_aux(&mut self, kind: OperationKind, aux: Aux, out: &mut Vec<Effect>) {
        let id = self.run(kind, out);
        self.aux.insert(id, aux);
    }

    fn send(&mut self, body: SignalBody, out: &mut Vec<Effect>) {
        out.push(Effect::Send(OutboundSignal {
            target: self.remote_peer.clone(),
            pairing_id: self.pairing_id.clone(),
            body,
        }));
    }

    fn fail(&mut self, stage: NegotiationStage, error: &OpFailure, out: &mut Vec<Effect>) {
        tracing::warn!(
            target = "negotiation",
            remote = %self.remote_peer,
            stage = %stage,
            error = %error,
            "negotiation step failed"
        );
        out.push(Effect::Notify(SessionEvent::NegotiationFailed {
            stage,
            reason: error.to_string(),
        }));
    }

    fn on_start(&mut self, out: &mut Vec<Effect>) {
        if self.politeness.initial_role() == Role::Answerer {
            tracing::debug!(
                target = "negotiation",
                remote = %self.remote_peer,
                "waiting for the first offer"
            );
            return;
        }
        if !self.staged.is_empty() {
            self.flush_staged(out);
        } else if self.capture_on_start {
            self.media_requested = true;
            self.run_aux(OperationKind::AcquireMedia, Aux::StartupMedia, out);
        } else {
            self.request_negotiation(out);
        }
    }

    fn flush_staged(&mut self, out: &mut Vec<Effect>) {
        let staged = std::mem::take(&mut self.staged);
        let fresh = self.fresh_tracks(&staged);
        if !fresh.is_empty() {
            self.run_aux(OperationKind::AddTracks(fresh.clone()), Aux::Tracks(fresh), out);
        }
    }

    fn fresh_tracks(&self, tracks: &TrackSet) -> TrackSet {
        TrackSet::from(
            tracks
                .iter()
                .filter(|track| !self.local_tracks.contains(&track.id))
                .cloned()
                .collect::<Vec<_>>(),
        )
    }

    /// Before its first answer the initial answerer holds tracks back so
    /// that adding them cannot start a competing offer.
    fn holds_tracks_for_answer(&self) -> bool {
        self.politeness.initial_role() == Role::Answerer
            && self.rounds_completed == 0
            && !matches!(self.step, Step::Offering(_))
    }

    fn on_add_local_tracks(&mut self, tracks: TrackSet, out: &mut Vec<Effect>) {
        if self.holds_tracks_for_answer() {
            self.staged.merge(&tracks);
            tracing::debug!(
                target = "negotiation",
                remote = %self.remote_peer,
                staged = self.staged.len(),
                "staging tracks for the first answer"
            );
            return;
        }
        self.staged.merge(&tracks);
        self.flush_staged(out);
    }

    fn request_negotiation(&mut self, out: &mut Vec<Effect>) {
        let busy = self.step != Step::Stable;
        match self.trigger.on_needed(self.making_offer, busy) {
            TriggerDecision::Start => self.start_negotiation(out),
            TriggerDecision::Coalesced => {
                tracing::debug!(
                    target = "negotiation",
                    remote = %self.remote_peer,
                    "negotiation already in flight; coalesced"
                );
            }
            TriggerDecision::Deferred => {
                tracing::debug!(
                    target = "negotiation",
                    remote = %self.remote_peer,
                    "session busy; negotiation deferred until stable"
                );
            }
        }
    }

    fn start_negotiation(&mut self, out: &mut Vec<Effect>) {
        if self.making_offer {
            return;
        }
        self.making_offer = true;
        self.role = Role::Offerer;
        let op = self.run(OperationKind::CreateOffer, out);
        self.step = Step::Offering(OfferPhase::Creating(op));
        tracing::debug!(
            target = "negotiation",
            remote = %self.remote_peer,
            round = self.rounds_completed + 1,
            "creating offer"
        );
    }

    fn on_remote_offer(
        &mut self,
        description: SessionDescription,
        renegotiation: bool,
        out: &mut Vec<Effect>,
    ) {
        if matches!(self.step, Step::Offering(OfferPhase::ApplyingAnswer(_))) {
            // The answer in flight settles our round first.
            self.queued_offer = Some((description, renegotiation));
            return;
        }

        let collision = self.making_offer || self.step != Step::Stable;
        self.ignore_offer = self.politeness.is_polite() && collision;
        if self.ignore_offer {
            self.offers_ignored += 1;
            tracing::info!(
                target = "negotiation",
                remote = %self.remote_peer,
                "offer collision; keeping our offer"
            );
            return;
        }

        let rollback_first = if collision {
            match &self.step {
                Step::Offering(OfferPhase::Creating(_)) => {
                    self.making_offer = false;
                    false
                }
                Step::Offering(OfferPhase::ApplyingLocal(..)) => {
                    self.making_offer = false;
                    true
                }
                Step::Offering(_) => true,
                _ => {
                    tracing::warn!(
                        target = "negotiation",
                        remote = %self.remote_peer,
                        "offer received mid-answer; dropping"
                    );
                    return;
                }
            }
        } else {
            false
        };
        if collision {
            tracing::info!(
                target = "negotiation",
                remote = %self.remote_peer,
                rollback = rollback_first,
                "offer collision; yielding to the polite peer"
            );
        }

        self.role = Role::Answerer;
        if rollback_first {
            self.run_aux(OperationKind::Rollback, Aux::Rollback, out);
        }
        let op = self.run(OperationKind::SetRemote(description), out);
        self.step = Step::Answering {
            renegotiation,
            phase: AnswerPhase::ApplyingRemote(op),
        };
    }

    fn on_remote_answer(&mut self, description: SessionDescription, out: &mut Vec<Effect>) {
        if self.step != Step::Offering(OfferPhase::AwaitingAnswer) {
            tracing::debug!(
                target = "negotiation",
                remote = %self.remote_peer,
                "no offer outstanding; discarding stale answer"
            );
            return;
        }
        let op = self.run(OperationKind::SetRemote(description), out);
        self.step = Step::Offering(OfferPhase::ApplyingAnswer(op));
    }

    fn on_offer_refused(&mut self, out: &mut Vec<Effect>) {
        if self.step != Step::Offering(OfferPhase::AwaitingAnswer) {
            tracing::debug!(
                target = "negotiation",
                remote = %self.remote_peer,
                "refusal without an outstanding offer; ignoring"
            );
            return;
        }
        tracing::warn!(
            target = "negotiation",
            remote = %self.remote_peer,
            "peer refused our offer; rolling back"
        );
        out.push(Effect::Notify(SessionEvent::NegotiationFailed {
            stage: NegotiationStage::OfferRefused,
            reason: "remote peer could not apply the offer".into(),
        }));
        self.run_aux(OperationKind::Rollback, Aux::Rollback, out);
        self.settle(false, out);
    }

    fn on_remote_candidate(&mut self, candidate: IceCandidate, out: &mut Vec<Effect>) {
        match self.ice.on_remote_candidate(candidate) {
            Inbound::Apply(candidate) => {
                self.run_aux(OperationKind::AddIceCandidate(candidate), Aux::Candidate, out);
            }
            Inbound::Queued => {
                tracing::trace!(
                    target = "negotiation",
                    remote = %self.remote_peer,
                    queued = self.ice.queued_inbound(),
                    "candidate queued until remote description"
                );
            }
            Inbound::Duplicate => {
                tracing::debug!(
                    target = "negotiation",
                    remote = %self.remote_peer,
                    "duplicate remote candidate dropped"
                );
            }
        }
    }

    fn on_local_candidate(&mut self, candidate: IceCandidate, out: &mut Vec<Effect>) {
        match self.ice.on_local_candidate(candidate) {
            Outbound::Forward(_, candidate) => self.send(SignalBody::Candidate(candidate), out),
            Outbound::Queued => {
                tracing::trace!(target = "negotiation", "local candidate queued");
            }
            Outbound::Duplicate => {}
        }
    }

    fn remote_description_applied(&mut self, out: &mut Vec<Effect>) {
        for candidate in self.ice.remote_description_applied() {
            self.run_aux(OperationKind::AddIceCandidate(candidate), Aux::Candidate, out);
        }
    }

    fn on_connection_state(&mut self, state: ConnectionState, out: &mut Vec<Effect>) {
        if state == self.connection {
            return;
        }
        self.connection = state;
        tracing::debug!(
            target = "negotiation",
            remote = %self.remote_peer,
            state = %state,
            "connection state changed"
        );
        out.push(Effect::Notify(SessionEvent::ConnectionStateChanged(state)));
        match state {
            ConnectionState::Failed => self.teardown(CloseReason::ConnectionFailed, out),
            ConnectionState::Closed => self.teardown(CloseReason::ConnectionClosed, out),
            _ => {}
        }
    }

    fn teardown(&mut self, reason: CloseReason, out: &mut Vec<Effect>) {
        tracing::info!(
            target = "negotiation",
            remote = %self.remote_peer,
            reason = %reason,
            "closing session"
        );
        self.closed = Some(reason);
        self.making_offer = false;
        self.step = Step::Closed;
        self.aux.clear();
        self.queued_offer = None;
        out.push(Effect::CloseHandle);
        out.push(Effect::Notify(SessionEvent::Closed(reason)));
    }

    fn on_completed(
        &mut self,
        op: OpId,
        result: Result<OpOutput, OpFailure>,
        out: &mut Vec<Effect>,
    ) {
        if let Some(aux) = self.aux.remove(&op) {
            self.complete_aux(aux, result, out);
            return;
        }
        match std::mem::replace(&mut self.step, Step::Stable) {
            Step::Offering(phase) if phase_op(&phase) == Some(op) => {
                self.complete_offer(phase, result, out);
            }
            Step::Answering {
                renegotiation,
                phase,
            } if answer_op(&phase) == op => {
                self.complete_answer(renegotiation, phase, result, out);
            }
            other => {
                self.step = other;
                tracing::trace!(
                    target = "negotiation",
                    remote = %self.remote_peer,
                    op = %op,
                    "discarding superseded completion"
                );
            }
        }
    }

    fn complete_aux(
        &mut self,
        aux: Aux,
        result: Result<OpOutput, OpFailure>,
        out: &mut Vec<Effect>,
    ) {
        match (aux, result) {
            (Aux::Candidate, Ok(_)) => {}
            (Aux::Candidate, Err(err)) => {
                if self.ignore_offer || err == OpFailure::Handle(HandleError::DuplicateCandidate) {
                    tracing::debug!(target = "negotiation", error = %err, "candidate not applied");
                } else {
                    tracing::warn!(
                        target = "negotiation",
                        remote = %self.remote_peer,
                        error = %err,
                        "candidate not applied"
                    );
                }
            }
            (Aux::Tracks(tracks), Ok(_)) => {
                self.local_tracks.merge(&tracks);
            }
            (Aux::Tracks(tracks), Err(err)) => {
                // Retried with the next flush.
                self.staged.merge(&tracks);
                self.fail(NegotiationStage::AddTracks, &err, out);
            }
            (Aux::StartupMedia, Ok(OpOutput::Tracks(tracks))) => {
                let fresh = self.fresh_tracks(&tracks);
                if fresh.is_empty() {
                    self.request_negotiation(out);
                } else {
                    self.run_aux(OperationKind::AddTracks(fresh.clone()), Aux::Tracks(fresh), out);
                }
            }
            (Aux::StartupMedia, Ok(_)) => self.request_negotiation(out),
            (Aux::StartupMedia, Err(err)) => self.media_failed(err, out),
            (Aux::Rollback, Ok(_)) => {}
            (Aux::Rollback, Err(err)) => {
                tracing::debug!(target = "negotiation", error = %err, "rollback not applied");
            }
        }
    }

    fn media_failed(&mut self, err: OpFailure, out: &mut Vec<Effect>) {
        tracing::warn!(
            target = "negotiation",
            remote = %self.remote_peer,
            error = %err,
            "local media unavailable"
        );
        let error = match err {
            OpFailure::Media(error) => error,
            OpFailure::Handle(error) => MediaError::Capture(error.to_string()),
        };
        out.push(Effect::Notify(SessionEvent::MediaAcquisitionFailed(error)));
    }

    /// Give up on answering: roll back the applied offer and tell the
    /// offerer, which is otherwise left waiting for an answer.
    fn abort_round(&mut self, renegotiation: bool, out: &mut Vec<Effect>) {
        if self.rounds_completed == 0 {
            self.ice.remote_description_cleared();
        }
        self.run_aux(OperationKind::Rollback, Aux::Rollback, out);
        self.refuse_offer(renegotiation, out);
        self.settle(false, out);
    }

    fn refuse_offer(&mut self, renegotiation: bool, out: &mut Vec<Effect>) {
        self.send(
            SignalBody::Answer {
                description: SessionDescription::rollback(),
                renegotiation,
            },
            out,
        );
    }

    fn complete_offer(
        &mut self,
        phase: OfferPhase,
        result: Result<OpOutput, OpFailure>,
        out: &mut Vec<Effect>,
    ) {
        match (phase, result) {
            (OfferPhase::Creating(_), Ok(OpOutput::Description(description))) => {
                let op = self.run(OperationKind::SetLocal(description.clone()), out);
                self.step = Step::Offering(OfferPhase::ApplyingLocal(op, description));
            }
            (OfferPhase::Creating(_), Ok(_)) => {
                self.making_offer = false;
                self.fail(
                    NegotiationStage::CreateOffer,
                    &OpFailure::Handle(HandleError::Platform("no description produced".into())),
                    out,
                );
                self.settle(false, out);
            }
            (OfferPhase::Creating(_), Err(err)) => {
                self.making_offer = false;
                self.fail(NegotiationStage::CreateOffer, &err, out);
                self.settle(false, out);
            }
            (OfferPhase::ApplyingLocal(_, description), Ok(_)) => {
                self.making_offer = false;
                self.step = Step::Offering(OfferPhase::AwaitingAnswer);
                self.offers_sent += 1;
                let renegotiation = self.rounds_completed > 0;
                tracing::debug!(
                    target = "negotiation",
                    remote = %self.remote_peer,
                    renegotiation,
                    "sending offer"
                );
                self.send(
                    SignalBody::Offer {
                        description,
                        renegotiation,
                    },
                    out,
                );
            }
            (OfferPhase::ApplyingLocal(..), Err(err)) => {
                self.making_offer = false;
                self.fail(NegotiationStage::ApplyLocalOffer, &err, out);
                self.run_aux(OperationKind::Rollback, Aux::Rollback, out);
                self.settle(false, out);
            }
            (OfferPhase::ApplyingAnswer(_), Ok(_)) => {
                self.rounds_completed += 1;
                self.remote_description_applied(out);
                tracing::debug!(
                    target = "negotiation",
                    remote = %self.remote_peer,
                    rounds = self.rounds_completed,
                    "answer applied; round complete"
                );
                self.settle(true, out);
            }
            (OfferPhase::ApplyingAnswer(_), Err(err)) => {
                self.fail(NegotiationStage::ApplyRemoteAnswer, &err, out);
                self.run_aux(OperationKind::Rollback, Aux::Rollback, out);
                self.settle(false, out);
            }
            (OfferPhase::AwaitingAnswer, _) => {}
        }
    }

    fn complete_answer(
        &mut self,
        renegotiation: bool,
        phase: AnswerPhase,
        result: Result<OpOutput, OpFailure>,
        out: &mut Vec<Effect>,
    ) {
        match (phase, result) {
            (AnswerPhase::ApplyingRemote(_), Ok(_)) => {
                self.remote_description_applied(out);
                self.continue_answer(renegotiation, out);
            }
            (AnswerPhase::ApplyingRemote(_), Err(err)) => {
                self.fail(NegotiationStage::ApplyRemoteOffer, &err, out);
                self.refuse_offer(renegotiation, out);
                self.settle(false, out);
            }
            (AnswerPhase::AcquiringMedia(_), Ok(OpOutput::Tracks(tracks))) => {
                let fresh = self.fresh_tracks(&tracks);
                if fresh.is_empty() {
                    self.create_answer(renegotiation, out);
                } else {
                    self.add_answer_tracks(renegotiation, fresh, out);
                }
            }
            (AnswerPhase::AcquiringMedia(_), Ok(_)) => self.create_answer(renegotiation, out),
            (AnswerPhase::AcquiringMedia(_), Err(err)) => {
                self.media_failed(err, out);
                self.abort_round(renegotiation, out);
            }
            (AnswerPhase::AddingTracks(_, tracks), Ok(_)) => {
                self.local_tracks.merge(&tracks);
                self.staged = self.fresh_tracks(&self.staged);
                self.create_answer(renegotiation, out);
            }
            (AnswerPhase::AddingTracks(..), Err(err)) => {
                self.fail(NegotiationStage::AddTracks, &err, out);
                self.abort_round(renegotiation, out);
            }
            (AnswerPhase::Creating(_), Ok(OpOutput::Description(description))) => {
                let op = self.run(OperationKind::SetLocal(description.clone()), out);
                self.step = Step::Answering {
                    renegotiation,
                    phase: AnswerPhase::ApplyingLocal(op, description),
                };
            }
            (AnswerPhase::Creating(_), Ok(_)) => {
                self.fail(
                    NegotiationStage::CreateAnswer,
                    &OpFailure::Handle(HandleError::Platform("no description produced".into())),
                    out,
                );
                self.abort_round(renegotiation, out);
            }
            (AnswerPhase::Creating(_), Err(err)) => {
                self.fail(NegotiationStage::CreateAnswer, &err, out);
                self.abort_round(renegotiation, out);
            }
            (AnswerPhase::ApplyingLocal(_, description), Ok(_)) => {
                self.answers_sent += 1;
                self.rounds_completed += 1;
                tracing::debug!(
                    target = "negotiation",
                    remote = %self.remote_peer,
                    renegotiation,
                    rounds = self.rounds_completed,
                    "sending answer; round complete"
                );
                self.send(
                    SignalBody::Answer {
                        description,
                        renegotiation,
                    },
                    out,
                );
                self.settle(true, out);
            }
            (AnswerPhase::ApplyingLocal(..), Err(err)) => {
                self.fail(NegotiationStage::ApplyLocalAnswer, &err, out);
                self.abort_round(renegotiation, out);
            }
        }
    }

    /// Staged tracks stay staged until the handle has them, so a failed
    /// answer can carry them again next time.
    fn continue_answer(&mut self, renegotiation: bool, out: &mut Vec<Effect>) {
        let fresh = self.fresh_tracks(&self.staged);
        if !fresh.is_empty() {
            self.add_answer_tracks(renegotiation, fresh, out);
            return;
        }
        if self.capture_on_answer && !self.media_requested && self.local_tracks.is_empty() {
            self.media_requested = true;
            let op = self.run(OperationKind::AcquireMedia, out);
            self.step = Step::Answering {
                renegotiation,
                phase: AnswerPhase::AcquiringMedia(op),
            };
            return;
        }
        self.create_answer(renegotiation, out);
    }

    fn add_answer_tracks(&mut self, renegotiation: bool, tracks: TrackSet, out: &mut Vec<Effect>) {
        let op = self.run(OperationKind::AddTracks(tracks.clone()), out);
        self.step = Step::Answering {
            renegotiation,
            phase: AnswerPhase::AddingTracks(op, tracks),
        };
    }

    fn create_answer(&mut self, renegotiation: bool, out: &mut Vec<Effect>) {
        let op = self.run(OperationKind::CreateAnswer, out);
        self.step = Step::Answering {
            renegotiation,
            phase: AnswerPhase::Creating(op),
        };
    }

    /// Back in stable: pick up whatever waited for this moment.
    fn settle(&mut self, completed: bool, out: &mut Vec<Effect>) {
        self.step = Step::Stable;
        if let Some((description, renegotiation)) = self.queued_offer.take() {
            self.on_remote_offer(description, renegotiation, out);
            return;
        }
        if completed && !self.staged.is_empty() {
            self.flush_staged(out);
        }
        if self.trigger.on_stable() {
            if completed {
                self.start_negotiation(out);
            } else {
                tracing::debug!(
                    target = "negotiation",
                    remote = %self.remote_peer,
                    "round failed; dropping deferred negotiation"
                );
            }
        }
    }
}

fn phase_op(phase: &OfferPhase) -> Option<OpId> {
    match phase {
        OfferPhase::Creating(op) | OfferPhase::ApplyingLocal(op, _) | OfferPhase::ApplyingAnswer(op) => {
            Some(*op)
        }
        OfferPhase::AwaitingAnswer => None,
    }
}

fn answer_op(phase: &AnswerPhase) -> OpId {
    match phase {
        AnswerPhase::ApplyingRemote(op)
        | AnswerPhase::AcquiringMedia(op)
        | AnswerPhase::AddingTracks(op, _)
        | AnswerPhase::Creating(op)
        | AnswerPhase::ApplyingLocal(op, _) => *op,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;

    const PAIRING: &str = "pairing-1";

    fn session(politeness: Politeness) -> NegotiationSession {
        NegotiationSession::new(SessionParams {
            remote_peer: PeerId::from("remote"),
            pairing_id: PAIRING.into(),
            politeness,
            capture_on_start: false,
            capture_on_answer: false,
            initial_tracks: TrackSet::new(),
        })
    }

    fn ops(effects: &[Effect]) -> Vec<Operation> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Run(op) => Some(op.clone()),
                _ => None,
            })
            .collect()
    }

    fn sent(effects: &[Effect]) -> Vec<SignalBody> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Send(signal) => Some(signal.body.clone()),
                _ => None,
            })
            .collect()
    }

    fn events(effects: &[Effect]) -> Vec<SessionEvent> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Notify(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    fn single(effects: &[Effect]) -> Operation {
        let ops = ops(effects);
        assert_eq!(ops.len(), 1, "expected one operation, got {ops:?}");
        ops.into_iter().next().unwrap()
    }

    fn complete(session: &mut NegotiationSession, op: &Operation, output: OpOutput) -> Vec<Effect> {
        session.handle(SessionInput::OpCompleted {
            op: op.id,
            result: Ok(output),
        })
    }

    fn fail(session: &mut NegotiationSession, op: &Operation, error: HandleError) -> Vec<Effect> {
        session.handle(SessionInput::OpCompleted {
            op: op.id,
            result: Err(OpFailure::Handle(error)),
        })
    }

    fn remote(description: SessionDescription, renegotiation: bool) -> SessionInput {
        SessionInput::RemoteDescription {
            pairing_id: PAIRING.into(),
            description,
            renegotiation,
        }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000 typ host"))
    }

    /// Drive an offer up to the point where it waits for the answer.
    fn offer_sent(session: &mut NegotiationSession) -> SessionDescription {
        let effects = session.handle(SessionInput::NegotiationNeeded);
        let create = single(&effects);
        assert_eq!(create.kind, OperationKind::CreateOffer);
        let offer = SessionDescription::offer("local-offer");
        let effects = complete(session, &create, OpOutput::Description(offer.clone()));
        let apply = single(&effects);
        assert_eq!(apply.kind, OperationKind::SetLocal(offer.clone()));
        let effects = complete(session, &apply, OpOutput::Done);
        assert_eq!(sent(&effects).len(), 1);
        offer
    }

    /// Answer a remote offer all the way to the outgoing answer.
    fn answer(session: &mut NegotiationSession, renegotiation: bool) -> Vec<Effect> {
        let effects = session.handle(remote(SessionDescription::offer("remote-offer"), renegotiation));
        let apply = single(&effects);
        assert!(matches!(apply.kind, OperationKind::SetRemote(_)));
        let effects = complete(session, &apply, OpOutput::Done);
        let create = single(&effects);
        assert_eq!(create.kind, OperationKind::CreateAnswer);
        let effects = complete(
            session,
            &create,
            OpOutput::Description(SessionDescription::answer("local-answer")),
        );
        let apply = single(&effects);
        complete(session, &apply, OpOutput::Done)
    }

    #[test]
    fn politeness_follows_join_order() {
        assert_eq!(Politeness::from_join_order(1, 2).unwrap(), Politeness::Impolite);
        assert_eq!(Politeness::from_join_order(5, 2).unwrap(), Politeness::Polite);
        assert!(matches!(
            Politeness::from_join_order(3, 3),
            Err(NegotiationError::PolitenessConflict(3))
        ));
        assert_eq!(Politeness::Impolite.initial_role(), Role::Offerer);
    }

    #[test]
    fn offer_round_runs_create_apply_send_then_answer() {
        let mut s = session(Politeness::Impolite);
        let effects = s.handle(SessionInput::Start);
        assert_eq!(single(&effects).kind, OperationKind::CreateOffer);
        assert!(s.snapshot().making_offer);

        let create = single(&effects);
        let offer = SessionDescription::offer("o1");
        let effects = complete(&mut s, &create, OpOutput::Description(offer.clone()));
        let apply = single(&effects);
        assert!(sent(&effects).is_empty());
        assert!(s.snapshot().making_offer);

        let effects = complete(&mut s, &apply, OpOutput::Done);
        assert_eq!(
            sent(&effects),
            vec![SignalBody::Offer {
                description: offer,
                renegotiation: false
            }]
        );
        let snap = s.snapshot();
        assert!(!snap.making_offer);
        assert_eq!(snap.signaling_state, SignalingState::HaveLocalOffer);
        assert_eq!(snap.offers_sent, 1);

        let effects = s.handle(remote(SessionDescription::answer("a1"), false));
        let apply = single(&effects);
        complete(&mut s, &apply, OpOutput::Done);
        let snap = s.snapshot();
        assert_eq!(snap.signaling_state, SignalingState::Stable);
        assert_eq!(snap.rounds_completed, 1);
    }

    #[test]
    fn triggers_during_an_offer_collapse_into_one() {
        let mut s = session(Politeness::Impolite);
        let first = s.handle(SessionInput::NegotiationNeeded);
        assert_eq!(ops(&first).len(), 1);
        for _ in 0..3 {
            assert!(s.handle(SessionInput::NegotiationNeeded).is_empty());
        }
        let create = single(&first);
        let effects = complete(&mut s, &create, OpOutput::Description(SessionDescription::offer("o")));
        let apply = single(&effects);
        let effects = complete(&mut s, &apply, OpOutput::Done);
        assert_eq!(sent(&effects).len(), 1);
        assert_eq!(s.snapshot().offers_sent, 1);
    }

    #[test]
    fn trigger_while_awaiting_answer_fires_once_when_stable() {
        let mut s = session(Politeness::Impolite);
        offer_sent(&mut s);
        assert!(s.handle(SessionInput::NegotiationNeeded).is_empty());
        assert!(s.handle(SessionInput::NegotiationNeeded).is_empty());

        let effects = s.handle(remote(SessionDescription::answer("a"), false));
        let apply = single(&effects);
        let effects = complete(&mut s, &apply, OpOutput::Done);
        let create = single(&effects);
        assert_eq!(create.kind, OperationKind::CreateOffer);

        let effects = complete(&mut s, &create, OpOutput::Description(SessionDescription::offer("o2")));
        let apply = single(&effects);
        let effects = complete(&mut s, &apply, OpOutput::Done);
        assert!(matches!(
            sent(&effects).as_slice(),
            [SignalBody::Offer {
                renegotiation: true,
                ..
            }]
        ));
    }

    #[test]
    fn polite_side_ignores_a_colliding_offer() {
        let mut s = session(Politeness::Polite);
        // Finish a first round so the polite side may offer.
        answer(&mut s, false);
        offer_sent(&mut s);

        let effects = s.handle(remote(SessionDescription::offer("theirs"), true));
        assert!(effects.is_empty());
        let snap = s.snapshot();
        assert!(snap.ignore_offer);
        assert_eq!(snap.offers_ignored, 1);
        assert_eq!(snap.signaling_state, SignalingState::HaveLocalOffer);

        let effects = s.handle(remote(SessionDescription::answer("their answer"), true));
        let apply = single(&effects);
        complete(&mut s, &apply, OpOutput::Done);
        assert_eq!(s.snapshot().rounds_completed, 2);
    }

    #[test]
    fn impolite_side_rolls_back_and_answers() {
        let mut s = session(Politeness::Impolite);
        offer_sent(&mut s);

        let theirs = SessionDescription::offer("theirs");
        let effects = s.handle(remote(theirs.clone(), false));
        let kinds: Vec<_> = ops(&effects).into_iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![OperationKind::Rollback, OperationKind::SetRemote(theirs)]);
        assert!(!s.snapshot().ignore_offer);

        let all = ops(&effects);
        complete(&mut s, &all[0], OpOutput::Done);
        let effects = complete(&mut s, &all[1], OpOutput::Done);
        let create = single(&effects);
        let effects = complete(
            &mut s,
            &create,
            OpOutput::Description(SessionDescription::answer("mine")),
        );
        let apply = single(&effects);
        let effects = complete(&mut s, &apply, OpOutput::Done);
        assert!(matches!(
            sent(&effects).as_slice(),
            [SignalBody::Answer {
                renegotiation: false,
                ..
            }]
        ));
        let snap = s.snapshot();
        assert_eq!(snap.role, Role::Answerer);
        assert_eq!(snap.answers_sent, 1);
    }

    #[test]
    fn impolite_side_abandons_an_offer_still_being_created() {
        let mut s = session(Politeness::Impolite);
        let effects = s.handle(SessionInput::NegotiationNeeded);
        let create = single(&effects);

        let effects = s.handle(remote(SessionDescription::offer("theirs"), false));
        let apply = single(&effects);
        assert!(matches!(apply.kind, OperationKind::SetRemote(_)));
        assert!(!s.snapshot().making_offer);

        let late = complete(&mut s, &create, OpOutput::Description(SessionDescription::offer("late")));
        assert!(late.is_empty());

        let effects = complete(&mut s, &apply, OpOutput::Done);
        assert_eq!(single(&effects).kind, OperationKind::CreateAnswer);
    }

    #[test]
    fn answer_without_outstanding_offer_is_discarded() {
        let mut s = session(Politeness::Impolite);
        assert!(s.handle(remote(SessionDescription::answer("stale"), false)).is_empty());
        assert_eq!(s.snapshot().signaling_state, SignalingState::Stable);
    }

    #[test]
    fn answer_mirrors_renegotiation_flag() {
        let mut s = session(Politeness::Polite);
        let effects = answer(&mut s, false);
        assert!(matches!(
            sent(&effects).as_slice(),
            [SignalBody::Answer {
                renegotiation: false,
                ..
            }]
        ));
        let effects = answer(&mut s, true);
        assert!(matches!(
            sent(&effects).as_slice(),
            [SignalBody::Answer {
                renegotiation: true,
                ..
            }]
        ));
        assert_eq!(s.snapshot().rounds_completed, 2);
    }

    #[test]
    fn early_candidates_replay_in_order_after_remote_description() {
        let mut s = session(Politeness::Polite);
        for n in [1, 2, 1, 3] {
            let effects = s.handle(SessionInput::RemoteCandidate {
                pairing_id: PAIRING.into(),
                candidate: candidate(n),
            });
            assert!(effects.is_empty());
        }

        let effects = s.handle(remote(SessionDescription::offer("o"), false));
        let apply = single(&effects);
        let effects = complete(&mut s, &apply, OpOutput::Done);
        let kinds: Vec<_> = ops(&effects).into_iter().map(|op| op.kind).collect();
        assert_eq!(
            kinds,
            vec![
                OperationKind::AddIceCandidate(candidate(1)),
                OperationKind::AddIceCandidate(candidate(2)),
                OperationKind::AddIceCandidate(candidate(3)),
                OperationKind::CreateAnswer,
            ]
        );

        let late = s.handle(SessionInput::RemoteCandidate {
            pairing_id: PAIRING.into(),
            candidate: candidate(4),
        });
        assert_eq!(
            single(&late).kind,
            OperationKind::AddIceCandidate(candidate(4))
        );
        let rejected = fail(&mut s, &single(&late), HandleError::DuplicateCandidate);
        assert!(rejected.is_empty());
    }

    #[test]
    fn messages_from_another_pairing_are_dropped() {
        let mut s = session(Politeness::Polite);
        let effects = s.handle(SessionInput::RemoteDescription {
            pairing_id: "old".into(),
            description: SessionDescription::offer("o"),
            renegotiation: false,
        });
        assert!(effects.is_empty());
        let effects = s.handle(SessionInput::RemoteCandidate {
            pairing_id: "old".into(),
            candidate: candidate(1),
        });
        assert!(effects.is_empty());
    }

    #[test]
    fn local_candidates_are_addressed_to_the_remote_peer() {
        let mut s = session(Politeness::Impolite);
        let effects = s.handle(SessionInput::LocalCandidate(candidate(1)));
        match effects.as_slice() {
            [Effect::Send(signal)] => {
                assert_eq!(signal.target, PeerId::from("remote"));
                assert_eq!(signal.pairing_id, PAIRING);
                assert_eq!(signal.body, SignalBody::Candidate(candidate(1)));
            }
            other => panic!("unexpected effects {other:?}"),
        }
        assert!(s.handle(SessionInput::LocalCandidate(candidate(1))).is_empty());
    }

    #[test]
    fn failed_offer_is_reported_and_not_retried() {
        let mut s = session(Politeness::Impolite);
        let effects = s.handle(SessionInput::NegotiationNeeded);
        let create = single(&effects);
        let effects = fail(&mut s, &create, HandleError::Platform("boom".into()));
        assert!(ops(&effects).is_empty());
        assert!(matches!(
            events(&effects).as_slice(),
            [SessionEvent::NegotiationFailed {
                stage: NegotiationStage::CreateOffer,
                ..
            }]
        ));
        assert!(!s.snapshot().making_offer);
        assert_eq!(s.snapshot().offers_sent, 0);
    }

    #[test]
    fn failed_remote_answer_rolls_back() {
        let mut s = session(Politeness::Impolite);
        offer_sent(&mut s);
        let effects = s.handle(remote(SessionDescription::answer("bad"), false));
        let apply = single(&effects);
        let effects = fail(&mut s, &apply, HandleError::Rejected("bad sdp".into()));
        assert_eq!(single(&effects).kind, OperationKind::Rollback);
        assert_eq!(s.snapshot().signaling_state, SignalingState::Stable);
        assert_eq!(s.snapshot().rounds_completed, 0);
    }

    #[test]
    fn failed_connection_tears_the_session_down() {
        let mut s = session(Politeness::Impolite);
        let effects = s.handle(SessionInput::ConnectionState(ConnectionState::Connecting));
        assert_eq!(
            events(&effects),
            vec![SessionEvent::ConnectionStateChanged(ConnectionState::Connecting)]
        );

        let effects = s.handle(SessionInput::ConnectionState(ConnectionState::Failed));
        assert!(effects.contains(&Effect::CloseHandle));
        assert!(events(&effects).contains(&SessionEvent::Closed(CloseReason::ConnectionFailed)));
        assert!(s.is_closed());
        assert!(s.handle(SessionInput::NegotiationNeeded).is_empty());
    }

    #[test]
    fn answerer_acquires_media_before_first_answer() {
        let mut s = NegotiationSession::new(SessionParams {
            remote_peer: PeerId::from("remote"),
            pairing_id: PAIRING.into(),
            politeness: Politeness::Polite,
            capture_on_start: true,
            capture_on_answer: true,
            initial_tracks: TrackSet::new(),
        });
        assert!(s.handle(SessionInput::Start).is_empty());

        let effects = s.handle(remote(SessionDescription::offer("o"), false));
        let effects = complete(&mut s, &single(&effects), OpOutput::Done);
        let acquire = single(&effects);
        assert_eq!(acquire.kind, OperationKind::AcquireMedia);

        let mic = TrackSet::from(vec![MediaTrack::new("mic", MediaKind::Audio, "s")]);
        let effects = complete(&mut s, &acquire, OpOutput::Tracks(mic.clone()));
        let add = single(&effects);
        assert_eq!(add.kind, OperationKind::AddTracks(mic.clone()));
        let effects = complete(&mut s, &add, OpOutput::Done);
        assert_eq!(single(&effects).kind, OperationKind::CreateAnswer);
        assert_eq!(s.snapshot().local_tracks, mic);
    }

    #[test]
    fn media_failure_aborts_the_round() {
        let mut s = NegotiationSession::new(SessionParams {
            remote_peer: PeerId::from("remote"),
            pairing_id: PAIRING.into(),
            politeness: Politeness::Polite,
            capture_on_start: false,
            capture_on_answer: true,
            initial_tracks: TrackSet::new(),
        });
        let effects = s.handle(remote(SessionDescription::offer("o"), false));
        let effects = complete(&mut s, &single(&effects), OpOutput::Done);
        let acquire = single(&effects);
        let effects = s.handle(SessionInput::OpCompleted {
            op: acquire.id,
            result: Err(OpFailure::Media(MediaError::PermissionDenied("camera".into()))),
        });
        assert_eq!(single(&effects).kind, OperationKind::Rollback);
        assert_eq!(
            sent(&effects),
            vec![SignalBody::Answer {
                description: SessionDescription::rollback(),
                renegotiation: false,
            }]
        );
        assert_eq!(
            events(&effects),
            vec![SessionEvent::MediaAcquisitionFailed(MediaError::PermissionDenied(
                "camera".into()
            ))]
        );
        assert_eq!(s.snapshot().answers_sent, 0);
    }

    #[test]
    fn answerer_stages_tracks_until_first_offer() {
        let mut s = session(Politeness::Polite);
        let cam = TrackSet::from(vec![MediaTrack::new("cam", MediaKind::Video, "s")]);
        assert!(s.handle(SessionInput::AddLocalTracks(cam.clone())).is_empty());

        let effects = s.handle(remote(SessionDescription::offer("o"), false));
        let effects = complete(&mut s, &single(&effects), OpOutput::Done);
        assert_eq!(single(&effects).kind, OperationKind::AddTracks(cam));
    }

    #[test]
    fn refused_offer_rolls_the_offerer_back_so_either_side_can_retry() {
        let mut polite = session(Politeness::Polite);
        let mut impolite = session(Politeness::Impolite);
        answer(&mut polite, false);
        offer_sent(&mut impolite);
        let effects = impolite.handle(remote(SessionDescription::answer("first"), false));
        complete(&mut impolite, &single(&effects), OpOutput::Done);

        // The polite side renegotiates; the impolite side cannot apply it.
        let offer = offer_sent(&mut polite);
        let effects = impolite.handle(remote(offer, true));
        let apply = single(&effects);
        let effects = fail(&mut impolite, &apply, HandleError::Rejected("bad sdp".into()));
        assert!(ops(&effects).is_empty());
        let refusal = SessionDescription::rollback();
        assert_eq!(
            sent(&effects),
            vec![SignalBody::Answer {
                description: refusal.clone(),
                renegotiation: true,
            }]
        );
        assert_eq!(impolite.snapshot().signaling_state, SignalingState::Stable);

        let effects = polite.handle(remote(refusal, true));
        let rollback = single(&effects);
        assert_eq!(rollback.kind, OperationKind::Rollback);
        assert!(matches!(
            events(&effects).as_slice(),
            [SessionEvent::NegotiationFailed {
                stage: NegotiationStage::OfferRefused,
                ..
            }]
        ));
        complete(&mut polite, &rollback, OpOutput::Done);
        assert_eq!(polite.snapshot().signaling_state, SignalingState::Stable);

        // The impolite retry is answered rather than treated as a collision.
        let retry = offer_sent(&mut impolite);
        let effects = polite.handle(remote(retry, true));
        let apply = single(&effects);
        assert!(matches!(apply.kind, OperationKind::SetRemote(_)));
        let effects = complete(&mut polite, &apply, OpOutput::Done);
        let create = single(&effects);
        let reply = SessionDescription::answer("retry-answer");
        let effects = complete(&mut polite, &create, OpOutput::Description(reply.clone()));
        let effects = complete(&mut polite, &single(&effects), OpOutput::Done);
        assert_eq!(
            sent(&effects),
            vec![SignalBody::Answer {
                description: reply.clone(),
                renegotiation: true,
            }]
        );
        assert_eq!(polite.snapshot().offers_ignored, 0);

        let effects = impolite.handle(remote(reply, true));
        complete(&mut impolite, &single(&effects), OpOutput::Done);
        assert_eq!(impolite.snapshot().rounds_completed, 2);
        assert_eq!(polite.snapshot().rounds_completed, 2);

        // And the polite side can start a round of its own again.
        let effects = polite.handle(SessionInput::NegotiationNeeded);
        assert_eq!(single(&effects).kind, OperationKind::CreateOffer);
    }

    #[test]
    fn refusal_without_an_outstanding_offer_is_ignored() {
        let mut s = session(Politeness::Impolite);
        assert!(s.handle(remote(SessionDescription::rollback(), false)).is_empty());
        assert_eq!(s.snapshot().signaling_state, SignalingState::Stable);
    }

    #[test]
    fn staged_tracks_survive_a_failed_first_answer() {
        let mut s = session(Politeness::Polite);
        let cam = TrackSet::from(vec![MediaTrack::new("cam", MediaKind::Video, "s")]);
        assert!(s.handle(SessionInput::AddLocalTracks(cam.clone())).is_empty());

        let effects = s.handle(remote(SessionDescription::offer("first"), false));
        let effects = complete(&mut s, &single(&effects), OpOutput::Done);
        let add = single(&effects);
        assert_eq!(add.kind, OperationKind::AddTracks(cam.clone()));
        let effects = fail(&mut s, &add, HandleError::Platform("no encoder".into()));
        assert_eq!(single(&effects).kind, OperationKind::Rollback);
        assert!(s.snapshot().local_tracks.is_empty());

        let effects = s.handle(remote(SessionDescription::offer("second"), false));
        let effects = complete(&mut s, &single(&effects), OpOutput::Done);
        let add = single(&effects);
        assert_eq!(add.kind, OperationKind::AddTracks(cam.clone()));
        let effects = complete(&mut s, &add, OpOutput::Done);
        assert_eq!(single(&effects).kind, OperationKind::CreateAnswer);
        assert_eq!(s.snapshot().local_tracks, cam);
    }

    #[test]
    fn tracks_that_fail_to_attach_are_retried_with_the_next_batch() {
        let mut s = session(Politeness::Impolite);
        let cam = MediaTrack::new("cam", MediaKind::Video, "s");
        let mic = MediaTrack::new("mic", MediaKind::Audio, "s");
        let effects = s.handle(SessionInput::AddLocalTracks(TrackSet::from(vec![cam.clone()])));
        let add = single(&effects);
        fail(&mut s, &add, HandleError::Platform("busy".into()));

        let effects = s.handle(SessionInput::AddLocalTracks(TrackSet::from(vec![mic.clone()])));
        assert_eq!(
            single(&effects).kind,
            OperationKind::AddTracks(TrackSet::from(vec![cam, mic]))
        );
    }

    #[test]
    fn offerer_starts_with_capture_then_waits_for_the_handle() {
        let mut s = NegotiationSession::new(SessionParams {
            remote_peer: PeerId::from("remote"),
            pairing_id: PAIRING.into(),
            politeness: Politeness::Impolite,
            capture_on_start: true,
            capture_on_answer: true,
            initial_tracks: TrackSet::new(),
        });
        let effects = s.handle(SessionInput::Start);
        let acquire = single(&effects);
        assert_eq!(acquire.kind, OperationKind::AcquireMedia);
        let tracks = TrackSet::from(vec![MediaTrack::new("mic", MediaKind::Audio, "s")]);
        let effects = complete(&mut s, &acquire, OpOutput::Tracks(tracks.clone()));
        let add = single(&effects);
        assert_eq!(add.kind, OperationKind::AddTracks(tracks));
        assert!(complete(&mut s, &add, OpOutput::Done).is_empty());

        let effects = s.handle(SessionInput::NegotiationNeeded);
        assert_eq!(single(&effects).kind, OperationKind::CreateOffer);
    }

    #[test]
    fn remote_tracks_are_announced_once() {
        let mut s = session(Politeness::Polite);
        let track = MediaTrack::new("cam", MediaKind::Video, "s");
        let effects = s.handle(SessionInput::RemoteTrack(track.clone()));
        assert_eq!(events(&effects), vec![SessionEvent::RemoteTrackAvailable(track.clone())]);
        assert!(s.handle(SessionInput::RemoteTrack(track)).is_empty());
    }
}
