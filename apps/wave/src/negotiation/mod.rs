//! Perfect negotiation for a single pairing.
//!
//! [`session`] holds the state machine, [`ice`] the candidate buffers and
//! [`trigger`] the coalescing of negotiation-needed signals. None of them
//! perform I/O; the engine's driver executes what they decide.

pub mod ice;
pub mod session;
pub mod trigger;

pub use ice::IceCandidateRelay;
pub use session::{
    CloseReason, Effect, NegotiationSession, NegotiationStage, OpFailure, OpId, OpOutput,
    Operation, OperationKind, OutboundSignal, Politeness, Role, SessionEvent, SessionInput,
    SessionParams, SessionSnapshot, SignalBody,
};
pub use trigger::{NegotiationTrigger, TriggerDecision};
