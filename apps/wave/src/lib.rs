pub mod config;
pub mod engine;
pub mod error;
pub mod handle;
pub mod media;
pub mod negotiation;
pub mod signaling;
pub mod telemetry;

pub use config::{EngineConfig, IceServer};
pub use engine::{EngineEvent, EngineHandle, NegotiationEngine};
pub use error::NegotiationError;
pub use negotiation::{Politeness, SessionSnapshot};
