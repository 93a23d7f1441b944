use thiserror::Error;
use wave_proto::PeerId;

use crate::handle::HandleError;
use crate::media::MediaError;
use crate::signaling::TransportError;
use crate::signaling::router::RouteError;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("both peers hold join sequence {0}; politeness is undefined")]
    PolitenessConflict(u64),
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("no session with peer {0}")]
    UnknownSession(PeerId),
    #[error("negotiation engine has shut down")]
    EngineClosed,
}
