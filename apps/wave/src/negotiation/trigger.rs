//! Coalescing of negotiation-needed signals.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    /// Begin a new offer now.
    Start,
    /// An offer is already being produced; this signal adds nothing.
    Coalesced,
    /// The session is mid-round; fire once when it is stable again.
    Deferred,
}

#[derive(Debug, Default, Clone)]
pub struct NegotiationTrigger {
    deferred: bool,
    coalesced: u64,
}

impl NegotiationTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// `in_flight`: an offer is being created or applied locally.
    /// `busy`: the session is not stable for any other reason.
    pub fn on_needed(&mut self, in_flight: bool, busy: bool) -> TriggerDecision {
        if in_flight {
            self.coalesced += 1;
            return TriggerDecision::Coalesced;
        }
        if busy {
            if self.deferred {
                self.coalesced += 1;
                return TriggerDecision::Coalesced;
            }
            self.deferred = true;
            return TriggerDecision::Deferred;
        }
        TriggerDecision::Start
    }

    /// Called when the session returns to stable. True when a deferred
    /// signal should start an offer now.
    pub fn on_stable(&mut self) -> bool {
        std::mem::take(&mut self.deferred)
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }
}
