//! Candidate buffering in both directions.
//!
//! Outbound candidates wait for a remote peer id; inbound candidates wait
//! for the first successfully applied remote description. Both queues
//! release in arrival order. Candidates seen before are dropped.

use std::collections::{HashSet, VecDeque};
use wave_proto::{IceCandidate, PeerId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Forward(PeerId, IceCandidate),
    Queued,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Apply(IceCandidate),
    Queued,
    Duplicate,
}

#[derive(Debug, Default)]
pub struct IceCandidateRelay {
    remote_peer: Option<PeerId>,
    remote_description_applied: bool,
    outbound: VecDeque<IceCandidate>,
    inbound: VecDeque<IceCandidate>,
    seen_local: HashSet<IceCandidate>,
    seen_remote: HashSet<IceCandidate>,
}

impl IceCandidateRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remote_peer(&self) -> Option<&PeerId> {
        self.remote_peer.as_ref()
    }

    pub fn on_local_candidate(&mut self, candidate: IceCandidate) -> Outbound {
        if !self.seen_local.insert(candidate.clone()) {
            return Outbound::Duplicate;
        }
        match &self.remote_peer {
            Some(peer) => Outbound::Forward(peer.clone(), candidate),
            None => {
                self.outbound.push_back(candidate);
                Outbound::Queued
            }
        }
    }

    /// Returns queued local candidates, oldest first, now addressed to `peer`.
    pub fn assign_remote_peer(&mut self, peer: PeerId) -> Vec<(PeerId, IceCandidate)> {
        self.remote_peer = Some(peer.clone());
        self.outbound
            .drain(..)
            .map(|candidate| (peer.clone(), candidate))
            .collect()
    }

    pub fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Inbound {
        if !self.seen_remote.insert(candidate.clone()) {
            return Inbound::Duplicate;
        }
        if self.remote_description_applied {
            Inbound::Apply(candidate)
        } else {
            self.inbound.push_back(candidate);
            Inbound::Queued
        }
    }

    /// Mark the remote description applied and release the inbound backlog.
    pub fn remote_description_applied(&mut self) -> Vec<IceCandidate> {
        self.remote_description_applied = true;
        self.inbound.drain(..).collect()
    }

    /// The only remote description was rolled back; start buffering again.
    pub fn remote_description_cleared(&mut self) {
        self.remote_description_applied = false;
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_applied
    }

    pub fn queued_inbound(&self) -> usize {
        self.inbound.len()
    }

    pub fn queued_outbound(&self) -> usize {
        self.outbound.len()
    }
}
