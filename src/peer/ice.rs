use crate::peer::types::IceCandidate;
use tracing::{debug, info, warn};

/// Remote candidates received before the remote description is set.
///
/// Nothing is dropped for arriving early: `accept` parks the candidate and
/// `release` hands the backlog back, in arrival order, once the description
/// has been applied.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: Vec<IceCandidate>,
    remote_description_set: bool,
    received: usize,
    applied: usize,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some` when the candidate can be applied right away.
    pub fn accept(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        self.received += 1;
        if self.remote_description_set {
            Some(candidate)
        } else {
            debug!(
                pending = self.pending.len() + 1,
                "remote description not set yet, queuing candidate"
            );
            self.pending.push(candidate);
            None
        }
    }

    /// Marks the remote description as applied and drains the backlog.
    pub fn release(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        std::mem::take(&mut self.pending)
    }

    pub fn record_applied(&mut self) {
        self.applied += 1;
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn applied(&self) -> usize {
        self.applied
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateStats {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

/// Counts candidate types and warns when no relay candidate was gathered.
pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateStats {
    let mut stats = CandidateStats::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            stats.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            stats.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            stats.relay += 1;
        }
    }

    info!(
        host = stats.host,
        srflx = stats.srflx,
        relay = stats.relay,
        "candidate analysis"
    );

    if stats.relay == 0 && !candidates.is_empty() {
        warn!("no TURN relay candidates gathered, connection through NAT may fail");
    }
    stats
}
