use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::signaling::IceCandidate;

/// A remote candidate waiting for a remote description to exist.
#[derive(Debug, Clone)]
pub struct PendingCandidate {
    pub candidate: IceCandidate,
    pub received_at: DateTime<Utc>,
}

/// FIFO buffer for remote ICE candidates that arrive before the peer
/// connection has a remote description.
///
/// Duplicates are legal in ICE and are passed through untouched.
#[derive(Debug, Default)]
pub struct IceCandidateQueue {
    entries: VecDeque<PendingCandidate>,
}

impl IceCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.entries.push_back(PendingCandidate {
            candidate,
            received_at: Utc::now(),
        });
    }

    /// Remove every entry, oldest first.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.entries.drain(..).map(|p| p.candidate).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Arrival time of the oldest queued candidate.
    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.entries.front().map(|p| p.received_at)
    }
}
