//! Per-client Lamport clock.
//!
//! Every local write is stamped with a freshly incremented counter, and every
//! observed remote version advances the counter to at least its value, so a
//! local write made after seeing a remote version always supersedes it.

use crate::types::{ClientId, SyncMetadata};

/// A monotonically increasing per-client counter.
///
/// Monotonicity across restarts is the caller's responsibility: resume the
/// clock from the highest counter found in persisted state (see
/// [`LamportClock::resume`]).
#[derive(Debug, Clone)]
pub struct LamportClock {
    origin: ClientId,
    counter: u64,
}

impl LamportClock {
    /// Fresh clock starting at zero.
    pub fn new(origin: impl Into<ClientId>) -> Self {
        Self {
            origin: origin.into(),
            counter: 0,
        }
    }

    /// Resume from the highest counter observed in persisted state.
    pub fn resume(origin: impl Into<ClientId>, counter: u64) -> Self {
        Self {
            origin: origin.into(),
            counter,
        }
    }

    /// Increment the clock and stamp metadata for a new local write.
    pub fn tick(&mut self) -> SyncMetadata {
        self.counter += 1;
        SyncMetadata::new(self.origin.clone(), self.counter)
    }

    /// Advance the clock past a remote version so subsequent local writes
    /// are causally after it.
    pub fn observe(&mut self, remote: &SyncMetadata) {
        self.counter = self.counter.max(remote.counter);
    }

    /// Current counter value (last stamped).
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// The client id this clock stamps.
    pub fn origin(&self) -> &str {
        &self.origin
    }
}
