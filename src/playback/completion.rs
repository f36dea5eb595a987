//! # Completion Handshake
//!
//! Once the remote sender marks the end of a turn (an `isFinal` fragment or
//! a separate `stream-complete` event), the engine waits for silence and
//! tells the sender exactly once that the turn finished playing. The sender
//! paces its next turn on that notification.
//!
//! ## Handshake:
//! 1. **Trigger**: end-of-turn marker arrives, a check is armed after a
//!    short quiescence delay
//! 2. **Poll**: while anything is registered or queued, re-check on a fixed
//!    interval
//! 3. **Notify**: on silence, record the id in the ledger and notify; a
//!    duplicate marker for a recorded id is swallowed

use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

/// Bounded memory of turns whose completion was already sent.
/// The oldest entry is evicted once capacity is exceeded.
#[derive(Debug)]
pub struct ProcessedContextLedger {
    capacity: usize,
    entries: VecDeque<String>,
}

impl ProcessedContextLedger {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn contains(&self, context_id: &str) -> bool {
        self.entries.iter().any(|id| id == context_id)
    }

    /// Remember `context_id`; returns the evicted id, if any.
    pub fn record(&mut self, context_id: &str) -> Option<String> {
        if self.contains(context_id) {
            return None;
        }
        self.entries.push_back(context_id.to_string());
        if self.entries.len() > self.capacity {
            self.entries.pop_front()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Context ids that upstream sends when it has no real id.
pub fn is_sentinel_context(context_id: &str) -> bool {
    let trimmed = context_id.trim();
    trimmed.is_empty() || trimmed == "null" || trimmed == "undefined"
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A drain check should be armed
    Armed,
    /// A check for this id is already polling
    AlreadyPending,
    /// Missing or sentinel id
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainCheck {
    /// Audio still playing or queued; check again later
    Waiting,
    /// Drained and not yet notified: send the completion now
    Notify,
    /// Drained, but this id was already notified
    Duplicate,
    /// No handshake is pending for this id (stale timer)
    NotPending,
}

#[derive(Debug)]
pub struct CompletionHandshake {
    ledger: ProcessedContextLedger,
    pending: HashSet<String>,
    notified: u64,
    suppressed: u64,
}

impl CompletionHandshake {
    pub fn new(ledger_capacity: usize) -> Self {
        Self {
            ledger: ProcessedContextLedger::new(ledger_capacity),
            pending: HashSet::new(),
            notified: 0,
            suppressed: 0,
        }
    }

    /// End-of-turn marker for `context_id`.
    pub fn trigger(&mut self, context_id: &str) -> TriggerOutcome {
        if is_sentinel_context(context_id) {
            warn!(context_id = %context_id, "Ignoring completion for missing context id");
            return TriggerOutcome::Ignored;
        }
        if !self.pending.insert(context_id.to_string()) {
            debug!(context_id = %context_id, "Completion already pending");
            return TriggerOutcome::AlreadyPending;
        }
        TriggerOutcome::Armed
    }

    /// Evaluate one poll for `context_id` given the current drain condition.
    pub fn check(&mut self, context_id: &str, drained: bool) -> DrainCheck {
        if !self.pending.contains(context_id) {
            return DrainCheck::NotPending;
        }
        if !drained {
            return DrainCheck::Waiting;
        }

        self.pending.remove(context_id);
        if self.ledger.contains(context_id) {
            self.suppressed += 1;
            debug!(context_id = %context_id, "Duplicate completion suppressed");
            return DrainCheck::Duplicate;
        }

        if let Some(evicted) = self.ledger.record(context_id) {
            debug!(evicted = %evicted, "Ledger full, evicted oldest context");
        }
        self.notified += 1;
        DrainCheck::Notify
    }

    pub fn is_pending(&self, context_id: &str) -> bool {
        self.pending.contains(context_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn ledger(&self) -> &ProcessedContextLedger {
        &self.ledger
    }

    pub fn notified(&self) -> u64 {
        self.notified
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}
